//! Gateway server
//!
//! Assembles the decision engine from explicitly injected adapters, wraps a
//! downstream router with the gate and header layers, and runs the whole
//! thing with graceful shutdown. No lazily-initialized globals: tests build
//! the same state with fakes per case.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Json, Router, middleware, routing::get};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use super::engine::{AccessEngine, Identity};
use super::headers::{CorsPolicy, security_headers};
use super::middleware::{GatewayState, gate_middleware};
use crate::config::Config;
use crate::ratelimit::{InMemoryRateLimiter, RateLimiter};
use crate::session::{InMemorySessionStore, InMemoryUserDirectory, SessionStore, UserDirectory};
use crate::token::{InMemoryRevocationStore, RevocationStore, TokenService};
use crate::{Error, Result};

/// Injected collaborators: the identity-subsystem adapters the gateway
/// consumes but does not own
pub struct GatewayDeps {
    /// Rate-limit window store
    pub limiter: Arc<dyn RateLimiter>,
    /// Session store
    pub sessions: Arc<dyn SessionStore>,
    /// User/role store
    pub directory: Arc<dyn UserDirectory>,
    /// Token revocation set
    pub revocation: Arc<dyn RevocationStore>,
}

impl GatewayDeps {
    /// All-in-memory adapters for single-instance deployments and tests
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            limiter: Arc::new(InMemoryRateLimiter::new()),
            sessions: Arc::new(InMemorySessionStore::new()),
            directory: Arc::new(InMemoryUserDirectory::new()),
            revocation: Arc::new(InMemoryRevocationStore::new()),
        }
    }
}

/// The request-security gateway
pub struct Gateway {
    config: Config,
    state: Arc<GatewayState>,
    cors: Arc<CorsPolicy>,
    limiter: Arc<dyn RateLimiter>,
    revocation: Arc<dyn RevocationStore>,
}

impl Gateway {
    /// Build the gateway from config and injected adapters
    ///
    /// # Errors
    ///
    /// Fails if the signing key cannot be resolved.
    pub fn new(config: Config, deps: GatewayDeps) -> Result<Self> {
        let tokens = Arc::new(TokenService::new(
            &config.tokens,
            config.server.upstream_timeout,
            Arc::clone(&deps.revocation),
        )?);
        let engine = AccessEngine::new(
            &config,
            Arc::clone(&deps.limiter),
            tokens,
            Arc::clone(&deps.sessions),
            Arc::clone(&deps.directory),
        );
        let state = Arc::new(GatewayState::new(&config, engine));
        let cors = Arc::new(CorsPolicy::new(&config.cors));

        Ok(Self {
            config,
            state,
            cors,
            limiter: deps.limiter,
            revocation: deps.revocation,
        })
    }

    /// Wrap a downstream router with the gate and header layers.
    ///
    /// Layer order (outermost first): trace, panic catch, security headers,
    /// gate. The header layer sits outside the gate so denials and redirects
    /// carry the security headers too.
    #[must_use]
    pub fn wrap(&self, downstream: Router) -> Router {
        downstream
            .layer(middleware::from_fn_with_state(
                Arc::clone(&self.state),
                gate_middleware,
            ))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&self.cors),
                security_headers,
            ))
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
    }

    /// Run the gateway in front of `downstream` until shutdown
    pub async fn run(self, downstream: Router) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

        // Periodic sweep: idle rate windows and expired revocation entries
        let limiter = Arc::clone(&self.limiter);
        let revocation = Arc::clone(&self.revocation);
        let sweep_interval = self.config.rate_limit.sweep_interval;
        let mut sweep_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        limiter.sweep().await;
                        revocation.prune().await;
                        debug!("Swept idle rate windows and expired revocations");
                    }
                    _ = sweep_shutdown.recv() => break,
                }
            }
        });

        let app = self.wrap(downstream);
        let listener = TcpListener::bind(addr).await?;

        info!(
            host = %self.config.server.host,
            port = self.config.server.port,
            "Campus gateway listening"
        );
        if !self.config.cookies.secure {
            warn!("Cookie Secure attribute disabled - development mode only");
        }

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(())
    }
}

/// Minimal downstream app for standalone runs: a health endpoint and an
/// identity echo for everything else
#[must_use]
pub fn demo_downstream() -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .fallback(|request: axum::extract::Request| async move {
            let identity = request.extensions().get::<Identity>();
            Json(serde_json::json!({
                "status": "ok",
                "user": identity.map(|i| i.user_id.clone()),
                "role": identity.map(|i| i.role.as_str()),
            }))
        })
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
