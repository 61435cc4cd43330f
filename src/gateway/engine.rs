//! Access decision engine
//!
//! One explicit state machine per request, replacing chained middleware with
//! overlapping route matching. Evaluation order:
//!
//! ```text
//! classify -> [public]        => allow
//!          -> [auth-endpoint] => strict rate limit -> allow/deny (logout handled here)
//!          -> [protected|admin]
//!               rate limit -> verify -> (expired => refresh once, re-verify)
//!               -> session active -> account lock -> role -> MFA gate -> allow
//! ```
//!
//! Ambiguity fails closed: a session lookup that times out reads as inactive,
//! and any upstream failure on an admin route is a denial. The one fail-open
//! exception is a rate-limiter failure on a non-auth route, where
//! availability is favored over throttling.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use tracing::{debug, warn};

use crate::config::{Config, RatePolicy};
use crate::fingerprint;
use crate::ratelimit::{ClientKey, RateDecision, RateLimiter};
use crate::routes::{RouteTable, SecurityClass};
use crate::session::{Session, SessionStore, UserDirectory};
use crate::token::refresh::{RefreshError, RefreshFlow};
use crate::token::{Role, TokenPair, TokenService, TokenType, VerifyError};
use crate::{Error, Result};

/// Everything the engine needs to know about a request
#[derive(Debug, Clone)]
pub struct RequestFacts {
    /// Request path (no query string)
    pub path: String,
    /// Client IP (socket address, or first trusted X-Forwarded-For hop)
    pub ip: IpAddr,
    /// User-Agent header value
    pub user_agent: String,
    /// `access_token` cookie, if present
    pub access_token: Option<String>,
    /// `refresh_token` cookie, if present
    pub refresh_token: Option<String>,
}

/// Identity context attached to allowed requests
#[derive(Debug, Clone)]
pub struct Identity {
    /// Authenticated user id
    pub user_id: String,
    /// Resolved role (from the user directory, not the token)
    pub role: Role,
    /// Session id
    pub session_id: String,
}

/// Terminal outcome of an evaluation
#[derive(Debug)]
pub enum Outcome {
    /// Forward the request; identity is `None` only for public routes
    Allow {
        /// Identity context for downstream handlers
        identity: Option<Identity>,
        /// New token pair to set as cookies, if a refresh happened
        rotated: Option<TokenPair>,
    },
    /// 307 to a login/MFA/locked page
    Redirect {
        /// Target location, including any `callbackUrl` parameter
        location: String,
        /// Whether to clear the token cookies on the way out
        clear_cookies: bool,
    },
    /// 403 or 429, with no body detail beyond the status
    Deny {
        /// Response status
        status: StatusCode,
        /// `Retry-After` value for 429 responses
        retry_after: Option<Duration>,
    },
}

/// The gateway's decision engine. All collaborators are injected; tests
/// substitute in-memory fakes per case.
pub struct AccessEngine {
    routes: RouteTable,
    limiter: Arc<dyn RateLimiter>,
    tokens: Arc<TokenService>,
    refresh: RefreshFlow,
    sessions: Arc<dyn SessionStore>,
    directory: Arc<dyn UserDirectory>,
    normal_policy: RatePolicy,
    strict_policy: RatePolicy,
    login_path: String,
    mfa_path: String,
    locked_path: String,
    logout_path: String,
    upstream_timeout: Duration,
}

impl AccessEngine {
    /// Assemble the engine from config and injected adapters
    pub fn new(
        config: &Config,
        limiter: Arc<dyn RateLimiter>,
        tokens: Arc<TokenService>,
        sessions: Arc<dyn SessionStore>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        let refresh = RefreshFlow::new(Arc::clone(&tokens), Arc::clone(&sessions));
        Self {
            routes: RouteTable::new(&config.routes),
            limiter,
            tokens,
            refresh,
            sessions,
            directory,
            normal_policy: config.rate_limit.normal,
            strict_policy: config.rate_limit.strict,
            login_path: config.redirects.login_path.clone(),
            mfa_path: config.redirects.mfa_path.clone(),
            locked_path: config.redirects.locked_path.clone(),
            logout_path: config.redirects.logout_path.clone(),
            upstream_timeout: config.server.upstream_timeout,
        }
    }

    /// The route table (for header enforcement and diagnostics)
    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Evaluate one request to a terminal outcome
    pub async fn evaluate(&self, facts: &RequestFacts) -> Outcome {
        let class = self.routes.classify(&facts.path);
        debug!(path = %facts.path, class = class.label(), "Classified request");

        if class == SecurityClass::Public {
            return Outcome::Allow {
                identity: None,
                rotated: None,
            };
        }

        if let Some(outcome) = self.apply_rate_limit(facts, class).await {
            return outcome;
        }

        if class == SecurityClass::AuthEndpoint {
            if facts.path == self.logout_path {
                return self.logout(facts).await;
            }
            // Login/register/refresh bodies belong to the identity subsystem;
            // the gateway's job here was the strict limit above.
            return Outcome::Allow {
                identity: None,
                rotated: None,
            };
        }

        let admin_route = class == SecurityClass::AdminOnly;
        let fp = fingerprint::derive(&facts.user_agent, facts.ip);

        let (claims, rotated) = match self.resolve_credential(facts, &fp, admin_route).await {
            Ok(resolved) => resolved,
            Err(outcome) => return outcome,
        };

        // Session is the authority: a valid token with a dead session is denied
        let session = match self.guarded(self.sessions.lookup(&claims.sid)).await {
            Ok(Some(session)) if session.is_active => session,
            Ok(_) => {
                debug!(session = %claims.sid, "Session missing or inactive");
                return self.login_redirect(&facts.path, true);
            }
            Err(e) => return self.upstream_failure(admin_route, &facts.path, &e),
        };

        match self.guarded(self.directory.is_locked(&claims.sub)).await {
            Ok(true) => {
                warn!(user = %claims.sub, "Account locked");
                return Outcome::Redirect {
                    location: self.locked_path.clone(),
                    clear_cookies: false,
                };
            }
            Ok(false) => {}
            Err(e) => return self.upstream_failure(admin_route, &facts.path, &e),
        }

        let role = match self.guarded(self.directory.role(&claims.sub)).await {
            Ok(role) => role,
            Err(e) => return self.upstream_failure(admin_route, &facts.path, &e),
        };

        if admin_route && !role.is_admin() {
            warn!(user = %claims.sub, role = role.as_str(), path = %facts.path, "Role check failed");
            return Outcome::Deny {
                status: StatusCode::FORBIDDEN,
                retry_after: None,
            };
        }

        if let Some(outcome) = self.mfa_gate(facts, &claims.sub, &session, admin_route).await {
            return outcome;
        }

        debug!(user = %claims.sub, session = %claims.sid, "Request allowed");
        Outcome::Allow {
            identity: Some(Identity {
                user_id: claims.sub,
                role,
                session_id: claims.sid,
            }),
            rotated,
        }
    }

    /// Rate-limit the request; `Some` short-circuits evaluation
    async fn apply_rate_limit(&self, facts: &RequestFacts, class: SecurityClass) -> Option<Outcome> {
        let policy = self.routes.policy_override(&facts.path).unwrap_or(match class {
            SecurityClass::AuthEndpoint => self.strict_policy,
            _ => self.normal_policy,
        });
        let key = ClientKey {
            ip: facts.ip,
            class,
        };

        match self.limiter.check(key, policy).await {
            Ok(RateDecision::Allowed) => None,
            Ok(RateDecision::Limited { retry_after }) => {
                warn!(ip = %facts.ip, class = class.label(), "Rate limit exceeded");
                Some(Outcome::Deny {
                    status: StatusCode::TOO_MANY_REQUESTS,
                    retry_after: Some(retry_after),
                })
            }
            Err(e) => match class {
                // Brute-force protection outranks availability on auth
                // endpoints; admin routes are fail-closed unconditionally.
                SecurityClass::AuthEndpoint | SecurityClass::AdminOnly => {
                    warn!(error = %e, class = class.label(), "Limiter failure, failing closed");
                    Some(Outcome::Deny {
                        status: StatusCode::TOO_MANY_REQUESTS,
                        retry_after: None,
                    })
                }
                _ => {
                    warn!(error = %e, "Limiter failure, failing open");
                    None
                }
            },
        }
    }

    /// Resolve the access token, refreshing once on expiry
    async fn resolve_credential(
        &self,
        facts: &RequestFacts,
        fp: &str,
        admin_route: bool,
    ) -> std::result::Result<(crate::token::Claims, Option<TokenPair>), Outcome> {
        let Some(access_token) = facts.access_token.as_deref() else {
            debug!(path = %facts.path, "No access token");
            return Err(self.login_redirect(&facts.path, false));
        };

        match self.tokens.verify(access_token, TokenType::Access, fp).await {
            Ok(claims) => Ok((claims, None)),
            Err(VerifyError::Expired) => self.try_refresh(facts, fp, admin_route).await,
            Err(VerifyError::Store(e)) => Err(self.upstream_failure(admin_route, &facts.path, &e)),
            Err(e) => {
                // BadSignature, Revoked, DeviceMismatch, WrongType: terminal
                warn!(path = %facts.path, error = %e, "Access token rejected");
                Err(self.login_redirect(&facts.path, true))
            }
        }
    }

    async fn try_refresh(
        &self,
        facts: &RequestFacts,
        fp: &str,
        admin_route: bool,
    ) -> std::result::Result<(crate::token::Claims, Option<TokenPair>), Outcome> {
        let Some(refresh_token) = facts.refresh_token.as_deref() else {
            return Err(self.login_redirect(&facts.path, true));
        };

        match self.refresh.exchange(refresh_token, fp).await {
            Ok(pair) => {
                // No short-circuiting: the new access token is verified in full
                match self.tokens.verify(&pair.access.token, TokenType::Access, fp).await {
                    Ok(claims) => Ok((claims, Some(pair))),
                    Err(VerifyError::Store(e)) => {
                        Err(self.upstream_failure(admin_route, &facts.path, &e))
                    }
                    Err(e) => {
                        warn!(error = %e, "Refreshed access token failed re-verification");
                        Err(self.login_redirect(&facts.path, true))
                    }
                }
            }
            Err(RefreshError::ReuseDetected) => {
                // Session already invalidated by the flow; force re-auth
                Err(self.login_redirect(&facts.path, true))
            }
            Err(RefreshError::Upstream(e)) => {
                Err(self.upstream_failure(admin_route, &facts.path, &e))
            }
            Err(e) => {
                debug!(error = %e, "Refresh failed");
                Err(self.login_redirect(&facts.path, true))
            }
        }
    }

    /// MFA gate: required + unverified + not already on the challenge page
    async fn mfa_gate(
        &self,
        facts: &RequestFacts,
        user_id: &str,
        session: &Session,
        admin_route: bool,
    ) -> Option<Outcome> {
        if facts.path == self.mfa_path {
            return None;
        }
        match self.guarded(self.directory.mfa_required(user_id)).await {
            Ok(true) if !session.mfa_verified => {
                debug!(user = %user_id, path = %facts.path, "MFA required, redirecting to challenge");
                Some(Outcome::Redirect {
                    location: with_callback(&self.mfa_path, &facts.path),
                    clear_cookies: false,
                })
            }
            Ok(_) => None,
            Err(e) => Some(self.upstream_failure(admin_route, &facts.path, &e)),
        }
    }

    /// Gateway-handled logout: revoke both tokens, close the session
    async fn logout(&self, facts: &RequestFacts) -> Outcome {
        let fp = fingerprint::derive(&facts.user_agent, facts.ip);
        let mut session_id = None;

        for (cookie, typ) in [
            (facts.access_token.as_deref(), TokenType::Access),
            (facts.refresh_token.as_deref(), TokenType::Refresh),
        ] {
            let Some(token) = cookie else { continue };
            if let Ok(claims) = self.tokens.verify_offline(token, typ, &fp) {
                if let Err(e) = self.tokens.revoke(&claims).await {
                    warn!(error = %e, "Failed to revoke token on logout");
                }
                session_id.get_or_insert(claims.sid);
            }
        }

        if let Some(sid) = session_id {
            if let Err(e) = self.sessions.set_active(&sid, false).await {
                warn!(session = %sid, error = %e, "Failed to deactivate session on logout");
            } else {
                debug!(session = %sid, "Session closed on logout");
            }
        }

        Outcome::Redirect {
            location: self.login_path.clone(),
            clear_cookies: true,
        }
    }

    fn login_redirect(&self, original_path: &str, clear_cookies: bool) -> Outcome {
        Outcome::Redirect {
            location: with_callback(&self.login_path, original_path),
            clear_cookies,
        }
    }

    /// Resolve an upstream failure per the fail-open/fail-closed table
    fn upstream_failure(&self, admin_route: bool, path: &str, error: &Error) -> Outcome {
        warn!(path = %path, error = %error, "Upstream failure during evaluation");
        if admin_route {
            Outcome::Deny {
                status: StatusCode::FORBIDDEN,
                retry_after: None,
            }
        } else {
            // Reads as "not authenticated", never as a backend 5xx
            self.login_redirect(path, false)
        }
    }

    /// Bound a store call by the configured upstream timeout
    async fn guarded<T>(
        &self,
        fut: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.upstream_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::UpstreamUnavailable(
                "store lookup timed out".to_string(),
            )),
        }
    }
}

/// Append the original path as a `callbackUrl` query parameter
fn with_callback(target: &str, original_path: &str) -> String {
    let query: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("callbackUrl", original_path)
        .finish();
    format!("{target}?{query}")
}
