//! Security headers and CORS enforcement
//!
//! Every response gets the fixed header set, on success and failure paths
//! alike. Origin validation applies to API routes only: a matched origin gets
//! the credentialed CORS headers, an absent or unknown origin is still served
//! (same-origin callers send no Origin) but without
//! `Access-Control-Allow-Origin`.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::config::CorsConfig;

/// Resolved CORS policy, immutable after startup
#[derive(Debug)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
    api_prefix: String,
}

impl CorsPolicy {
    /// Build from config
    #[must_use]
    pub fn new(config: &CorsConfig) -> Self {
        Self {
            allowed_origins: config.allowed_origins.clone(),
            api_prefix: config.api_prefix.clone(),
        }
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == origin)
    }

    fn is_api_path(&self, path: &str) -> bool {
        path == self.api_prefix
            || path
                .strip_prefix(self.api_prefix.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Middleware applying security headers to every response and CORS headers
/// to allowed cross-origin API requests
pub async fn security_headers(
    State(policy): State<Arc<CorsPolicy>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let cross_origin_allowed = origin
        .as_deref()
        .is_some_and(|o| policy.is_api_path(&path) && policy.origin_allowed(o));

    // Preflight for an allowed origin is answered here; everything else
    // (including disallowed preflights) flows through unanswered.
    let mut response = if request.method() == Method::OPTIONS && cross_origin_allowed {
        debug!(path = %path, "Answering CORS preflight");
        (
            StatusCode::NO_CONTENT,
            [
                (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, PUT, PATCH, DELETE"),
                (header::ACCESS_CONTROL_ALLOW_HEADERS, "content-type"),
                (header::ACCESS_CONTROL_MAX_AGE, "600"),
            ],
        )
            .into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'; frame-ancestors 'none'"),
    );

    if cross_origin_allowed {
        if let Some(origin) = origin.as_deref().and_then(|o| HeaderValue::from_str(o).ok()) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
            headers.append(header::VARY, HeaderValue::from_static("Origin"));
        }
    }

    response
}
