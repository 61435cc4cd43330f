//! Gate middleware
//!
//! Bridges HTTP to the decision engine: extracts request facts, runs the
//! evaluation, and shapes the terminal outcome into a response. Allowed
//! requests are forwarded with injected identity headers; client-supplied
//! copies of those headers are stripped first so downstream handlers can
//! treat them as authoritative.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderName, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use cookie::{Cookie, SameSite, time};
use tracing::warn;

use super::engine::{AccessEngine, Identity, Outcome, RequestFacts};
use crate::config::Config;
use crate::token::{SignedToken, TokenPair};

/// `access_token` cookie name
pub const ACCESS_COOKIE: &str = "access_token";
/// `refresh_token` cookie name
pub const REFRESH_COOKIE: &str = "refresh_token";
/// MFA status cookie, cleared on logout
pub const MFA_COOKIE: &str = "mfa_verified";

/// Identity headers injected for downstream handlers
pub const USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");
/// Role header
pub const USER_ROLE_HEADER: HeaderName = HeaderName::from_static("x-user-role");
/// Session header
pub const SESSION_ID_HEADER: HeaderName = HeaderName::from_static("x-session-id");

/// Shared middleware state: the engine plus cookie/addressing policy
pub struct GatewayState {
    /// The decision engine
    pub engine: AccessEngine,
    cookie_secure: bool,
    refresh_cookie_path: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    trust_forwarded_for: bool,
}

impl GatewayState {
    /// Build from config and an assembled engine
    #[must_use]
    pub fn new(config: &Config, engine: AccessEngine) -> Self {
        Self {
            engine,
            cookie_secure: config.cookies.secure,
            refresh_cookie_path: config.cookies.refresh_path.clone(),
            access_ttl: config.tokens.access_ttl,
            refresh_ttl: config.tokens.refresh_ttl,
            trust_forwarded_for: config.server.trust_forwarded_for,
        }
    }
}

/// The gate: every request passes through here before any handler runs
pub async fn gate_middleware(
    State(state): State<Arc<GatewayState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let facts = extract_facts(&state, &request);

    match state.engine.evaluate(&facts).await {
        Outcome::Allow { identity, rotated } => {
            strip_identity_headers(&mut request);
            if let Some(ref identity) = identity {
                inject_identity(&mut request, identity);
            }

            let mut response = next.run(request).await;
            if let Some(pair) = rotated {
                set_rotated_cookies(&mut response, &state, &pair);
            }
            response
        }
        Outcome::Redirect {
            location,
            clear_cookies,
        } => {
            let mut response = redirect_response(&location);
            if clear_cookies {
                clear_token_cookies(&mut response, &state);
            }
            response
        }
        Outcome::Deny {
            status,
            retry_after,
        } => deny_response(status, retry_after),
    }
}

/// Pull the engine's inputs out of the request
fn extract_facts(state: &GatewayState, request: &Request<Body>) -> RequestFacts {
    let headers = request.headers();

    let forwarded_ip = if state.trust_forwarded_for {
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    } else {
        None
    };
    let ip = forwarded_ip
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip())
        })
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let (access_token, refresh_token) = parse_token_cookies(headers);

    RequestFacts {
        path: request.uri().path().to_string(),
        ip,
        user_agent,
        access_token,
        refresh_token,
    }
}

fn parse_token_cookies(headers: &axum::http::HeaderMap) -> (Option<String>, Option<String>) {
    let mut access = None;
    let mut refresh = None;
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for cookie in Cookie::split_parse(raw.to_string()).flatten() {
            match cookie.name() {
                ACCESS_COOKIE => access = Some(cookie.value().to_string()),
                REFRESH_COOKIE => refresh = Some(cookie.value().to_string()),
                _ => {}
            }
        }
    }
    (access, refresh)
}

/// Remove any client-supplied identity headers before injection
fn strip_identity_headers(request: &mut Request<Body>) {
    let headers = request.headers_mut();
    headers.remove(&USER_ID_HEADER);
    headers.remove(&USER_ROLE_HEADER);
    headers.remove(&SESSION_ID_HEADER);
}

fn inject_identity(request: &mut Request<Body>, identity: &Identity) {
    let headers = request.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&identity.user_id) {
        headers.insert(USER_ID_HEADER, v);
    }
    headers.insert(
        USER_ROLE_HEADER,
        HeaderValue::from_static(identity.role.as_str()),
    );
    if let Ok(v) = HeaderValue::from_str(&identity.session_id) {
        headers.insert(SESSION_ID_HEADER, v);
    }
    request.extensions_mut().insert(identity.clone());
}

fn redirect_response(location: &str) -> Response {
    let Ok(location) = HeaderValue::from_str(location) else {
        warn!(location = %location, "Unencodable redirect location");
        return StatusCode::FORBIDDEN.into_response();
    };
    (
        StatusCode::TEMPORARY_REDIRECT,
        [(header::LOCATION, location)],
    )
        .into_response()
}

/// 403/429 with no body detail beyond the status code
fn deny_response(status: StatusCode, retry_after: Option<Duration>) -> Response {
    let mut response = status.into_response();
    if let Some(retry_after) = retry_after {
        let secs = retry_after.as_secs().max(1);
        if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }
    }
    response
}

fn set_rotated_cookies(response: &mut Response, state: &GatewayState, pair: &TokenPair) {
    append_cookie(
        response,
        token_cookie(ACCESS_COOKIE, &pair.access, "/", state.access_ttl, state.cookie_secure),
    );
    append_cookie(
        response,
        token_cookie(
            REFRESH_COOKIE,
            &pair.refresh,
            &state.refresh_cookie_path,
            state.refresh_ttl,
            state.cookie_secure,
        ),
    );
}

fn token_cookie(
    name: &'static str,
    token: &SignedToken,
    path: &str,
    ttl: Duration,
    secure: bool,
) -> Cookie<'static> {
    Cookie::build((name, token.token.clone()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .path(path.to_string())
        .max_age(time::Duration::seconds(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)))
        .build()
}

fn clear_token_cookies(response: &mut Response, state: &GatewayState) {
    for (name, path) in [
        (ACCESS_COOKIE, "/"),
        (REFRESH_COOKIE, state.refresh_cookie_path.as_str()),
        (MFA_COOKIE, "/"),
    ] {
        let cookie = Cookie::build((name, ""))
            .http_only(true)
            .secure(state.cookie_secure)
            .same_site(SameSite::Strict)
            .path(path.to_string())
            .max_age(time::Duration::ZERO)
            .build();
        append_cookie(response, cookie);
    }
}

fn append_cookie(response: &mut Response, cookie: Cookie<'static>) {
    match HeaderValue::from_str(&cookie.to_string()) {
        Ok(v) => {
            response.headers_mut().append(header::SET_COOKIE, v);
        }
        Err(e) => warn!(error = %e, "Failed to encode Set-Cookie header"),
    }
}
