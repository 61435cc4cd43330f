//! Campus Gateway Library
//!
//! Request-security gateway for a multi-role learning platform. Every
//! inbound request is classified, rate limited, and authenticated before any
//! business handler runs; the outcome is allow (with injected identity
//! context), redirect (login, MFA challenge, locked page) or deny (403/429).
//!
//! # Design
//!
//! - One explicit decision state machine, no middleware fallthrough
//! - All shared state (rate windows, revocation set) behind capability traits
//! - Fail closed on ambiguity; fail open only for the rate limiter on
//!   non-auth routes

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod gateway;
pub mod ratelimit;
pub mod routes;
pub mod session;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
