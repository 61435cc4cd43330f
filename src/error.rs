//! Error types for the campus gateway

use std::io;

use thiserror::Error;

/// Result type alias for the campus gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Campus gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A backing store (session, revocation, rate-limit) failed or timed out
    #[error("Upstream store unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Token signing failed (bad key material, claim serialization)
    #[error("Token issuance error: {0}")]
    TokenIssuance(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
