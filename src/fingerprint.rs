//! Device fingerprint derivation
//!
//! A fingerprint binds a token to the device that obtained it: the hex SHA-256
//! of the user agent and the client IP. It is a fraud signal, not an identity
//! — two requests from the same browser and address produce the same value.

use std::net::IpAddr;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Derive the fingerprint for a request
#[must_use]
pub fn derive(user_agent: &str, ip: IpAddr) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_agent.as_bytes());
    hasher.update(b"\n");
    hasher.update(ip.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time fingerprint comparison
#[must_use]
pub fn matches(expected: &str, actual: &str) -> bool {
    expected.as_bytes().ct_eq(actual.as_bytes()).into()
}
