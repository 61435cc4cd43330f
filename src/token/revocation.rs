//! Token revocation set
//!
//! Denylisted token ids (`jti`) with an expiry equal to the token's own
//! expiry, so entries can be pruned once the token would have expired anyway.
//! A valid signature is necessary but not sufficient: every verification also
//! consults this set.
//!
//! `consume` is the linearization point for refresh rotation: of two
//! concurrent exchanges of the same refresh token, exactly one observes the
//! vacant entry and wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};

use crate::Result;

/// Revocation store capability
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Whether this token id has been revoked
    async fn is_revoked(&self, jti: &str) -> Result<bool>;

    /// Add a token id to the denylist until `expires_at`
    async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()>;

    /// Atomically revoke `jti` if it is not yet revoked.
    ///
    /// Returns `true` if this call performed the revocation, `false` if the
    /// id was already in the set. Single check-and-set per id.
    async fn consume(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Drop entries whose token has expired on its own
    async fn prune(&self);
}

/// In-memory revocation set for single-instance deployments
#[derive(Debug, Default)]
pub struct InMemoryRevocationStore {
    entries: DashMap<String, DateTime<Utc>>,
}

impl InMemoryRevocationStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries (for sweep diagnostics)
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl RevocationStore for InMemoryRevocationStore {
    async fn is_revoked(&self, jti: &str) -> Result<bool> {
        Ok(self.entries.contains_key(jti))
    }

    async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.entries.insert(jti.to_string(), expires_at);
        Ok(())
    }

    async fn consume(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        // Entry API holds the shard lock across the check and the insert
        match self.entries.entry(jti.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => {
                v.insert(expires_at);
                Ok(true)
            }
        }
    }

    async fn prune(&self) {
        let now = Utc::now();
        self.entries.retain(|_, expires_at| *expires_at > now);
    }
}
