//! Refresh token rotation
//!
//! Exchanging a refresh token revokes it and issues a new pair as one logical
//! operation. The revocation check-and-set is the atomic step: of two
//! concurrent exchanges of the same token, exactly one wins. A second
//! presentation of an already-rotated token signals possible theft — the
//! whole session is invalidated, not just the request.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{TokenPair, TokenService, TokenType, VerifyError};
use crate::Error;
use crate::session::SessionStore;

/// Why a refresh exchange failed
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The refresh token itself has expired; the user must log in again
    #[error("refresh token expired")]
    Expired,

    /// Bad signature, wrong type or device mismatch
    #[error("refresh token invalid")]
    Invalid,

    /// The token was already rotated — session has been invalidated
    #[error("refresh token reuse detected")]
    ReuseDetected,

    /// A backing store failed or timed out
    #[error("upstream failure during refresh: {0}")]
    Upstream(#[source] Error),
}

/// Orchestrates silent renewal of an expired access token
pub struct RefreshFlow {
    tokens: Arc<TokenService>,
    sessions: Arc<dyn SessionStore>,
}

impl RefreshFlow {
    /// Create the flow over the token service and session store
    pub fn new(tokens: Arc<TokenService>, sessions: Arc<dyn SessionStore>) -> Self {
        Self { tokens, sessions }
    }

    /// Exchange a refresh token for a new pair.
    ///
    /// # Errors
    ///
    /// [`RefreshError::ReuseDetected`] means the session was force-closed as
    /// a side effect; callers must clear cookies and redirect to login.
    pub async fn exchange(
        &self,
        refresh_token: &str,
        fingerprint: &str,
    ) -> Result<TokenPair, RefreshError> {
        let claims = self
            .tokens
            .verify_offline(refresh_token, TokenType::Refresh, fingerprint)
            .map_err(|e| match e {
                VerifyError::Expired => RefreshError::Expired,
                VerifyError::Store(err) => RefreshError::Upstream(err),
                _ => RefreshError::Invalid,
            })?;

        // Revoke-old before issue-new, as a single check-and-set on the jti
        let consumed = self.tokens.consume(&claims).await.map_err(|e| match e {
            VerifyError::Store(err) => RefreshError::Upstream(err),
            _ => RefreshError::Invalid,
        })?;

        if !consumed {
            warn!(
                session = %claims.sid,
                user = %claims.sub,
                "Rotated refresh token replayed, invalidating session"
            );
            if let Err(e) = self.sessions.set_active(&claims.sid, false).await {
                warn!(session = %claims.sid, error = %e, "Failed to invalidate session after reuse");
            }
            return Err(RefreshError::ReuseDetected);
        }

        let pair = self
            .tokens
            .issue_pair(&claims.sub, claims.role, &claims.sid, &claims.fp)
            .map_err(RefreshError::Upstream)?;

        debug!(session = %claims.sid, user = %claims.sub, "Refresh token rotated");
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::TokenConfig;
    use crate::session::{InMemorySessionStore, Session};
    use crate::token::{InMemoryRevocationStore, Role};

    fn setup(access_ttl: Duration, refresh_ttl: Duration) -> (Arc<TokenService>, Arc<InMemorySessionStore>, RefreshFlow) {
        let config = TokenConfig {
            signing_key: "refresh-test-key".to_string(),
            access_ttl,
            refresh_ttl,
            leeway_secs: 0,
            ..TokenConfig::default()
        };
        let tokens = Arc::new(
            TokenService::new(
                &config,
                Duration::from_millis(300),
                Arc::new(InMemoryRevocationStore::new()),
            )
            .unwrap(),
        );
        let sessions = Arc::new(InMemorySessionStore::new());
        sessions.insert(Session {
            session_id: "s-1".to_string(),
            user_id: "u-1".to_string(),
            created_at: chrono::Utc::now(),
            last_seen_at: chrono::Utc::now(),
            is_active: true,
            device_fingerprint: "fp-a".to_string(),
            mfa_verified: true,
        });
        let flow = RefreshFlow::new(
            Arc::clone(&tokens),
            Arc::clone(&sessions) as Arc<dyn SessionStore>,
        );
        (tokens, sessions, flow)
    }

    #[tokio::test]
    async fn exchange_rotates_the_pair() {
        let (tokens, _, flow) = setup(Duration::from_secs(60), Duration::from_secs(3600));
        let pair = tokens.issue_pair("u-1", Role::Student, "s-1", "fp-a").unwrap();

        let rotated = flow.exchange(&pair.refresh.token, "fp-a").await.unwrap();
        assert_ne!(rotated.refresh.claims.jti, pair.refresh.claims.jti);
        assert_eq!(rotated.access.claims.sid, "s-1");

        // The new access token passes full verification
        assert!(tokens
            .verify(&rotated.access.token, TokenType::Access, "fp-a")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn replay_of_rotated_token_closes_the_session() {
        let (tokens, sessions, flow) = setup(Duration::from_secs(60), Duration::from_secs(3600));
        let pair = tokens.issue_pair("u-1", Role::Student, "s-1", "fp-a").unwrap();

        flow.exchange(&pair.refresh.token, "fp-a").await.unwrap();
        let err = flow.exchange(&pair.refresh.token, "fp-a").await.unwrap_err();
        assert!(matches!(err, RefreshError::ReuseDetected));

        let session = sessions.lookup("s-1").await.unwrap().unwrap();
        assert!(!session.is_active);
    }

    #[tokio::test]
    async fn concurrent_exchange_has_exactly_one_winner() {
        let (tokens, _, flow) = setup(Duration::from_secs(60), Duration::from_secs(3600));
        let flow = Arc::new(flow);
        let pair = tokens.issue_pair("u-1", Role::Student, "s-1", "fp-a").unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let flow = Arc::clone(&flow);
            let token = pair.refresh.token.clone();
            handles.push(tokio::spawn(async move {
                flow.exchange(&token, "fp-a").await
            }));
        }

        let mut successes = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn access_token_cannot_be_exchanged() {
        let (tokens, _, flow) = setup(Duration::from_secs(60), Duration::from_secs(3600));
        let pair = tokens.issue_pair("u-1", Role::Student, "s-1", "fp-a").unwrap();

        let err = flow.exchange(&pair.access.token, "fp-a").await.unwrap_err();
        assert!(matches!(err, RefreshError::Invalid));
    }

    #[tokio::test]
    async fn expired_refresh_token_is_terminal() {
        let (tokens, _, flow) = setup(Duration::from_secs(60), Duration::ZERO);
        let pair = tokens.issue_pair("u-1", Role::Student, "s-1", "fp-a").unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let err = flow.exchange(&pair.refresh.token, "fp-a").await.unwrap_err();
        assert!(matches!(err, RefreshError::Expired));
    }

    #[tokio::test]
    async fn wrong_device_cannot_exchange() {
        let (tokens, _, flow) = setup(Duration::from_secs(60), Duration::from_secs(3600));
        let pair = tokens.issue_pair("u-1", Role::Student, "s-1", "fp-a").unwrap();

        let err = flow.exchange(&pair.refresh.token, "fp-stolen").await.unwrap_err();
        assert!(matches!(err, RefreshError::Invalid));
    }
}
