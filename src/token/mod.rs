//! Token validation and issuance
//!
//! Access and refresh tokens are HS256 JWTs carrying the subject, role,
//! session id, device fingerprint hash and a unique token id (`jti`).
//! Verification checks, in order: signature and expiry, token type,
//! revocation, device binding. A token passes only if all four hold —
//! a valid signature alone proves nothing once the id is denylisted.

pub mod refresh;
pub mod revocation;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::fingerprint;
use crate::{Error, Result};

pub use revocation::{InMemoryRevocationStore, RevocationStore};

/// Platform role carried in token claims and the user directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Course participant
    Student,
    /// Course author and grader
    Instructor,
    /// Platform administrator
    Admin,
    /// Administrator with user-management rights
    SuperAdmin,
}

impl Role {
    /// Whether this role may access admin-only routes
    #[must_use]
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin | Self::SuperAdmin)
    }

    /// Header value for `X-User-Role`
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Instructor => "instructor",
            Self::Admin => "admin",
            Self::SuperAdmin => "super-admin",
        }
    }
}

/// Token type discriminator: refresh tokens must never pass as access tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Short-lived request credential
    Access,
    /// Long-lived rotation credential
    Refresh,
}

/// JWT claims for both token types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Role at issuance time
    pub role: Role,
    /// Session id this token belongs to
    pub sid: String,
    /// Device fingerprint hash
    pub fp: String,
    /// Unique token id, revocation key
    pub jti: String,
    /// Issued-at (Unix seconds)
    pub iat: i64,
    /// Expires-at (Unix seconds)
    pub exp: i64,
    /// Token type
    pub typ: TokenType,
}

impl Claims {
    /// Expiry as a `DateTime`, for revocation-entry lifetimes
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }
}

/// A signed token together with its claims
#[derive(Debug, Clone)]
pub struct SignedToken {
    /// Encoded JWT
    pub token: String,
    /// The claims it carries
    pub claims: Claims,
}

/// A freshly issued access + refresh pair
#[derive(Debug, Clone)]
pub struct TokenPair {
    /// Short-lived access token
    pub access: SignedToken,
    /// Long-lived refresh token
    pub refresh: SignedToken,
}

/// Why a token was rejected
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Signature valid but `exp` has passed — the only refreshable failure
    #[error("token expired")]
    Expired,

    /// Signature invalid or token malformed — terminal
    #[error("bad token signature")]
    BadSignature,

    /// Token id is in the revocation set — terminal
    #[error("token revoked")]
    Revoked,

    /// Device fingerprint does not match the requester — terminal
    #[error("device fingerprint mismatch")]
    DeviceMismatch,

    /// Wrong token type for this operation (refresh presented as access)
    #[error("wrong token type")]
    WrongType,

    /// Revocation store failed or timed out
    #[error("revocation store unavailable: {0}")]
    Store(#[source] Error),
}

/// Signs, verifies and revokes the gateway's tokens
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    device_binding: bool,
    leeway_secs: u64,
    store_timeout: Duration,
    revocation: Arc<dyn RevocationStore>,
}

impl TokenService {
    /// Create from config, resolving the signing key.
    ///
    /// # Errors
    ///
    /// Returns a config error if the signing key cannot be resolved.
    pub fn new(
        config: &TokenConfig,
        store_timeout: Duration,
        revocation: Arc<dyn RevocationStore>,
    ) -> Result<Self> {
        let key = config
            .resolve_signing_key()
            .ok_or_else(|| Error::Config(format!(
                "Signing key not resolvable: {}",
                config.signing_key
            )))?;

        Ok(Self {
            encoding: EncodingKey::from_secret(key.as_bytes()),
            decoding: DecodingKey::from_secret(key.as_bytes()),
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
            device_binding: config.device_binding,
            leeway_secs: config.leeway_secs,
            store_timeout,
            revocation,
        })
    }

    /// Issue a fresh access + refresh pair bound to a session and device
    pub fn issue_pair(
        &self,
        user_id: &str,
        role: Role,
        session_id: &str,
        fingerprint: &str,
    ) -> Result<TokenPair> {
        let access = self.issue(user_id, role, session_id, fingerprint, TokenType::Access)?;
        let refresh = self.issue(user_id, role, session_id, fingerprint, TokenType::Refresh)?;
        Ok(TokenPair { access, refresh })
    }

    fn issue(
        &self,
        user_id: &str,
        role: Role,
        session_id: &str,
        fingerprint: &str,
        typ: TokenType,
    ) -> Result<SignedToken> {
        let now = Utc::now();
        let ttl = match typ {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            sid: session_id.to_string(),
            fp: fingerprint.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)))
                .timestamp(),
            typ,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::TokenIssuance(e.to_string()))?;
        Ok(SignedToken { token, claims })
    }

    /// Full verification: signature, expiry, type, revocation, device binding
    pub async fn verify(
        &self,
        token: &str,
        expected: TokenType,
        request_fingerprint: &str,
    ) -> std::result::Result<Claims, VerifyError> {
        let claims = self.verify_offline(token, expected, request_fingerprint)?;

        let revoked = tokio::time::timeout(self.store_timeout, self.revocation.is_revoked(&claims.jti))
            .await
            .map_err(|_| {
                VerifyError::Store(Error::UpstreamUnavailable(
                    "revocation lookup timed out".to_string(),
                ))
            })?
            .map_err(VerifyError::Store)?;
        if revoked {
            return Err(VerifyError::Revoked);
        }

        Ok(claims)
    }

    /// Signature, expiry, type and device-binding checks only.
    ///
    /// The refresh flow uses this before its atomic consume; everything else
    /// goes through [`TokenService::verify`].
    pub fn verify_offline(
        &self,
        token: &str,
        expected: TokenType,
        request_fingerprint: &str,
    ) -> std::result::Result<Claims, VerifyError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.leeway_secs;
        validation.validate_aud = false;

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                _ => VerifyError::BadSignature,
            })?;
        let claims = data.claims;

        if claims.typ != expected {
            return Err(VerifyError::WrongType);
        }

        if self.device_binding && !fingerprint::matches(&claims.fp, request_fingerprint) {
            return Err(VerifyError::DeviceMismatch);
        }

        Ok(claims)
    }

    /// Add a token to the revocation set for the remainder of its lifetime
    pub async fn revoke(&self, claims: &Claims) -> Result<()> {
        self.revocation.revoke(&claims.jti, claims.expires_at()).await
    }

    /// Atomically consume a token id; `false` means it was already consumed
    pub async fn consume(&self, claims: &Claims) -> std::result::Result<bool, VerifyError> {
        tokio::time::timeout(
            self.store_timeout,
            self.revocation.consume(&claims.jti, claims.expires_at()),
        )
        .await
        .map_err(|_| {
            VerifyError::Store(Error::UpstreamUnavailable(
                "revocation consume timed out".to_string(),
            ))
        })?
        .map_err(VerifyError::Store)
    }

    /// Whether device binding is enforced
    #[must_use]
    pub fn device_binding(&self) -> bool {
        self.device_binding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(config: TokenConfig) -> TokenService {
        TokenService::new(
            &config,
            Duration::from_millis(300),
            Arc::new(InMemoryRevocationStore::new()),
        )
        .unwrap()
    }

    fn test_config() -> TokenConfig {
        TokenConfig {
            signing_key: "unit-test-signing-key".to_string(),
            leeway_secs: 0,
            ..TokenConfig::default()
        }
    }

    #[tokio::test]
    async fn issued_access_token_verifies() {
        let svc = service(test_config());
        let pair = svc.issue_pair("u-1", Role::Student, "s-1", "fp-a").unwrap();

        let claims = svc
            .verify(&pair.access.token, TokenType::Access, "fp-a")
            .await
            .unwrap();
        assert_eq!(claims.sub, "u-1");
        assert_eq!(claims.sid, "s-1");
        assert_eq!(claims.typ, TokenType::Access);
    }

    #[tokio::test]
    async fn refresh_token_rejected_as_access() {
        let svc = service(test_config());
        let pair = svc.issue_pair("u-1", Role::Student, "s-1", "fp-a").unwrap();

        let err = svc
            .verify(&pair.refresh.token, TokenType::Access, "fp-a")
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::WrongType));
    }

    #[tokio::test]
    async fn expired_token_reported_as_expired() {
        let config = TokenConfig {
            access_ttl: Duration::ZERO,
            ..test_config()
        };
        let svc = service(config);
        let pair = svc.issue_pair("u-1", Role::Student, "s-1", "fp-a").unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let err = svc
            .verify(&pair.access.token, TokenType::Access, "fp-a")
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Expired));
    }

    #[tokio::test]
    async fn tampered_token_is_bad_signature() {
        let svc = service(test_config());
        let pair = svc.issue_pair("u-1", Role::Student, "s-1", "fp-a").unwrap();

        let mut tampered = pair.access.token.clone();
        tampered.pop();
        let err = svc
            .verify(&tampered, TokenType::Access, "fp-a")
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::BadSignature));
    }

    #[tokio::test]
    async fn fingerprint_mismatch_rejected_when_binding_enabled() {
        let svc = service(test_config());
        let pair = svc.issue_pair("u-1", Role::Student, "s-1", "fp-a").unwrap();

        let err = svc
            .verify(&pair.access.token, TokenType::Access, "fp-other")
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::DeviceMismatch));
    }

    #[tokio::test]
    async fn fingerprint_ignored_when_binding_disabled() {
        let config = TokenConfig {
            device_binding: false,
            ..test_config()
        };
        let svc = service(config);
        let pair = svc.issue_pair("u-1", Role::Student, "s-1", "fp-a").unwrap();

        assert!(svc
            .verify(&pair.access.token, TokenType::Access, "fp-other")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn revoked_token_rejected_despite_valid_signature() {
        let svc = service(test_config());
        let pair = svc.issue_pair("u-1", Role::Student, "s-1", "fp-a").unwrap();

        svc.revoke(&pair.access.claims).await.unwrap();
        let err = svc
            .verify(&pair.access.token, TokenType::Access, "fp-a")
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Revoked));
    }

    #[test]
    fn role_admin_check() {
        assert!(Role::Admin.is_admin());
        assert!(Role::SuperAdmin.is_admin());
        assert!(!Role::Student.is_admin());
        assert!(!Role::Instructor.is_admin());
    }
}
