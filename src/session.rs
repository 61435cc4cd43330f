//! Session store and user directory adapters
//!
//! Sessions are owned by the identity subsystem; the gateway reads them and
//! may only request deactivation. A lookup miss, an inactive record, a store
//! error or a timeout all read the same way: not authenticated. That is what
//! decouples token lifetime from session lifetime — logout-everywhere takes
//! effect immediately even while tokens are still cryptographically valid.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::Result;
use crate::token::Role;

/// Server-side record of a logical login
#[derive(Debug, Clone)]
pub struct Session {
    /// Session id (the `sid` claim of its tokens)
    pub session_id: String,
    /// Owning user
    pub user_id: String,
    /// Created on successful login
    pub created_at: DateTime<Utc>,
    /// Last request seen on this session
    pub last_seen_at: DateTime<Utc>,
    /// Cleared on logout, password change or administrative revocation
    pub is_active: bool,
    /// Fingerprint of the device that opened the session
    pub device_fingerprint: String,
    /// Whether the MFA challenge has been passed for this session
    pub mfa_verified: bool,
}

/// Session store capability — the authority on "is this login still live"
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up a session; `None` is equivalent to inactive
    async fn lookup(&self, session_id: &str) -> Result<Option<Session>>;

    /// Request (de)activation; the gateway only ever requests `false`
    async fn set_active(&self, session_id: &str, active: bool) -> Result<()>;
}

/// User/role store capability
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Current role of a user
    async fn role(&self, user_id: &str) -> Result<Role>;

    /// Whether the account is administratively locked
    async fn is_locked(&self, user_id: &str) -> Result<bool>;

    /// Whether the account requires multi-factor verification
    async fn mfa_required(&self, user_id: &str) -> Result<bool>;
}

/// In-memory session store for tests and single-node deployments
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl InMemorySessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session record
    pub fn insert(&self, session: Session) {
        self.sessions.insert(session.session_id.clone(), session);
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn lookup(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(session_id).map(|s| s.clone()))
    }

    async fn set_active(&self, session_id: &str, active: bool) -> Result<()> {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.is_active = active;
        }
        Ok(())
    }
}

/// One user's directory record
#[derive(Debug, Clone)]
pub struct UserRecord {
    /// Current role
    pub role: Role,
    /// Administrative lock
    pub locked: bool,
    /// MFA requirement
    pub mfa_required: bool,
}

/// In-memory user directory for tests and single-node deployments
#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    users: DashMap<String, UserRecord>,
}

impl InMemoryUserDirectory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user record
    pub fn insert(&self, user_id: &str, record: UserRecord) {
        self.users.insert(user_id.to_string(), record);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn role(&self, user_id: &str) -> Result<Role> {
        // Unknown users resolve to the least-privileged role
        Ok(self.users.get(user_id).map_or(Role::Student, |u| u.role))
    }

    async fn is_locked(&self, user_id: &str) -> Result<bool> {
        Ok(self.users.get(user_id).is_some_and(|u| u.locked))
    }

    async fn mfa_required(&self, user_id: &str) -> Result<bool> {
        Ok(self.users.get(user_id).is_some_and(|u| u.mfa_required))
    }
}
