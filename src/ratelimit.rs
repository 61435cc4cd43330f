//! Fixed-window rate limiting
//!
//! Request counts are tracked per (client IP, route class) key. Each key owns
//! one window: the first request in a window sets the start time, subsequent
//! requests increment the count, and a window is replaced exactly once when
//! its duration has elapsed. Counts never decrease within a window.
//!
//! The limiter is a capability trait rather than a module-level map so that
//! multi-instance deployments can substitute an external store. The in-memory
//! implementation serializes the read-increment-write sequence per key via
//! the `DashMap` entry API.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::RatePolicy;
use crate::routes::SecurityClass;
use crate::{Error, Result};

/// Rate-limit bucket identifier: one bucket per client per route class.
/// Ephemeral — recomputed per request, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientKey {
    /// Source IP of the request
    pub ip: IpAddr,
    /// Security class of the requested route
    pub class: SecurityClass,
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Under the limit; request may proceed
    Allowed,
    /// Over the limit; retry after the window rolls over
    Limited {
        /// Time remaining until the current window expires
        retry_after: Duration,
    },
}

/// Rate limiter capability
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count this request against `key` under `policy`.
    ///
    /// # Errors
    ///
    /// Implementations backed by external storage may fail; the caller
    /// decides fail-open vs fail-closed per route class.
    async fn check(&self, key: ClientKey, policy: RatePolicy) -> Result<RateDecision>;

    /// Drop windows with no traffic for longer than their duration
    async fn sweep(&self);
}

/// One counting window for a single key
#[derive(Debug)]
struct RateWindow {
    count: u32,
    started_at: Instant,
    window: Duration,
}

/// In-memory fixed-window limiter for single-instance deployments
#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    windows: DashMap<ClientKey, RateWindow>,
}

impl InMemoryRateLimiter {
    /// Create an empty limiter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live windows (for sweep diagnostics)
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check(&self, key: ClientKey, policy: RatePolicy) -> Result<RateDecision> {
        if policy.max_requests == 0 || policy.window.is_zero() {
            return Err(Error::Config("rate policy with empty window".to_string()));
        }

        let now = Instant::now();
        // The entry guard holds the shard lock for the whole
        // read-increment-write sequence: no lost updates per key.
        let mut entry = self.windows.entry(key).or_insert_with(|| RateWindow {
            count: 0,
            started_at: now,
            window: policy.window,
        });
        let w = entry.value_mut();

        let elapsed = now.duration_since(w.started_at);
        if elapsed >= w.window {
            // Rollover: reset exactly once, counting this request
            w.count = 1;
            w.started_at = now;
            w.window = policy.window;
            return Ok(RateDecision::Allowed);
        }

        w.count += 1;
        if w.count > policy.max_requests {
            Ok(RateDecision::Limited {
                retry_after: w.window - elapsed,
            })
        } else {
            Ok(RateDecision::Allowed)
        }
    }

    async fn sweep(&self) {
        self.windows
            .retain(|_, w| w.started_at.elapsed() < w.window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(class: SecurityClass) -> ClientKey {
        ClientKey {
            ip: "203.0.113.7".parse().unwrap(),
            class,
        }
    }

    fn policy(max: u32, window_ms: u64) -> RatePolicy {
        RatePolicy {
            max_requests: max,
            window: Duration::from_millis(window_ms),
        }
    }

    #[tokio::test]
    async fn allows_up_to_max_then_limits() {
        let limiter = InMemoryRateLimiter::new();
        let k = key(SecurityClass::AuthEndpoint);
        let p = policy(5, 60_000);

        for _ in 0..5 {
            assert_eq!(limiter.check(k, p).await.unwrap(), RateDecision::Allowed);
        }
        match limiter.check(k, p).await.unwrap() {
            RateDecision::Limited { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            RateDecision::Allowed => panic!("sixth request must be limited"),
        }
    }

    #[tokio::test]
    async fn window_rollover_resets_once() {
        let limiter = InMemoryRateLimiter::new();
        let k = key(SecurityClass::Protected);
        let p = policy(1, 30);

        assert_eq!(limiter.check(k, p).await.unwrap(), RateDecision::Allowed);
        assert!(matches!(
            limiter.check(k, p).await.unwrap(),
            RateDecision::Limited { .. }
        ));

        tokio::time::sleep(Duration::from_millis(40)).await;
        // First request after expiry starts a fresh window
        assert_eq!(limiter.check(k, p).await.unwrap(), RateDecision::Allowed);
        // And the reset happened exactly once: the next request counts as #2
        assert!(matches!(
            limiter.check(k, p).await.unwrap(),
            RateDecision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = InMemoryRateLimiter::new();
        let p = policy(1, 60_000);
        let auth = key(SecurityClass::AuthEndpoint);
        let normal = key(SecurityClass::Protected);

        assert_eq!(limiter.check(auth, p).await.unwrap(), RateDecision::Allowed);
        assert!(matches!(
            limiter.check(auth, p).await.unwrap(),
            RateDecision::Limited { .. }
        ));
        // Same IP, different class: separate bucket
        assert_eq!(
            limiter.check(normal, p).await.unwrap(),
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn concurrent_checks_lose_no_updates() {
        use std::sync::Arc;

        let limiter = Arc::new(InMemoryRateLimiter::new());
        let k = key(SecurityClass::Protected);
        let p = policy(50, 60_000);

        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.check(k, p).await }));
        }

        let mut allowed = 0;
        let mut limited = 0;
        for h in handles {
            match h.await.unwrap().unwrap() {
                RateDecision::Allowed => allowed += 1,
                RateDecision::Limited { .. } => limited += 1,
            }
        }
        // Exactly max requests admitted, the rest limited
        assert_eq!(allowed, 50);
        assert_eq!(limited, 50);
    }

    #[tokio::test]
    async fn sweep_drops_idle_windows() {
        let limiter = InMemoryRateLimiter::new();
        let k = key(SecurityClass::Protected);
        let p = policy(10, 20);

        limiter.check(k, p).await.unwrap();
        assert_eq!(limiter.window_count(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        limiter.sweep().await;
        assert_eq!(limiter.window_count(), 0);
    }
}
