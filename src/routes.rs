//! Route classification
//!
//! Maps every request path to exactly one security class. Classification is
//! a pure function over a table that is built once at startup: rules from
//! configuration are consulted first, then the built-in defaults. Paths
//! matched by no rule are `Protected` — never `Public`.

use serde::{Deserialize, Serialize};

use crate::config::{RatePolicy, RouteRuleConfig};

/// Security class of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityClass {
    /// No authentication; only security headers applied
    Public,
    /// Requires a valid access token and an active session
    Protected,
    /// Requires an admin or super-admin role on top of `Protected`
    AdminOnly,
    /// Login/register/password-reset style endpoints; strict rate limiting
    AuthEndpoint,
}

impl SecurityClass {
    /// Short label for rate-limit keys and log fields
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Protected => "protected",
            Self::AdminOnly => "admin",
            Self::AuthEndpoint => "auth",
        }
    }
}

/// A single classification rule: path prefix, class, optional rate policy
#[derive(Debug, Clone)]
pub struct RouteRule {
    prefix: String,
    class: SecurityClass,
    policy: Option<RatePolicy>,
}

impl RouteRule {
    /// Whether `path` falls under this rule's prefix.
    ///
    /// A prefix matches itself and any path below it (`/admin` matches
    /// `/admin` and `/admin/dashboard`, not `/administrata`). The root
    /// prefix `/` matches only the root path.
    fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return path == "/";
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }
}

/// Immutable route table; first matching rule wins
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    /// Build the table from config rules followed by the built-in defaults
    #[must_use]
    pub fn new(config_rules: &[RouteRuleConfig]) -> Self {
        let mut rules: Vec<RouteRule> = config_rules
            .iter()
            .map(|r| RouteRule {
                prefix: r.prefix.clone(),
                class: r.class,
                policy: match (r.max_requests, r.window) {
                    (Some(max_requests), Some(window)) => Some(RatePolicy {
                        max_requests,
                        window,
                    }),
                    _ => None,
                },
            })
            .collect();
        rules.extend(Self::builtin_rules());
        Self { rules }
    }

    fn builtin_rules() -> Vec<RouteRule> {
        let rule = |prefix: &str, class| RouteRule {
            prefix: prefix.to_string(),
            class,
            policy: None,
        };
        vec![
            rule("/", SecurityClass::Public),
            rule("/health", SecurityClass::Public),
            rule("/static", SecurityClass::Public),
            rule("/assets", SecurityClass::Public),
            rule("/favicon.ico", SecurityClass::Public),
            rule("/robots.txt", SecurityClass::Public),
            rule("/login", SecurityClass::AuthEndpoint),
            rule("/register", SecurityClass::AuthEndpoint),
            rule("/password-reset", SecurityClass::AuthEndpoint),
            rule("/api/auth", SecurityClass::AuthEndpoint),
            rule("/admin", SecurityClass::AdminOnly),
            rule("/api/admin", SecurityClass::AdminOnly),
        ]
    }

    /// Classify a request path. Total: unmatched paths are `Protected`.
    #[must_use]
    pub fn classify(&self, path: &str) -> SecurityClass {
        self.matched_rule(path)
            .map_or(SecurityClass::Protected, |r| r.class)
    }

    /// Per-rule rate policy override for a path, if its rule carries one
    #[must_use]
    pub fn policy_override(&self, path: &str) -> Option<RatePolicy> {
        self.matched_rule(path).and_then(|r| r.policy)
    }

    fn matched_rule(&self, path: &str) -> Option<&RouteRule> {
        self.rules.iter().find(|r| r.matches(path))
    }
}
