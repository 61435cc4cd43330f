//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::routes::SecurityClass;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Loaded in order, later files override earlier. Variables are set into
    /// the process environment for `env:VAR` resolution.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Token signing and lifetime configuration
    pub tokens: TokenConfig,
    /// Cookie attributes for the token cookies
    pub cookies: CookieConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Route classification rules (consulted before the built-in defaults)
    pub routes: Vec<RouteRuleConfig>,
    /// CORS configuration for API routes
    pub cors: CorsConfig,
    /// Redirect targets used by the decision engine
    pub redirects: RedirectConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Timeout for session and revocation store lookups.
    /// A timed-out session lookup reads as "inactive" (fail closed).
    #[serde(with = "humantime_serde")]
    pub upstream_timeout: Duration,
    /// Trust the first `X-Forwarded-For` hop for the client IP.
    /// Only enable behind a proxy that strips inbound XFF headers.
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8443,
            upstream_timeout: Duration::from_millis(300),
            trust_forwarded_for: false,
        }
    }
}

/// Token signing and lifetime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HMAC signing key. Supports a literal value or `env:VAR_NAME`.
    pub signing_key: String,
    /// Access token lifetime
    #[serde(with = "humantime_serde")]
    pub access_ttl: Duration,
    /// Refresh token lifetime
    #[serde(with = "humantime_serde")]
    pub refresh_ttl: Duration,
    /// Reject tokens whose device fingerprint does not match the requester
    pub device_binding: bool,
    /// Clock skew tolerance for expiry checks, in seconds
    pub leeway_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            signing_key: "env:CAMPUS_GATEWAY_SIGNING_KEY".to_string(),
            access_ttl: Duration::from_secs(15 * 60),
            refresh_ttl: Duration::from_secs(7 * 24 * 3600),
            device_binding: true,
            leeway_secs: 30,
        }
    }
}

impl TokenConfig {
    /// Resolve the signing key (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_signing_key(&self) -> Option<String> {
        if let Some(var_name) = self.signing_key.strip_prefix("env:") {
            env::var(var_name).ok()
        } else if self.signing_key.is_empty() {
            None
        } else {
            Some(self.signing_key.clone())
        }
    }
}

/// Cookie attributes for the token cookies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Set the `Secure` attribute (disable only for local development)
    pub secure: bool,
    /// Path restriction for the refresh token cookie
    pub refresh_path: String,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            secure: true,
            refresh_path: "/api/auth/refresh".to_string(),
        }
    }
}

/// A rate-limit policy: at most `max_requests` per `window`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RatePolicy {
    /// Maximum requests per window
    pub max_requests: u32,
    /// Window duration
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Policy for protected and admin routes
    pub normal: RatePolicy,
    /// Policy for authentication endpoints (login, register, password reset)
    pub strict: RatePolicy,
    /// How often idle windows and expired revocation entries are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            normal: RatePolicy {
                max_requests: 300,
                window: Duration::from_secs(60),
            },
            strict: RatePolicy {
                max_requests: 5,
                window: Duration::from_secs(60),
            },
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// A route classification rule from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRuleConfig {
    /// Path prefix to match
    pub prefix: String,
    /// Security class assigned to matching paths
    pub class: SecurityClass,
    /// Per-rule rate policy override
    #[serde(default)]
    pub max_requests: Option<u32>,
    /// Per-rule window override
    #[serde(default, with = "humantime_serde::option")]
    pub window: Option<Duration>,
}

/// CORS configuration for API routes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Origins allowed to make credentialed cross-origin API calls
    pub allowed_origins: Vec<String>,
    /// Prefix identifying API routes (Origin validation applies here)
    pub api_prefix: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            api_prefix: "/api".to_string(),
        }
    }
}

/// Redirect targets used by the decision engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    /// Login page, target for unauthenticated requests
    pub login_path: String,
    /// MFA challenge page
    pub mfa_path: String,
    /// Account-locked page
    pub locked_path: String,
    /// Logout endpoint handled by the gateway itself
    pub logout_path: String,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            login_path: "/login".to_string(),
            mfa_path: "/mfa-challenge".to_string(),
            locked_path: "/account-locked".to_string(),
            logout_path: "/api/auth/logout".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (CAMPUS_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("CAMPUS_GATEWAY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before signing-key resolution)
        config.load_env_files();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = Path::new(path_str);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {path_str}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {path_str}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {path_str}");
            }
        }
    }

    /// Validate the configuration without starting the server.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: unresolvable signing key, zero-width
    /// rate windows, empty or duplicate route prefixes.
    pub fn validate(&self) -> Result<()> {
        if self.tokens.resolve_signing_key().is_none() {
            return Err(Error::Config(format!(
                "Signing key not resolvable: {}",
                self.tokens.signing_key
            )));
        }

        for policy in [&self.rate_limit.normal, &self.rate_limit.strict] {
            if policy.max_requests == 0 || policy.window.is_zero() {
                return Err(Error::Config(
                    "Rate policy must have max_requests > 0 and a non-zero window".to_string(),
                ));
            }
        }

        for (i, rule) in self.routes.iter().enumerate() {
            if rule.prefix.is_empty() || !rule.prefix.starts_with('/') {
                return Err(Error::Config(format!(
                    "Route rule {i}: prefix must start with '/'"
                )));
            }
            if self.routes[..i].iter().any(|r| r.prefix == rule.prefix) {
                return Err(Error::Config(format!(
                    "Route rule {i}: duplicate prefix '{}'",
                    rule.prefix
                )));
            }
            if let Some(w) = rule.window {
                if w.is_zero() {
                    return Err(Error::Config(format!(
                        "Route rule {i}: window must be non-zero"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_with_env_key() {
        let config = Config {
            tokens: TokenConfig {
                signing_key: "literal-test-key".to_string(),
                ..TokenConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn signing_key_env_resolution() {
        let tokens = TokenConfig {
            signing_key: "env:CAMPUS_GATEWAY_TEST_KEY_UNSET".to_string(),
            ..TokenConfig::default()
        };
        assert!(tokens.resolve_signing_key().is_none());

        let tokens = TokenConfig {
            signing_key: "inline-secret".to_string(),
            ..TokenConfig::default()
        };
        assert_eq!(tokens.resolve_signing_key().as_deref(), Some("inline-secret"));
    }

    #[test]
    fn duplicate_route_prefixes_rejected() {
        let config = Config {
            tokens: TokenConfig {
                signing_key: "k".to_string(),
                ..TokenConfig::default()
            },
            routes: vec![
                RouteRuleConfig {
                    prefix: "/courses".to_string(),
                    class: SecurityClass::Protected,
                    max_requests: None,
                    window: None,
                },
                RouteRuleConfig {
                    prefix: "/courses".to_string(),
                    class: SecurityClass::Public,
                    max_requests: None,
                    window: None,
                },
            ],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_yaml_file() {
        use pretty_assertions::assert_eq;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(
            &path,
            concat!(
                "server:\n",
                "  port: 9001\n",
                "tokens:\n",
                "  signing_key: file-key\n",
                "  access_ttl: 5m\n",
                "rate_limit:\n",
                "  strict:\n",
                "    max_requests: 3\n",
                "    window: 30s\n",
            ),
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.tokens.access_ttl, Duration::from_secs(300));
        assert_eq!(config.rate_limit.strict.max_requests, 3);
        assert_eq!(config.rate_limit.strict.window, Duration::from_secs(30));
        // Sections absent from the file keep their defaults
        assert_eq!(config.rate_limit.normal.max_requests, 300);
        assert_eq!(config.redirects.login_path, "/login");
    }

    #[test]
    fn load_missing_file_errors() {
        let err = Config::load(Some(Path::new("/nonexistent/gateway.yaml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn zero_width_window_rejected() {
        let mut config = Config {
            tokens: TokenConfig {
                signing_key: "k".to_string(),
                ..TokenConfig::default()
            },
            ..Config::default()
        };
        config.rate_limit.strict.window = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
