//! Server configuration.

use std::path::Path;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use super::error::ConfigError;

/// Token bucket parameters for the token endpoint, per client id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Burst size. `0` disables rate limiting.
    pub capacity: u32,
    /// Tokens added per minute.
    pub refill_per_minute: u32,
    /// Upper bound on tracked client ids. New ids beyond it are refused
    /// until idle buckets are evicted.
    pub max_tracked_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { capacity: 30, refill_per_minute: 30, max_tracked_keys: 10_000 }
    }
}

/// Authorization server configuration.
///
/// Every field has a default, so a JSON document only needs the keys it
/// overrides:
///
/// ```
/// use starberry_authz::AuthzConfig;
///
/// let config = AuthzConfig::from_json_str(r#"{ "issuer": "https://auth.example" }"#).unwrap();
/// assert_eq!(config.authorization_code_ttl_secs, 120);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthzConfig {
    /// `iss` claim of issued tokens and base of the published endpoint URLs.
    pub issuer: String,
    pub authorization_code_ttl_secs: u64,
    /// How long a suspended authorize request waits for a consent decision.
    pub consent_ttl_secs: u64,
    /// How long a consumed code is remembered for replay detection.
    pub code_replay_window_secs: u64,
    /// Budget for each storage call.
    pub storage_timeout_ms: u64,
    pub sweep_interval_secs: u64,
    /// Accept public clients that authenticate with a PKCE verifier.
    pub allow_public_clients: bool,
    pub authorize_endpoint: String,
    pub token_endpoint: String,
    pub revocation_endpoint: String,
    pub jwks_endpoint: String,
    pub token_rate_limit: RateLimitConfig,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:8080".into(),
            authorization_code_ttl_secs: 120,
            consent_ttl_secs: 600,
            code_replay_window_secs: 3600,
            storage_timeout_ms: 2000,
            sweep_interval_secs: 30,
            allow_public_clients: false,
            authorize_endpoint: "/oauth/authorize".into(),
            token_endpoint: "/oauth/token".into(),
            revocation_endpoint: "/oauth/revoke".into(),
            jwks_endpoint: "/.well-known/jwks.json".into(),
            token_rate_limit: RateLimitConfig::default(),
        }
    }
}

impl AuthzConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: AuthzConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.trim().is_empty() {
            return Err(ConfigError::invalid("issuer", "must not be empty"));
        }
        if !(1..=600).contains(&self.authorization_code_ttl_secs) {
            return Err(ConfigError::invalid("authorization_code_ttl_secs", "must be between 1 and 600"));
        }
        if self.consent_ttl_secs == 0 {
            return Err(ConfigError::invalid("consent_ttl_secs", "must be positive"));
        }
        if self.code_replay_window_secs < self.authorization_code_ttl_secs {
            return Err(ConfigError::invalid(
                "code_replay_window_secs",
                "must be at least authorization_code_ttl_secs",
            ));
        }
        if self.storage_timeout_ms == 0 {
            return Err(ConfigError::invalid("storage_timeout_ms", "must be positive"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid("sweep_interval_secs", "must be positive"));
        }
        if self.token_rate_limit.capacity > 0 && self.token_rate_limit.max_tracked_keys == 0 {
            return Err(ConfigError::invalid("token_rate_limit.max_tracked_keys", "must be positive"));
        }
        for (key, path) in [
            ("authorize_endpoint", &self.authorize_endpoint),
            ("token_endpoint", &self.token_endpoint),
            ("revocation_endpoint", &self.revocation_endpoint),
            ("jwks_endpoint", &self.jwks_endpoint),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::invalid(key, "must start with '/'"));
            }
        }
        Ok(())
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn with_code_ttl(mut self, secs: u64) -> Self {
        self.authorization_code_ttl_secs = secs;
        self
    }

    pub fn with_consent_ttl(mut self, secs: u64) -> Self {
        self.consent_ttl_secs = secs;
        self
    }

    pub fn with_storage_timeout_ms(mut self, ms: u64) -> Self {
        self.storage_timeout_ms = ms;
        self
    }

    pub fn with_public_clients(mut self, allow: bool) -> Self {
        self.allow_public_clients = allow;
        self
    }

    pub fn with_token_rate_limit(mut self, capacity: u32, refill_per_minute: u32) -> Self {
        self.token_rate_limit = RateLimitConfig { capacity, refill_per_minute, ..self.token_rate_limit };
        self
    }

    pub fn code_ttl(&self) -> Duration {
        Duration::seconds(self.authorization_code_ttl_secs as i64)
    }

    pub fn consent_ttl(&self) -> Duration {
        Duration::seconds(self.consent_ttl_secs as i64)
    }

    pub fn code_replay_window(&self) -> Duration {
        Duration::seconds(self.code_replay_window_secs as i64)
    }

    pub fn storage_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    /// Absolute URL of an endpoint path under the issuer.
    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}{}", self.issuer.trim_end_matches('/'), path)
    }
}
