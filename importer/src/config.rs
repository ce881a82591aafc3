use crate::rate_limiter::{AdaptiveConfig, RateLimiterConfig};
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Provider admin token is empty")]
    EmptyAdminToken,

    #[error("HTTP rate limit window and request count must be positive")]
    InvalidRateWindow,

    #[error("Retry base delay {base_delay_ms}ms exceeds max delay {max_delay_ms}ms")]
    InvalidRetryDelays { base_delay_ms: u64, max_delay_ms: u64 },

    #[error("Provider rate limit needs a positive token count and rate")]
    InvalidRateLimit,
}

/// Importer service configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Job API listener
    #[serde(default = "default_listener")]
    pub listener: Listener,
    /// Listener for /health and /ready
    #[serde(default = "default_admin_listener")]
    pub admin_listener: Listener,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Overrides the per-job limiter sizing when set.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub http_rate_limit: HttpRateLimitConfig,
    /// Approved preview id to external username.
    #[serde(default)]
    pub approved_previews: HashMap<String, String>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.provider.admin_token.trim().is_empty() {
            return Err(ValidationError::EmptyAdminToken);
        }
        if self.http_rate_limit.window_secs == 0 || self.http_rate_limit.requests == 0 {
            return Err(ValidationError::InvalidRateWindow);
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ValidationError::InvalidRetryDelays {
                base_delay_ms: self.retry.base_delay_ms,
                max_delay_ms: self.retry.max_delay_ms,
            });
        }
        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.max_tokens == 0 || rate_limit.base_rate <= 0.0 {
                return Err(ValidationError::InvalidRateLimit);
            }
        }
        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

fn default_listener() -> Listener {
    Listener {
        host: "127.0.0.1".into(),
        port: 3000,
    }
}

fn default_admin_listener() -> Listener {
    Listener {
        host: "127.0.0.1".into(),
        port: 3001,
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// Base URL of the telematics API
    pub url: Url,
    pub admin_token: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    pub max_tokens: u32,
    /// Tokens per second
    pub base_rate: f64,
    #[serde(default)]
    pub adaptive: bool,
}

impl RateLimitConfig {
    pub fn limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            max_tokens: self.max_tokens,
            base_rate: self.base_rate,
            adaptive: self.adaptive.then(AdaptiveConfig::default),
        }
    }
}

/// Per-caller limit on the job API.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpRateLimitConfig {
    pub requests: u32,
    pub window_secs: u64,
}

impl Default for HttpRateLimitConfig {
    fn default() -> Self {
        HttpRateLimitConfig {
            requests: 10,
            window_secs: 1,
        }
    }
}
