//! Connection settings for remote oracles.
//!
//! Loaded the same way as the attribution config: serde defaults -> optional
//! TOML file -> environment (`ABLATE_ORACLE_` prefix, `__` separator, e.g.
//! `ABLATE_ORACLE_RETRY__MAX_RETRIES=5`).

use ablate_core::AttributionError;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for oracle overrides.
pub const ENV_PREFIX: &str = "ABLATE_ORACLE_";

/// Settings for [`HttpOracle`](crate::HttpOracle) and [`HttpSampler`](crate::HttpSampler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpOracleConfig {
    /// Server root; `/score` and `/sample` are appended.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model identifier forwarded to the server, if it hosts several.
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable holding a bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Whether the server tolerates several score requests in flight.
    #[serde(default = "default_true")]
    pub concurrent: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

impl Default for HttpOracleConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: None,
            api_key_env: None,
            request_timeout_secs: default_request_timeout_secs(),
            concurrent: true,
            retry: RetryConfig::default(),
        }
    }
}

impl HttpOracleConfig {
    /// Config pointing at `base_url` with every other field defaulted.
    pub fn for_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), AttributionError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(AttributionError::configuration(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(AttributionError::configuration(
                "request_timeout_secs must be at least 1",
            ));
        }
        self.retry.validate()
    }
}

/// Exponential backoff for transient oracle errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Shorten each delay by a random share of up to 25%.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), AttributionError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(AttributionError::configuration(
                "retry.backoff_multiplier must be a finite number >= 1.0",
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(AttributionError::configuration(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms",
            ));
        }
        Ok(())
    }
}

/// Load oracle settings from an optional TOML file plus `ABLATE_ORACLE_*` env vars.
pub fn load_oracle_config(path: Option<&Path>) -> Result<HttpOracleConfig, AttributionError> {
    let mut figment = Figment::new();

    if let Some(path) = path {
        if !path.exists() {
            return Err(AttributionError::configuration(format!(
                "oracle configuration file not found: {}",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
    let config: HttpOracleConfig = figment.extract()?;
    config.validate()?;
    tracing::debug!(
        base_url = %config.base_url,
        model = ?config.model,
        max_retries = config.retry.max_retries,
        "Loaded oracle config"
    );
    Ok(config)
}
