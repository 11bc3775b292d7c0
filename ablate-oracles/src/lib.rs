//! # ablate-oracles — remote likelihood oracles for ablate
//!
//! [`HttpOracle`] implements [`ablate_core::LikelihoodOracle`] against a
//! scoring server speaking a small JSON protocol, and [`HttpSampler`]
//! implements [`ablate_core::Sampler`] against the same server. Transient
//! failures (timeouts, 429, 5xx) are retried with exponential backoff.

pub mod config;
pub mod http;
pub mod retry;

pub use config::{HttpOracleConfig, RetryConfig, load_oracle_config};
pub use http::{HttpOracle, HttpSampler};
pub use retry::with_retry;
