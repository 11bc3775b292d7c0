//! Retry of transient oracle failures.
//!
//! Delays grow geometrically from `initial_backoff_ms` and never exceed
//! `max_backoff_ms`; jitter only ever shortens a delay, so the cap holds with
//! jitter on. A rate limit whose server hint is longer than the cap is handed
//! back to the caller at once instead of being slept through.

use crate::config::RetryConfig;
use ablate_core::OracleError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Largest share of a delay removed by jitter.
const JITTER_SHARE: f64 = 0.25;

/// Run `operation`, retrying transient errors per `config`.
///
/// Errors for which [`OracleError::is_transient`] is false are returned
/// unchanged after the first attempt, as is the last error once retries run out.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, OracleError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, OracleError>>,
{
    let mut backoff = Backoff::new(config);
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let Some(delay) = backoff.next_delay(&err) else {
            return Err(err);
        };
        warn!(
            retry = backoff.retries,
            max_retries = config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Oracle request failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Delay schedule of one request.
struct Backoff<'a> {
    config: &'a RetryConfig,
    retries: u32,
}

impl<'a> Backoff<'a> {
    fn new(config: &'a RetryConfig) -> Self {
        Self { config, retries: 0 }
    }

    /// Delay before the next attempt, or `None` if `err` should be returned.
    fn next_delay(&mut self, err: &OracleError) -> Option<Duration> {
        if !err.is_transient() || self.retries >= self.config.max_retries {
            return None;
        }

        let scheduled = self.scheduled_ms();
        let delay_ms = match err {
            OracleError::RateLimited { retry_after_secs } => {
                let requested = retry_after_secs.saturating_mul(1000);
                if requested > self.config.max_backoff_ms {
                    debug!(
                        requested_ms = requested,
                        max_backoff_ms = self.config.max_backoff_ms,
                        "Rate limit outlasts the backoff cap"
                    );
                    return None;
                }
                scheduled.max(requested)
            }
            _ => scheduled,
        };

        self.retries += 1;
        Some(Duration::from_millis(delay_ms))
    }

    fn scheduled_ms(&self) -> u64 {
        let exponent = i32::try_from(self.retries).unwrap_or(i32::MAX);
        let grown =
            self.config.initial_backoff_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let capped = grown.min(self.config.max_backoff_ms as f64);
        if self.config.jitter {
            (capped * (1.0 - JITTER_SHARE * rand::random::<f64>())) as u64
        } else {
            capped as u64
        }
    }
}
