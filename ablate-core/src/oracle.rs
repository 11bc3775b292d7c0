//! Likelihood oracle, the one model-facing capability the estimator needs.
//!
//! Any model wrapper implementing [`LikelihoodOracle`] can be explained: it
//! receives a batch of prompts plus a fixed completion and returns, per prompt
//! and in the same order, the log-likelihood of the completion (natural log).
//! The estimator never assumes a tokenizer, architecture or precision.
//!
//! Stateful oracles (e.g. one GPU-resident model) that must not be called
//! concurrently should be wrapped in [`ExclusiveOracle`] at the call site.

use crate::config::Reduction;
use crate::error::OracleError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Log-likelihood of a completion under one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LikelihoodResult {
    /// Total log-likelihood.
    Scalar(f64),
    /// Log-probability of each completion token.
    PerToken(Vec<f64>),
    /// Zero-probability event or otherwise undefined likelihood.
    Undefined,
}

impl LikelihoodResult {
    /// Collapse to a scalar. `None` if undefined or if the reduced value is not finite.
    pub fn reduce(&self, reduction: Reduction) -> Option<f64> {
        let value = match self {
            Self::Scalar(v) => *v,
            Self::PerToken(tokens) => match reduction {
                Reduction::Sum => tokens.iter().sum(),
                Reduction::Mean if tokens.is_empty() => return None,
                Reduction::Mean => tokens.iter().sum::<f64>() / tokens.len() as f64,
            },
            Self::Undefined => return None,
        };
        value.is_finite().then_some(value)
    }
}

/// Model wrapper that scores a fixed completion under many prompts.
#[async_trait]
pub trait LikelihoodOracle: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Score `completion` under each prompt. Must return exactly one result per
    /// prompt, in prompt order.
    async fn score(
        &self,
        prompts: &[String],
        completion: &str,
    ) -> Result<Vec<LikelihoodResult>, OracleError>;

    /// Whether several `score` calls may safely run at the same time.
    fn supports_concurrent_scoring(&self) -> bool {
        false
    }
}

/// Optional generation capability used to produce a completion before attribution.
#[async_trait]
pub trait Sampler: Send + Sync {
    async fn sample(
        &self,
        prompts: &[String],
        max_new_tokens: usize,
    ) -> Result<Vec<String>, OracleError>;
}

/// Oracle backed by an in-process scoring function `(prompt, completion) -> result`.
///
/// The function is pure from the estimator's point of view, so concurrent
/// scoring is allowed.
pub struct FnOracle<F> {
    name: String,
    score_fn: F,
}

impl<F> FnOracle<F>
where
    F: Fn(&str, &str) -> Result<LikelihoodResult, OracleError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, score_fn: F) -> Self {
        Self {
            name: name.into(),
            score_fn,
        }
    }
}

#[async_trait]
impl<F> LikelihoodOracle for FnOracle<F>
where
    F: Fn(&str, &str) -> Result<LikelihoodResult, OracleError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn score(
        &self,
        prompts: &[String],
        completion: &str,
    ) -> Result<Vec<LikelihoodResult>, OracleError> {
        prompts
            .iter()
            .map(|p| (self.score_fn)(p, completion))
            .collect()
    }

    fn supports_concurrent_scoring(&self) -> bool {
        true
    }
}

/// Serializes access to a stateful oracle shared across attribution calls.
pub struct ExclusiveOracle<O> {
    inner: tokio::sync::Mutex<O>,
    name: String,
}

impl<O: LikelihoodOracle> ExclusiveOracle<O> {
    pub fn new(inner: O) -> Self {
        let name = format!("exclusive({})", inner.name());
        Self {
            inner: tokio::sync::Mutex::new(inner),
            name,
        }
    }

    pub fn into_inner(self) -> O {
        self.inner.into_inner()
    }
}

#[async_trait]
impl<O: LikelihoodOracle> LikelihoodOracle for ExclusiveOracle<O> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn score(
        &self,
        prompts: &[String],
        completion: &str,
    ) -> Result<Vec<LikelihoodResult>, OracleError> {
        let guard = self.inner.lock().await;
        guard.score(prompts, completion).await
    }
}

/// Scripted oracle for tests.
///
/// Returns the result registered for a prompt, or the default for unknown
/// prompts, and records every batch it receives.
pub struct MockOracle {
    results: HashMap<String, LikelihoodResult>,
    default: LikelihoodResult,
    failure: Mutex<Option<OracleError>>,
    delay: Option<Duration>,
    concurrent: bool,
    calls: Mutex<Vec<Vec<String>>>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            results: HashMap::new(),
            default: LikelihoodResult::Scalar(0.0),
            failure: Mutex::new(None),
            delay: None,
            concurrent: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Register the result returned for `prompt`.
    pub fn with_result(mut self, prompt: impl Into<String>, result: LikelihoodResult) -> Self {
        self.results.insert(prompt.into(), result);
        self
    }

    /// Register a scalar log-likelihood for `prompt`.
    pub fn with_scalar(self, prompt: impl Into<String>, log_likelihood: f64) -> Self {
        self.with_result(prompt, LikelihoodResult::Scalar(log_likelihood))
    }

    pub fn with_default(mut self, result: LikelihoodResult) -> Self {
        self.default = result;
        self
    }

    /// Fail the next `score` call with `error`.
    pub fn with_failure(self, error: OracleError) -> Self {
        *self.failure.lock().unwrap() = Some(error);
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_concurrency(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// Every batch received so far, in call order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Total prompts scored across all calls.
    pub fn prompts_scored(&self) -> usize {
        self.calls.lock().unwrap().iter().map(Vec::len).sum()
    }
}

impl Default for MockOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LikelihoodOracle for MockOracle {
    fn name(&self) -> &str {
        "mock"
    }

    async fn score(
        &self,
        prompts: &[String],
        _completion: &str,
    ) -> Result<Vec<LikelihoodResult>, OracleError> {
        self.calls.lock().unwrap().push(prompts.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failure.lock().unwrap().take() {
            return Err(err);
        }
        Ok(prompts
            .iter()
            .map(|p| self.results.get(p).unwrap_or(&self.default).clone())
            .collect())
    }

    fn supports_concurrent_scoring(&self) -> bool {
        self.concurrent
    }
}
