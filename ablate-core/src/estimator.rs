//! Attribution estimator: leave-one-out likelihood deltas per prompt unit.
//!
//! One call partitions the prompt, perturbs every unit, and scores the
//! original prompt plus all N perturbed prompts through the oracle as a single
//! N+1 batch (index 0 is the baseline). Each unit's score is
//!
//! ```text
//! score_i = reduce(baseline) - reduce(perturbed_i)
//! ```
//!
//! so a positive score means the unit supported the completion and a negative
//! score means it suppressed it. Records come back in unit order; ranking is a
//! separate step (see [`crate::rank`]).
//!
//! The scoring phase is all-or-nothing: an oracle failure, an undefined
//! likelihood, a non-finite score, or the timeout aborts the whole call.

use crate::config::{AttributionConfig, Normalization, Reduction, ScoringConfig};
use crate::error::AttributionError;
use crate::oracle::{LikelihoodOracle, LikelihoodResult, Sampler};
use crate::partition::{Partition, PartitionStrategy, partition};
use crate::perturb::{self, PerturbationPolicy};
use crate::progress::ProgressSink;
use crate::report::AttributionReport;
use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Score of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub unit_index: usize,
    /// Baseline log-likelihood minus perturbed log-likelihood.
    pub score: f64,
}

/// Score of a group of units perturbed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAttributionRecord {
    pub unit_indices: Vec<usize>,
    pub score: f64,
}

/// Result of one attribution call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    /// One record per unit, in unit order.
    pub records: Vec<AttributionRecord>,
    pub partition: Partition,
    /// Reduced log-likelihood of the completion under the unperturbed prompt.
    pub baseline: f64,
}

impl Attribution {
    pub fn scores(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.score).collect()
    }

    /// Package with unit texts for display.
    pub fn report(
        &self,
        prompt: &str,
        completion: &str,
        normalization: Normalization,
    ) -> AttributionReport {
        AttributionReport::new(self, prompt, completion, normalization)
    }
}

/// Result of a group attribution call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAttribution {
    /// One record per requested group, in request order.
    pub records: Vec<GroupAttributionRecord>,
    pub partition: Partition,
    pub baseline: f64,
}

/// Orchestrates partitioning, perturbation and batched oracle scoring.
///
/// The estimator holds configuration only; every call owns its own partition
/// and perturbed prompts, so one estimator can serve concurrent calls.
#[derive(Clone, Default)]
pub struct AttributionEstimator {
    strategy: PartitionStrategy,
    policy: PerturbationPolicy,
    reduction: Reduction,
    normalization: Normalization,
    scoring: ScoringConfig,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl std::fmt::Debug for AttributionEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributionEstimator")
            .field("strategy", &self.strategy)
            .field("policy", &self.policy)
            .field("reduction", &self.reduction)
            .field("normalization", &self.normalization)
            .field("scoring", &self.scoring)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl AttributionEstimator {
    pub fn new(strategy: PartitionStrategy, policy: PerturbationPolicy) -> Self {
        Self {
            strategy,
            policy,
            ..Default::default()
        }
    }

    /// Build from a declarative config, validating it first.
    pub fn from_config(config: &AttributionConfig) -> Result<Self, AttributionError> {
        config.validate()?;
        Ok(Self {
            strategy: PartitionStrategy::from_config(&config.partition)?,
            policy: PerturbationPolicy::from_config(&config.perturbation)?,
            reduction: config.reduction,
            normalization: config.normalization,
            scoring: config.scoring.clone(),
            progress: None,
        })
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringConfig) -> Result<Self, AttributionError> {
        scoring.validate()?;
        self.scoring = scoring;
        Ok(self)
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Attribute the likelihood of `completion` to the units of `prompt`.
    pub async fn attribute(
        &self,
        oracle: &dyn LikelihoodOracle,
        prompt: &str,
        completion: &str,
    ) -> Result<Attribution, AttributionError> {
        let partition = partition(prompt, &self.strategy)?;
        let perturbed = perturb::generate(prompt, &partition, &self.policy)?;

        info!(
            oracle = oracle.name(),
            strategy = self.strategy.name(),
            policy = self.policy.name(),
            units = partition.len(),
            "Starting attribution"
        );

        let mut batch = Vec::with_capacity(perturbed.len() + 1);
        batch.push(prompt.to_string());
        batch.extend(perturbed.into_iter().map(|p| p.text));

        let (baseline, perturbed_likelihoods) = self.score_batch(oracle, &batch, completion).await?;
        let records = perturbed_likelihoods
            .iter()
            .enumerate()
            .map(|(unit_index, likelihood)| {
                Ok(AttributionRecord {
                    unit_index,
                    score: delta(baseline, *likelihood, || format!("unit {unit_index}"))?,
                })
            })
            .collect::<Result<Vec<_>, AttributionError>>()?;

        Ok(Attribution {
            records,
            partition,
            baseline,
        })
    }

    /// Attribute to groups of units, each group perturbed as a whole.
    pub async fn attribute_groups(
        &self,
        oracle: &dyn LikelihoodOracle,
        prompt: &str,
        completion: &str,
        groups: &[Vec<usize>],
    ) -> Result<GroupAttribution, AttributionError> {
        let partition = partition(prompt, &self.strategy)?;
        let perturbed = perturb::generate_groups(prompt, &partition, &self.policy, groups)?;

        info!(
            oracle = oracle.name(),
            units = partition.len(),
            groups = perturbed.len(),
            "Starting group attribution"
        );

        let mut batch = Vec::with_capacity(perturbed.len() + 1);
        batch.push(prompt.to_string());
        batch.extend(perturbed.iter().map(|p| p.text.clone()));

        let (baseline, perturbed_likelihoods) = self.score_batch(oracle, &batch, completion).await?;
        let records = perturbed
            .into_iter()
            .zip(perturbed_likelihoods)
            .enumerate()
            .map(|(g, (p, likelihood))| {
                Ok(GroupAttributionRecord {
                    score: delta(baseline, likelihood, || format!("group {g}"))?,
                    unit_indices: p.units,
                })
            })
            .collect::<Result<Vec<_>, AttributionError>>()?;

        Ok(GroupAttribution {
            records,
            partition,
            baseline,
        })
    }

    /// Sample a completion for `prompt`, then attribute it.
    pub async fn explain_generation(
        &self,
        sampler: &dyn Sampler,
        oracle: &dyn LikelihoodOracle,
        prompt: &str,
        max_new_tokens: usize,
    ) -> Result<(String, Attribution), AttributionError> {
        if prompt.is_empty() {
            return Err(AttributionError::empty_input("prompt is empty"));
        }
        let timeout_ms = self.scoring.timeout_ms;
        let samples = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            sampler.sample(&[prompt.to_string()], max_new_tokens),
        )
        .await
        .map_err(|_| AttributionError::ScoringTimeout { timeout_ms })?
        .map_err(AttributionError::oracle)?;

        let completion = samples
            .into_iter()
            .next()
            .ok_or_else(|| AttributionError::scoring("sampler returned no completion"))?;
        debug!(chars = completion.len(), "Sampled completion");

        let attribution = self.attribute(oracle, prompt, &completion).await?;
        Ok((completion, attribution))
    }

    /// Score the batch under the configured timeout and reduce every result.
    ///
    /// Returns the baseline (batch index 0) and the reduced likelihoods of the
    /// remaining prompts, in order.
    async fn score_batch(
        &self,
        oracle: &dyn LikelihoodOracle,
        batch: &[String],
        completion: &str,
    ) -> Result<(f64, Vec<f64>), AttributionError> {
        let timeout_ms = self.scoring.timeout_ms;
        let started = Instant::now();

        let results = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.dispatch(oracle, batch, completion),
        )
        .await
        .map_err(|_| {
            warn!(oracle = oracle.name(), timeout_ms, "Scoring timed out");
            AttributionError::ScoringTimeout { timeout_ms }
        })??;

        debug!(
            prompts = batch.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scored batch"
        );

        let mut likelihoods = results.iter().enumerate().map(|(i, result)| {
            result.reduce(self.reduction).ok_or_else(|| {
                let what = if i == 0 {
                    "baseline prompt".to_string()
                } else {
                    format!("perturbed prompt {}", i - 1)
                };
                AttributionError::scoring(format!(
                    "undefined or non-finite likelihood for {what}: {result:?}"
                ))
            })
        });

        let baseline = likelihoods
            .next()
            .ok_or_else(|| AttributionError::scoring("oracle returned no baseline"))??;
        let rest = likelihoods.collect::<Result<Vec<_>, _>>()?;
        Ok((baseline, rest))
    }

    /// Send the batch to the oracle, split into chunks if configured.
    async fn dispatch(
        &self,
        oracle: &dyn LikelihoodOracle,
        batch: &[String],
        completion: &str,
    ) -> Result<Vec<LikelihoodResult>, AttributionError> {
        let chunk_size = self.scoring.batch_size.unwrap_or(batch.len()).max(1);
        let concurrency = if oracle.supports_concurrent_scoring() {
            self.scoring.max_concurrency
        } else {
            1
        };

        let pending: Vec<_> = batch
            .chunks(chunk_size)
            .map(|chunk| self.score_chunk(oracle, chunk, completion))
            .collect();
        let chunks: Vec<Vec<LikelihoodResult>> = stream::iter(pending)
            .buffered(concurrency)
            .try_collect()
            .await?;

        Ok(chunks.into_iter().flatten().collect())
    }

    async fn score_chunk(
        &self,
        oracle: &dyn LikelihoodOracle,
        chunk: &[String],
        completion: &str,
    ) -> Result<Vec<LikelihoodResult>, AttributionError> {
        let results = oracle.score(chunk, completion).await.map_err(|e| {
            warn!(oracle = oracle.name(), error = %e, "Oracle scoring failed");
            AttributionError::oracle(e)
        })?;

        if results.len() != chunk.len() {
            return Err(AttributionError::scoring(format!(
                "oracle returned {} results for {} prompts",
                results.len(),
                chunk.len()
            )));
        }
        if let Some(progress) = &self.progress {
            progress.advance(chunk.len());
        }
        Ok(results)
    }
}

fn delta(
    baseline: f64,
    perturbed: f64,
    what: impl FnOnce() -> String,
) -> Result<f64, AttributionError> {
    let score = baseline - perturbed;
    if score.is_finite() {
        Ok(score)
    } else {
        Err(AttributionError::scoring(format!(
            "non-finite score for {}",
            what()
        )))
    }
}
