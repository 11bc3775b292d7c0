//! # ablate-core — perturbation attribution for sequence generation models
//!
//! Given a prompt, a completion, and a way to split the prompt into units
//! (words, sentences, custom spans), estimates how much each unit contributed
//! to the model assigning the completion its likelihood.
//!
//! The pipeline:
//! 1. [`partition`]: split the prompt into non-overlapping units
//! 2. [`perturb`]: build one perturbed prompt per unit (removal, masking, custom)
//! 3. [`estimator`]: score baseline + perturbed prompts in one batch through a
//!    [`LikelihoodOracle`] and take log-likelihood deltas
//! 4. [`rank`] / [`report`]: sort and package results for display
//!
//! The model itself lives behind the [`LikelihoodOracle`] trait; see the
//! `ablate-oracles` crate for an HTTP adapter.

pub mod config;
pub mod error;
pub mod estimator;
pub mod oracle;
pub mod partition;
pub mod perturb;
pub mod progress;
pub mod rank;
pub mod report;

// Re-exports
pub use config::{
    AttributionConfig, Normalization, PartitionConfig, PerturbationConfig, Reduction,
    ScoringConfig, load_config,
};
pub use error::{AttributionError, OracleError};
pub use estimator::{
    Attribution, AttributionEstimator, AttributionRecord, GroupAttribution,
    GroupAttributionRecord,
};
pub use oracle::{
    ExclusiveOracle, FnOracle, LikelihoodOracle, LikelihoodResult, MockOracle, Sampler,
};
pub use partition::{Partition, PartitionStrategy, SentenceOptions, Unit};
pub use perturb::{PerturbationPolicy, PerturbedPrompt};
pub use progress::{CountingProgress, ProgressSink, TracingProgress};
pub use rank::{RankBy, rank};
pub use report::{AttributionReport, UnitAttribution};

/// Attribute with the documented defaults: sentence partition, removal, sum reduction.
pub async fn attribute(
    oracle: &dyn LikelihoodOracle,
    prompt: &str,
    completion: &str,
) -> Result<Attribution, AttributionError> {
    AttributionEstimator::default()
        .attribute(oracle, prompt, completion)
        .await
}
