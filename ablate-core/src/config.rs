//! Configuration types for an attribution run.
//!
//! Uses `figment` for layered loading: serde defaults -> TOML file -> environment
//! (`ABLATE_` prefix, `__` separator, e.g. `ABLATE_SCORING__BATCH_SIZE=8`).
//! Unknown keys are rejected so a typo never silently falls back to a default.

use crate::error::AttributionError;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "ABLATE_";

/// Full configuration of an attribution run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributionConfig {
    /// How the prompt is split into units.
    #[serde(default)]
    pub partition: PartitionConfig,
    /// How each unit is perturbed.
    #[serde(default)]
    pub perturbation: PerturbationConfig,
    /// How per-token log-probabilities collapse to one likelihood.
    #[serde(default)]
    pub reduction: Reduction,
    /// Normalization applied to reported scores.
    #[serde(default)]
    pub normalization: Normalization,
    /// Batching, concurrency and timeout of oracle calls.
    #[serde(default)]
    pub scoring: ScoringConfig,
}

impl AttributionConfig {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), AttributionError> {
        if let PartitionConfig::Regex { pattern } = &self.partition
            && pattern.is_empty()
        {
            return Err(AttributionError::configuration(
                "partition.pattern must not be empty",
            ));
        }
        if let PerturbationConfig::MaskReplacement { mask } = &self.perturbation
            && mask.is_empty()
        {
            return Err(AttributionError::configuration(
                "perturbation.mask must not be empty",
            ));
        }
        self.scoring.validate()
    }

    /// Serialize to TOML, e.g. to write a starter config file.
    pub fn to_toml(&self) -> Result<String, AttributionError> {
        toml::to_string_pretty(self)
            .map_err(|e| AttributionError::configuration(format!("cannot serialize config: {e}")))
    }
}

/// Partition strategy selection. Default: `sentence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case", deny_unknown_fields)]
pub enum PartitionConfig {
    Word,
    Sentence {
        #[serde(default)]
        extra_abbreviations: Vec<String>,
        #[serde(default)]
        split_on_newlines: bool,
    },
    Regex {
        pattern: String,
    },
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self::Sentence {
            extra_abbreviations: Vec::new(),
            split_on_newlines: false,
        }
    }
}

/// Perturbation policy selection. Default: `removal`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case", deny_unknown_fields)]
pub enum PerturbationConfig {
    #[default]
    Removal,
    MaskReplacement {
        mask: String,
    },
}

/// Reduction of a per-token log-probability sequence to a scalar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Joint log-likelihood of the completion.
    #[default]
    Sum,
    /// Length-normalized log-likelihood.
    Mean,
}

/// Normalization of scores for cross-prompt comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    #[default]
    None,
    /// Divide by the sum of absolute scores.
    L1,
    /// Divide by the largest absolute score.
    MaxAbs,
}

/// Oracle call scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoringConfig {
    /// Maximum prompts per oracle call. `None` sends all N+1 prompts at once.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Maximum chunks in flight when the oracle allows concurrent calls.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Budget for the whole scoring phase, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            max_concurrency: default_max_concurrency(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), AttributionError> {
        if self.batch_size == Some(0) {
            return Err(AttributionError::configuration(
                "scoring.batch_size must be at least 1",
            ));
        }
        if self.max_concurrency == 0 {
            return Err(AttributionError::configuration(
                "scoring.max_concurrency must be at least 1",
            ));
        }
        if self.timeout_ms == 0 {
            return Err(AttributionError::configuration(
                "scoring.timeout_ms must be positive",
            ));
        }
        Ok(())
    }
}

fn default_max_concurrency() -> usize {
    4
}

fn default_timeout_ms() -> u64 {
    300_000
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `ABLATE_`)
/// 2. The TOML file at `path`, if given (must exist)
/// 3. Built-in defaults
pub fn load_config(path: Option<&Path>) -> Result<AttributionConfig, AttributionError> {
    let mut figment = Figment::new();

    if let Some(path) = path {
        if !path.exists() {
            return Err(AttributionError::configuration(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    // `ABLATE_ORACLE_*` belongs to the oracle adapters' own config.
    let env = Env::prefixed(ENV_PREFIX)
        .filter(|key| !key.as_str().to_ascii_lowercase().starts_with("oracle_"))
        .split("__");
    extract(figment.merge(env))
}

/// Parse configuration from a TOML string (no environment layering).
pub fn parse_config(toml_text: &str) -> Result<AttributionConfig, AttributionError> {
    extract(Figment::new().merge(Toml::string(toml_text)))
}

fn extract(figment: Figment) -> Result<AttributionConfig, AttributionError> {
    let config: AttributionConfig = figment.extract()?;
    config.validate()?;
    tracing::debug!(
        partition = ?config.partition,
        perturbation = ?config.perturbation,
        reduction = ?config.reduction,
        "Loaded attribution config"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AttributionConfig::default();
        assert!(matches!(config.partition, PartitionConfig::Sentence { .. }));
        assert_eq!(config.perturbation, PerturbationConfig::Removal);
        assert_eq!(config.reduction, Reduction::Sum);
        assert_eq!(config.normalization, Normalization::None);
        assert_eq!(config.scoring.batch_size, None);
        assert_eq!(config.scoring.timeout_ms, 300_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_word_mask_config() {
        let config = parse_config(
            r#"
            reduction = "mean"

            [partition]
            strategy = "word"

            [perturbation]
            policy = "mask_replacement"
            mask = "[MASK]"

            [scoring]
            batch_size = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.partition, PartitionConfig::Word);
        assert_eq!(
            config.perturbation,
            PerturbationConfig::MaskReplacement {
                mask: "[MASK]".into()
            }
        );
        assert_eq!(config.reduction, Reduction::Mean);
        assert_eq!(config.scoring.batch_size, Some(8));
        assert_eq!(config.scoring.max_concurrency, 4);
    }

    #[test]
    fn test_unknown_strategy_is_configuration_error() {
        let err = parse_config("[partition]\nstrategy = \"paragraph\"\n").unwrap_err();
        assert!(matches!(err, AttributionError::Configuration { .. }));
    }

    #[test]
    fn test_unknown_top_level_key_is_configuration_error() {
        let err = parse_config("verbosity = 3\n").unwrap_err();
        assert!(matches!(err, AttributionError::Configuration { .. }));
    }

    #[test]
    fn test_mask_policy_requires_mask() {
        let err = parse_config("[perturbation]\npolicy = \"mask_replacement\"\n").unwrap_err();
        match err {
            AttributionError::Configuration { message } => assert!(message.contains("mask")),
            other => panic!("Expected Configuration, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = parse_config("[scoring]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, AttributionError::Configuration { .. }));
    }

    // Tests that read the environment run inside `Jail`, which serializes them
    // and restores the variables afterwards.
    #[test]
    fn test_load_config_from_file() {
        figment::Jail::expect_with(|_| {
            let mut file = tempfile::NamedTempFile::new().map_err(|e| e.to_string())?;
            writeln!(
                file,
                "[partition]\nstrategy = \"regex\"\npattern = \"\\\\n\"\n\n\
                 [scoring]\ntimeout_ms = 1500"
            )
            .map_err(|e| e.to_string())?;
            let config = load_config(Some(file.path())).map_err(|e| e.to_string())?;
            assert_eq!(
                config.partition,
                PartitionConfig::Regex {
                    pattern: "\\n".into()
                }
            );
            assert_eq!(config.scoring.timeout_ms, 1500);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "ablate.toml",
                "reduction = \"sum\"\n\n[partition]\nstrategy = \"word\"\n\n\
                 [scoring]\ntimeout_ms = 1500\n",
            )?;
            jail.set_env("ABLATE_SCORING__TIMEOUT_MS", "2500");
            jail.set_env("ABLATE_SCORING__BATCH_SIZE", "8");
            jail.set_env("ABLATE_REDUCTION", "mean");

            let config = load_config(Some(Path::new("ablate.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.partition, PartitionConfig::Word);
            assert_eq!(config.reduction, Reduction::Mean);
            assert_eq!(config.scoring.timeout_ms, 2500);
            assert_eq!(config.scoring.batch_size, Some(8));
            Ok(())
        });
    }

    #[test]
    fn test_oracle_env_vars_are_ignored() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("ABLATE_ORACLE_BASE_URL", "http://scoring.internal:9000");
            jail.set_env("ABLATE_ORACLE_RETRY__MAX_RETRIES", "1");

            let config = load_config(None).map_err(|e| e.to_string())?;
            assert_eq!(config, AttributionConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_unknown_env_key_is_configuration_error() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("ABLATE_VERBOSITY", "3");

            match load_config(None) {
                Err(AttributionError::Configuration { message }) => {
                    assert!(message.contains("verbosity"), "{message}");
                }
                other => panic!("Expected Configuration, got {:?}", other),
            }
            Ok(())
        });
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Some(Path::new("/nonexistent/ablate.toml"))).unwrap_err();
        assert!(matches!(err, AttributionError::Configuration { .. }));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AttributionConfig {
            perturbation: PerturbationConfig::MaskReplacement {
                mask: "<unk>".into(),
            },
            normalization: Normalization::L1,
            ..Default::default()
        };
        let text = config.to_toml().unwrap();
        let parsed = parse_config(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
