//! Perturbation generation: one modified prompt per unit or per unit group.

use crate::config::PerturbationConfig;
use crate::error::AttributionError;
use crate::partition::{Partition, Unit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Caller-supplied transform: `(prompt, unit, partition) -> perturbed prompt`.
///
/// Returning `None` aborts the run with [`AttributionError::InvalidPerturbation`].
pub type TransformFn = Arc<dyn Fn(&str, &Unit, &Partition) -> Option<String> + Send + Sync>;

/// How a unit is perturbed.
#[derive(Clone, Default)]
pub enum PerturbationPolicy {
    /// Excise the unit's span.
    #[default]
    Removal,
    /// Replace the unit's content with `mask`, keeping its surrounding whitespace.
    MaskReplacement { mask: String },
    Custom(TransformFn),
}

impl std::fmt::Debug for PerturbationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Removal => write!(f, "Removal"),
            Self::MaskReplacement { mask } => {
                f.debug_struct("MaskReplacement").field("mask", mask).finish()
            }
            Self::Custom(_) => write!(f, "Custom(<fn>)"),
        }
    }
}

impl PerturbationPolicy {
    /// Wrap a caller-supplied transform.
    pub fn custom<F>(transform: F) -> Self
    where
        F: Fn(&str, &Unit, &Partition) -> Option<String> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(transform))
    }

    pub fn from_config(config: &PerturbationConfig) -> Result<Self, AttributionError> {
        match config {
            PerturbationConfig::Removal => Ok(Self::Removal),
            PerturbationConfig::MaskReplacement { mask } if mask.is_empty() => Err(
                AttributionError::configuration("mask_replacement requires a non-empty `mask`"),
            ),
            PerturbationConfig::MaskReplacement { mask } => {
                Ok(Self::MaskReplacement { mask: mask.clone() })
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Removal => "removal",
            Self::MaskReplacement { .. } => "mask_replacement",
            Self::Custom(_) => "custom",
        }
    }
}

/// A prompt with one or more units perturbed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerturbedPrompt {
    /// Indices of the perturbed units, ascending.
    pub units: Vec<usize>,
    pub text: String,
}

/// Produce one perturbed prompt per unit, in unit index order.
pub fn generate(
    prompt: &str,
    partition: &Partition,
    policy: &PerturbationPolicy,
) -> Result<Vec<PerturbedPrompt>, AttributionError> {
    check_alignment(prompt, partition)?;

    partition
        .iter()
        .map(|unit| {
            let text = match policy {
                PerturbationPolicy::Custom(transform) => {
                    transform(prompt, unit, partition).ok_or_else(|| {
                        AttributionError::InvalidPerturbation {
                            units: vec![unit.index],
                            reason: "custom transform returned no text".to_string(),
                        }
                    })?
                }
                _ => apply(prompt, partition, &[unit.index], policy),
            };
            Ok(PerturbedPrompt {
                units: vec![unit.index],
                text,
            })
        })
        .collect()
}

/// Produce one perturbed prompt per group, perturbing every unit of the group at once.
///
/// Groups must be non-empty and reference valid unit indices. Custom transforms
/// operate on single units and are rejected here.
pub fn generate_groups(
    prompt: &str,
    partition: &Partition,
    policy: &PerturbationPolicy,
    groups: &[Vec<usize>],
) -> Result<Vec<PerturbedPrompt>, AttributionError> {
    check_alignment(prompt, partition)?;
    if matches!(policy, PerturbationPolicy::Custom(_)) {
        return Err(AttributionError::configuration(
            "custom perturbation does not support unit groups",
        ));
    }
    if groups.is_empty() {
        return Err(AttributionError::configuration("no unit groups given"));
    }

    groups
        .iter()
        .enumerate()
        .map(|(g, group)| {
            let indices: Vec<usize> = group
                .iter()
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if indices.is_empty() {
                return Err(AttributionError::configuration(format!(
                    "unit group {g} is empty"
                )));
            }
            if let Some(bad) = indices.iter().find(|&&i| i >= partition.len()) {
                return Err(AttributionError::configuration(format!(
                    "unit group {g} references unit {bad}, partition has {}",
                    partition.len()
                )));
            }
            let text = apply(prompt, partition, &indices, policy);
            Ok(PerturbedPrompt {
                units: indices,
                text,
            })
        })
        .collect()
}

fn check_alignment(prompt: &str, partition: &Partition) -> Result<(), AttributionError> {
    let covered = partition.units().last().map_or(0, |u| u.end);
    if covered != prompt.len() {
        return Err(AttributionError::invalid_partition(format!(
            "partition covers {covered} bytes but prompt has {}",
            prompt.len()
        )));
    }
    if let Some(unit) = partition
        .iter()
        .find(|u| prompt.get(u.range()) != Some(u.text.as_str()))
    {
        return Err(AttributionError::invalid_partition(format!(
            "unit {} ({}..{}) does not match the prompt text",
            unit.index, unit.start, unit.end
        )));
    }
    Ok(())
}

/// Rebuild the prompt with the units at `targets` (ascending) removed or masked.
fn apply(
    prompt: &str,
    partition: &Partition,
    targets: &[usize],
    policy: &PerturbationPolicy,
) -> String {
    let mut out = String::with_capacity(prompt.len());
    let mut next_target = targets.iter().peekable();

    for unit in partition {
        if next_target.peek() != Some(&&unit.index) {
            out.push_str(&prompt[unit.range()]);
            continue;
        }
        next_target.next();

        if let PerturbationPolicy::MaskReplacement { mask } = policy {
            let content = unit.content_range();
            out.push_str(&prompt[unit.start..content.start]);
            out.push_str(mask);
            out.push_str(&prompt[content.end..unit.end]);
        }
    }
    out
}
