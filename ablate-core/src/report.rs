//! Attribution reports, the stable output consumed by dashboards and viewers.

use crate::config::Normalization;
use crate::error::AttributionError;
use crate::estimator::{Attribution, AttributionRecord};
use crate::rank::RankBy;
use serde::{Deserialize, Serialize};

/// One unit with its text span and score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitAttribution {
    pub index: usize,
    pub text: String,
    pub start: usize,
    pub end: usize,
    /// Raw log-likelihood delta.
    pub score: f64,
    /// Score after the report's normalization.
    pub normalized: f64,
}

/// Attribution packaged with prompt, completion and unit texts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionReport {
    pub prompt: String,
    pub completion: String,
    pub baseline_log_likelihood: f64,
    pub normalization: Normalization,
    /// Units in index order.
    pub units: Vec<UnitAttribution>,
}

impl AttributionReport {
    pub fn new(
        attribution: &Attribution,
        prompt: &str,
        completion: &str,
        normalization: Normalization,
    ) -> Self {
        let scores = attribution.scores();
        let normalized = normalize(&scores, normalization);
        let units = attribution
            .partition
            .iter()
            .zip(attribution.records.iter().zip(normalized))
            .map(|(unit, (record, normalized))| UnitAttribution {
                index: unit.index,
                text: unit.text.clone(),
                start: unit.start,
                end: unit.end,
                score: record.score,
                normalized,
            })
            .collect();

        Self {
            prompt: prompt.to_string(),
            completion: completion.to_string(),
            baseline_log_likelihood: attribution.baseline,
            normalization,
            units,
        }
    }

    /// Raw `(unit_index, score)` records in unit order.
    pub fn records(&self) -> Vec<AttributionRecord> {
        self.units
            .iter()
            .map(|u| AttributionRecord {
                unit_index: u.index,
                score: u.score,
            })
            .collect()
    }

    /// Units sorted by `by` (stable, ties by ascending index).
    pub fn ranked(&self, by: RankBy) -> Vec<&UnitAttribution> {
        let mut units: Vec<&UnitAttribution> = self.units.iter().collect();
        units.sort_by(|a, b| by.compare((a.score, a.index), (b.score, b.index)));
        units
    }

    /// The first `k` units under `by`.
    pub fn top_k(&self, k: usize, by: RankBy) -> Vec<&UnitAttribution> {
        let mut ranked = self.ranked(by);
        ranked.truncate(k);
        ranked
    }

    pub fn to_json(&self) -> Result<String, AttributionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, AttributionError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Rescale scores for comparison across prompts. An all-zero vector stays zero.
pub fn normalize(scores: &[f64], normalization: Normalization) -> Vec<f64> {
    let denominator = match normalization {
        Normalization::None => return scores.to_vec(),
        Normalization::L1 => scores.iter().map(|s| s.abs()).sum::<f64>(),
        Normalization::MaxAbs => scores.iter().fold(0.0_f64, |m, s| m.max(s.abs())),
    };
    if denominator == 0.0 {
        return vec![0.0; scores.len()];
    }
    scores.iter().map(|s| s / denominator).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{PartitionStrategy, partition};
    use pretty_assertions::assert_eq;

    fn sample_attribution() -> Attribution {
        Attribution {
            records: vec![
                AttributionRecord { unit_index: 0, score: 0.5 },
                AttributionRecord { unit_index: 1, score: 7.5 },
                AttributionRecord { unit_index: 2, score: -2.0 },
            ],
            partition: partition("A. B. C.", &PartitionStrategy::default()).unwrap(),
            baseline: -3.0,
        }
    }

    #[test]
    fn test_report_carries_unit_texts() {
        let report = sample_attribution().report("A. B. C.", " D.", Normalization::None);
        let texts: Vec<&str> = report.units.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(texts, vec!["A.", " B.", " C."]);
        assert_eq!(report.units[1].start, 2);
        assert_eq!(report.units[1].normalized, 7.5);
        assert_eq!(report.records(), sample_attribution().records);
    }

    #[test]
    fn test_l1_normalization() {
        let report = sample_attribution().report("A. B. C.", " D.", Normalization::L1);
        let normalized: Vec<f64> = report.units.iter().map(|u| u.normalized).collect();
        assert_eq!(normalized, vec![0.05, 0.75, -0.2]);
    }

    #[test]
    fn test_max_abs_normalization() {
        assert_eq!(
            normalize(&[2.0, -4.0, 1.0], Normalization::MaxAbs),
            vec![0.5, -1.0, 0.25]
        );
    }

    #[test]
    fn test_all_zero_scores_normalize_to_zero() {
        assert_eq!(normalize(&[0.0, 0.0], Normalization::L1), vec![0.0, 0.0]);
        assert_eq!(normalize(&[0.0], Normalization::MaxAbs), vec![0.0]);
    }

    #[test]
    fn test_top_k_by_magnitude() {
        let report = sample_attribution().report("A. B. C.", " D.", Normalization::None);
        let top: Vec<usize> = report
            .top_k(2, RankBy::MagnitudeDesc)
            .iter()
            .map(|u| u.index)
            .collect();
        assert_eq!(top, vec![1, 2]);
    }

    #[test]
    fn test_json_roundtrip() {
        let report = sample_attribution().report("A. B. C.", " D.", Normalization::MaxAbs);
        let json = report.to_json().unwrap();
        assert!(json.contains("\"normalization\": \"max_abs\""));
        assert_eq!(AttributionReport::from_json(&json).unwrap(), report);
    }
}
