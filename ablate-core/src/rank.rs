//! Ranking of attribution records for presentation.

use crate::estimator::AttributionRecord;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Sort order for attribution records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankBy {
    /// Most supportive unit first.
    #[default]
    ScoreDesc,
    /// Most suppressive unit first.
    ScoreAsc,
    /// Largest absolute effect first, regardless of sign.
    MagnitudeDesc,
}

impl RankBy {
    /// Compare two `(score, unit_index)` pairs; ties fall back to ascending index.
    pub fn compare(self, a: (f64, usize), b: (f64, usize)) -> Ordering {
        let by_score = match self {
            Self::ScoreDesc => b.0.total_cmp(&a.0),
            Self::ScoreAsc => a.0.total_cmp(&b.0),
            Self::MagnitudeDesc => b.0.abs().total_cmp(&a.0.abs()),
        };
        by_score.then(a.1.cmp(&b.1))
    }
}

/// Return `records` sorted by `by`. The input is left untouched.
pub fn rank(records: &[AttributionRecord], by: RankBy) -> Vec<AttributionRecord> {
    let mut ranked = records.to_vec();
    ranked.sort_by(|a, b| by.compare((a.score, a.unit_index), (b.score, b.unit_index)));
    ranked
}
