//! Property-based tests for partitioning, perturbation and ranking.

use ablate_core::partition::partition;
use ablate_core::perturb::generate;
use ablate_core::{AttributionRecord, PartitionStrategy, PerturbationPolicy, RankBy, rank};
use proptest::prelude::*;

fn prompt_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Zé0-9 ,.!?;\n]{1,80}".prop_filter("needs visible text", |s| !s.trim().is_empty())
}

// --- Partition reconstruction properties ---

proptest! {
    #[test]
    fn word_partition_reconstructs_prompt(prompt in prompt_strategy()) {
        let p = partition(&prompt, &PartitionStrategy::Word).unwrap();
        prop_assert_eq!(p.reconstruct(), prompt);
    }

    #[test]
    fn sentence_partition_reconstructs_prompt(prompt in prompt_strategy()) {
        let p = partition(&prompt, &PartitionStrategy::default()).unwrap();
        prop_assert_eq!(p.reconstruct(), prompt);
    }

    #[test]
    fn partition_indices_are_dense(prompt in prompt_strategy()) {
        let p = partition(&prompt, &PartitionStrategy::Word).unwrap();
        prop_assert!(!p.is_empty());
        for (i, unit) in p.iter().enumerate() {
            prop_assert_eq!(unit.index, i);
            prop_assert!(unit.start < unit.end);
        }
    }

    #[test]
    fn removal_yields_one_prompt_per_unit(prompt in prompt_strategy()) {
        let p = partition(&prompt, &PartitionStrategy::Word).unwrap();
        let perturbed = generate(&prompt, &p, &PerturbationPolicy::Removal).unwrap();
        prop_assert_eq!(perturbed.len(), p.len());
        for (unit, pp) in p.iter().zip(&perturbed) {
            prop_assert_eq!(&pp.units, &vec![unit.index]);
            prop_assert_eq!(pp.text.len(), prompt.len() - unit.text.len());
        }
    }
}

// --- Ranking properties ---

proptest! {
    #[test]
    fn rank_is_an_idempotent_permutation(
        scores in prop::collection::vec(-10i32..10, 0..30)
    ) {
        let records: Vec<AttributionRecord> = scores
            .iter()
            .enumerate()
            .map(|(unit_index, s)| AttributionRecord { unit_index, score: *s as f64 / 2.0 })
            .collect();
        for by in [RankBy::ScoreDesc, RankBy::ScoreAsc, RankBy::MagnitudeDesc] {
            let once = rank(&records, by);
            prop_assert_eq!(once.len(), records.len());
            prop_assert_eq!(rank(&once, by), once.clone());
            let mut indices: Vec<usize> = once.iter().map(|r| r.unit_index).collect();
            indices.sort_unstable();
            prop_assert_eq!(indices, (0..records.len()).collect::<Vec<_>>());
        }
    }
}
