//! Prompt partitioning into ordered, non-overlapping units.
//!
//! Every built-in strategy produces units that, concatenated in index order,
//! reproduce the input exactly. Whitespace is never dropped: it is attached to
//! the unit that FOLLOWS it, and whitespace at the very end of the text is
//! attached to the last unit. So `"A. B. C."` split by sentence yields
//! `"A."`, `" B."`, `" C."`.
//!
//! Offsets are UTF-8 byte offsets and always fall on char boundaries.

use crate::config::PartitionConfig;
use crate::error::AttributionError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::{Arc, LazyLock};

static WORD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*(?:\w+|[^\w\s]+)").expect("word pattern is valid"));

/// Chars that end a sentence.
const TERMINATORS: &[char] = &['.', '!', '?', '…'];

/// Chars allowed to trail a terminator inside the same sentence.
const CLOSERS: &[char] = &['"', '\'', ')', ']', '}', '”', '’', '»'];

/// Lowercased abbreviations (without their final period) that never end a sentence.
const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "e.g", "i.e", "cf", "fig",
    "no", "vol", "inc", "ltd", "co", "corp", "approx", "dept", "est", "jan", "feb", "mar", "apr",
    "jun", "jul", "aug", "sep", "sept", "oct", "nov", "dec",
];

/// Caller-supplied splitting function returning byte ranges of the input.
pub type SplitFn = Arc<dyn Fn(&str) -> Vec<Range<usize>> + Send + Sync>;

/// One contiguous span of the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Position in partition order.
    pub index: usize,
    /// Byte offset of the first byte.
    pub start: usize,
    /// Byte offset one past the last byte.
    pub end: usize,
    /// Raw text of the span, whitespace included.
    pub text: String,
}

impl Unit {
    /// Byte range of the span within the prompt.
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Byte range of the span with surrounding whitespace excluded.
    ///
    /// For a whitespace-only unit this is an empty range at `end`.
    pub fn content_range(&self) -> Range<usize> {
        let leading = self.text.len() - self.text.trim_start().len();
        let trimmed = self.text.trim();
        let start = self.start + leading;
        start..start + trimmed.len()
    }
}

/// Ordered sequence of units covering a prompt. Never empty.
///
/// Deserialized partitions go through the same validation as
/// [`Partition::from_spans`], with the unit texts standing in for the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UnitList")]
pub struct Partition {
    units: Vec<Unit>,
}

#[derive(Deserialize)]
struct UnitList {
    units: Vec<Unit>,
}

impl TryFrom<UnitList> for Partition {
    type Error = AttributionError;

    fn try_from(list: UnitList) -> Result<Self, Self::Error> {
        let text: String = list.units.iter().map(|u| u.text.as_str()).collect();
        let spans: Vec<Range<usize>> = list.units.iter().map(Unit::range).collect();
        let partition = Self::from_spans(&text, &spans)?;

        let mismatch = partition
            .units
            .iter()
            .zip(&list.units)
            .position(|(built, given)| built != given);
        if let Some(i) = mismatch {
            let unit = &list.units[i];
            return Err(AttributionError::invalid_partition(format!(
                "unit {i} (index {}, {}..{}) does not match its text {:?}",
                unit.index, unit.start, unit.end, unit.text
            )));
        }
        Ok(partition)
    }
}

impl Partition {
    /// Build a partition from byte ranges, validating the coverage invariant.
    ///
    /// The ranges must be non-empty, start at 0, be contiguous and
    /// non-overlapping, end at `text.len()`, and fall on char boundaries.
    pub fn from_spans(text: &str, spans: &[Range<usize>]) -> Result<Self, AttributionError> {
        if spans.is_empty() {
            return Err(AttributionError::empty_input("partition produced no units"));
        }

        let mut expected_start = 0;
        for (i, span) in spans.iter().enumerate() {
            if span.start != expected_start {
                let kind = if span.start < expected_start {
                    "overlaps the previous unit"
                } else {
                    "leaves a gap after the previous unit"
                };
                return Err(AttributionError::invalid_partition(format!(
                    "unit {i} ({}..{}) {kind} ending at {expected_start}",
                    span.start, span.end
                )));
            }
            if span.end <= span.start {
                return Err(AttributionError::invalid_partition(format!(
                    "unit {i} ({}..{}) is empty or reversed",
                    span.start, span.end
                )));
            }
            if span.end > text.len() {
                return Err(AttributionError::invalid_partition(format!(
                    "unit {i} ends at {} beyond text length {}",
                    span.end,
                    text.len()
                )));
            }
            if !text.is_char_boundary(span.start) || !text.is_char_boundary(span.end) {
                return Err(AttributionError::invalid_partition(format!(
                    "unit {i} ({}..{}) splits a UTF-8 character",
                    span.start, span.end
                )));
            }
            expected_start = span.end;
        }

        if expected_start != text.len() {
            return Err(AttributionError::invalid_partition(format!(
                "units cover {expected_start} of {} bytes",
                text.len()
            )));
        }

        let units = spans
            .iter()
            .enumerate()
            .map(|(index, span)| Unit {
                index,
                start: span.start,
                end: span.end,
                text: text[span.clone()].to_string(),
            })
            .collect();
        Ok(Self { units })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// `false` for every partition that passed validation.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn get(&self, index: usize) -> Option<&Unit> {
        self.units.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Unit> {
        self.units.iter()
    }

    /// Unit texts in index order.
    pub fn texts(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.text.as_str()).collect()
    }

    /// Concatenate unit texts; equals the partitioned prompt.
    pub fn reconstruct(&self) -> String {
        self.units.iter().map(|u| u.text.as_str()).collect()
    }
}

impl<'a> IntoIterator for &'a Partition {
    type Item = &'a Unit;
    type IntoIter = std::slice::Iter<'a, Unit>;

    fn into_iter(self) -> Self::IntoIter {
        self.units.iter()
    }
}

/// Options for sentence partitioning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentenceOptions {
    /// Additional abbreviations (case-insensitive, final period optional).
    pub extra_abbreviations: Vec<String>,
    /// Also end a sentence at each newline.
    pub split_on_newlines: bool,
}

/// How prompt text is split into units.
#[derive(Clone)]
pub enum PartitionStrategy {
    Word,
    Sentence(SentenceOptions),
    /// Boundary after every non-empty match of the delimiter pattern.
    Regex(Regex),
    Custom(SplitFn),
}

impl std::fmt::Debug for PartitionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Word => write!(f, "Word"),
            Self::Sentence(opts) => f.debug_tuple("Sentence").field(opts).finish(),
            Self::Regex(re) => f.debug_tuple("Regex").field(&re.as_str()).finish(),
            Self::Custom(_) => write!(f, "Custom(<fn>)"),
        }
    }
}

impl Default for PartitionStrategy {
    fn default() -> Self {
        Self::Sentence(SentenceOptions::default())
    }
}

impl PartitionStrategy {
    /// Wrap a caller-supplied splitting function.
    pub fn custom<F>(split: F) -> Self
    where
        F: Fn(&str) -> Vec<Range<usize>> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(split))
    }

    /// Build a strategy from its declarative configuration.
    pub fn from_config(config: &PartitionConfig) -> Result<Self, AttributionError> {
        match config {
            PartitionConfig::Word => Ok(Self::Word),
            PartitionConfig::Sentence {
                extra_abbreviations,
                split_on_newlines,
            } => Ok(Self::Sentence(SentenceOptions {
                extra_abbreviations: extra_abbreviations.clone(),
                split_on_newlines: *split_on_newlines,
            })),
            PartitionConfig::Regex { pattern } => {
                if pattern.is_empty() {
                    return Err(AttributionError::configuration(
                        "regex partition requires a non-empty `pattern`",
                    ));
                }
                Regex::new(pattern).map(Self::Regex).map_err(|e| {
                    AttributionError::configuration(format!("invalid partition pattern: {e}"))
                })
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Word => "word",
            Self::Sentence(_) => "sentence",
            Self::Regex(_) => "regex",
            Self::Custom(_) => "custom",
        }
    }
}

/// Split `text` into a validated partition.
pub fn partition(text: &str, strategy: &PartitionStrategy) -> Result<Partition, AttributionError> {
    if text.is_empty() {
        return Err(AttributionError::empty_input("prompt is empty"));
    }

    let spans = match strategy {
        PartitionStrategy::Word => word_spans(text),
        PartitionStrategy::Sentence(opts) => sentence_spans(text, opts),
        PartitionStrategy::Regex(re) => {
            let boundaries: Vec<usize> = re
                .find_iter(text)
                .filter(|m| !m.is_empty())
                .map(|m| m.end())
                .collect();
            spans_from_boundaries(text, &boundaries)
        }
        PartitionStrategy::Custom(split) => split(text),
    };

    let partition = Partition::from_spans(text, &spans)?;
    tracing::debug!(
        strategy = strategy.name(),
        units = partition.len(),
        bytes = text.len(),
        "Partitioned prompt"
    );
    Ok(partition)
}

/// Each word run or punctuation run, with its leading whitespace.
fn word_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans: Vec<Range<usize>> = WORD_PATTERN.find_iter(text).map(|m| m.range()).collect();
    if let Some(last) = spans.last_mut() {
        last.end = text.len();
    }
    spans
}

fn sentence_spans(text: &str, opts: &SentenceOptions) -> Vec<Range<usize>> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut boundaries = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];

        if opts.split_on_newlines && c == '\n' {
            boundaries.push(pos);
            i += 1;
            continue;
        }

        if !TERMINATORS.contains(&c) {
            i += 1;
            continue;
        }

        let mut j = i + 1;
        while j < chars.len() && TERMINATORS.contains(&chars[j].1) {
            j += 1;
        }
        while j < chars.len() && CLOSERS.contains(&chars[j].1) {
            j += 1;
        }

        let at_break = j == chars.len() || chars[j].1.is_whitespace();
        let single_period = c == '.' && (i + 1 == chars.len() || chars[i + 1].1 != '.');
        if at_break && !(single_period && is_abbreviation(text, pos, opts)) {
            let end = chars.get(j).map_or(text.len(), |(p, _)| *p);
            boundaries.push(end);
        }
        i = j;
    }

    spans_from_boundaries(text, &boundaries)
}

/// Whether the word ending right before the period at `period_pos` is an abbreviation.
fn is_abbreviation(text: &str, period_pos: usize, opts: &SentenceOptions) -> bool {
    let before = &text[..period_pos];
    let word_start = before
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map_or(0, |(p, c)| p + c.len_utf8());
    let word = before[word_start..]
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    if word.is_empty() {
        return false;
    }

    // Dotted initialisms such as "e.g", "a.m" or "u.s".
    let dotted = word.contains('.')
        && word.split('.').all(|seg| {
            (1..=2).contains(&seg.chars().count()) && seg.chars().all(char::is_alphabetic)
        });

    dotted
        || ABBREVIATIONS.contains(&word.as_str())
        || opts
            .extra_abbreviations
            .iter()
            .any(|a| a.trim_end_matches('.').to_lowercase() == word)
}

/// Cut `text` at the given byte positions. Whitespace-only segments are folded
/// into the next segment (or the previous one, at the end of the text).
fn spans_from_boundaries(text: &str, boundaries: &[usize]) -> Vec<Range<usize>> {
    let mut cuts: Vec<usize> = boundaries
        .iter()
        .copied()
        .filter(|&b| b > 0 && b < text.len())
        .collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut spans: Vec<Range<usize>> = Vec::with_capacity(cuts.len() + 1);
    let mut pending_start: Option<usize> = None;
    let mut start = 0;

    for end in cuts.into_iter().chain(std::iter::once(text.len())) {
        let segment = start..end;
        start = end;
        if text[segment.clone()].trim().is_empty() {
            pending_start.get_or_insert(segment.start);
            continue;
        }
        let begin = pending_start.take().unwrap_or(segment.start);
        spans.push(begin..segment.end);
    }

    if pending_start.is_some()
        && let Some(last) = spans.last_mut()
    {
        last.end = text.len();
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sentence() -> PartitionStrategy {
        PartitionStrategy::Sentence(SentenceOptions::default())
    }

    #[test]
    fn test_sentence_scenario_three_units() {
        let p = partition("A. B. C.", &sentence()).unwrap();
        assert_eq!(p.texts(), vec!["A.", " B.", " C."]);
        assert_eq!(p.get(1).unwrap().range(), 2..5);
    }

    #[test]
    fn test_sentence_keeps_abbreviations_together() {
        let text = "Dr. Smith arrived at 9 a.m. sharp. He left e.g. early! Why?";
        let p = partition(text, &sentence()).unwrap();
        assert_eq!(
            p.texts(),
            vec![
                "Dr. Smith arrived at 9 a.m. sharp.",
                " He left e.g. early!",
                " Why?"
            ]
        );
        assert_eq!(p.reconstruct(), text);
    }

    #[test]
    fn test_sentence_extra_abbreviation() {
        let opts = SentenceOptions {
            extra_abbreviations: vec!["Approx.".into(), "Lt".into()],
            split_on_newlines: false,
        };
        let p = partition("Ask Lt. Dan. Done.", &PartitionStrategy::Sentence(opts)).unwrap();
        assert_eq!(p.texts(), vec!["Ask Lt. Dan.", " Done."]);
    }

    #[test]
    fn test_sentence_closers_and_ellipsis() {
        let text = "He said \"stop.\" Then... nothing?! Fine";
        let p = partition(text, &sentence()).unwrap();
        assert_eq!(
            p.texts(),
            vec!["He said \"stop.\"", " Then...", " nothing?!", " Fine"]
        );
    }

    #[test]
    fn test_sentence_decimal_does_not_split() {
        let p = partition("Pi is 3.14 roughly. Yes.", &sentence()).unwrap();
        assert_eq!(p.texts(), vec!["Pi is 3.14 roughly.", " Yes."]);
    }

    #[test]
    fn test_sentence_trailing_whitespace_joins_last_unit() {
        let p = partition("One. Two.  \n", &sentence()).unwrap();
        assert_eq!(p.texts(), vec!["One.", " Two.  \n"]);
    }

    #[test]
    fn test_sentence_leading_whitespace_joins_first_unit() {
        let p = partition("  One. Two.", &sentence()).unwrap();
        assert_eq!(p.texts(), vec!["  One.", " Two."]);
    }

    #[test]
    fn test_sentence_newline_split_option() {
        let opts = SentenceOptions {
            split_on_newlines: true,
            ..Default::default()
        };
        let p = partition("- item one\n- item two.\n\nNext", &PartitionStrategy::Sentence(opts))
            .unwrap();
        assert_eq!(p.texts(), vec!["- item one", "\n- item two.", "\n\nNext"]);
    }

    #[test]
    fn test_sentence_without_terminator_is_one_unit() {
        let p = partition("no punctuation here", &sentence()).unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(p.get(0).unwrap().text, "no punctuation here");
    }

    #[test]
    fn test_word_units_carry_leading_whitespace() {
        let p = partition("Hello, wonderful world!", &PartitionStrategy::Word).unwrap();
        assert_eq!(p.texts(), vec!["Hello", ",", " wonderful", " world", "!"]);
    }

    #[test]
    fn test_word_unicode_offsets_on_char_boundaries() {
        let text = "Café — naïve ünits.";
        let p = partition(text, &PartitionStrategy::Word).unwrap();
        assert_eq!(p.texts(), vec!["Café", " —", " naïve", " ünits", "."]);
        for unit in &p {
            assert!(text.is_char_boundary(unit.start));
            assert!(text.is_char_boundary(unit.end));
        }
    }

    #[test]
    fn test_regex_delimiter_stays_with_preceding_unit() {
        let re = Regex::new(r";\s*").unwrap();
        let p = partition("a; b;c; ", &PartitionStrategy::Regex(re)).unwrap();
        assert_eq!(p.texts(), vec!["a; ", "b;", "c; "]);
    }

    #[test]
    fn test_empty_text_is_empty_input() {
        for strategy in [PartitionStrategy::Word, sentence()] {
            let err = partition("", &strategy).unwrap_err();
            assert!(matches!(err, AttributionError::EmptyInput { .. }));
        }
    }

    #[test]
    fn test_whitespace_only_text_is_empty_input() {
        let err = partition("   \n", &PartitionStrategy::Word).unwrap_err();
        assert!(matches!(err, AttributionError::EmptyInput { .. }));
    }

    #[test]
    fn test_custom_strategy_valid() {
        let strategy = PartitionStrategy::custom(|text: &str| {
            let mid = text.len() / 2;
            vec![0..mid, mid..text.len()]
        });
        let p = partition("abcdef", &strategy).unwrap();
        assert_eq!(p.texts(), vec!["abc", "def"]);
    }

    #[test]
    fn test_custom_strategy_overlap_rejected() {
        let strategy = PartitionStrategy::custom(|_| vec![0..4, 3..6]);
        let err = partition("abcdef", &strategy).unwrap_err();
        match err {
            AttributionError::InvalidPartition { reason } => assert!(reason.contains("overlaps")),
            other => panic!("Expected InvalidPartition, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_strategy_gap_rejected() {
        let strategy = PartitionStrategy::custom(|_| vec![0..2, 3..6]);
        let err = partition("abcdef", &strategy).unwrap_err();
        assert!(matches!(err, AttributionError::InvalidPartition { .. }));
    }

    #[test]
    fn test_custom_strategy_incomplete_coverage_rejected() {
        let strategy = PartitionStrategy::custom(|_| vec![0..3]);
        let err = partition("abcdef", &strategy).unwrap_err();
        match err {
            AttributionError::InvalidPartition { reason } => {
                assert!(reason.contains("cover 3 of 6"))
            }
            other => panic!("Expected InvalidPartition, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_strategy_char_boundary_rejected() {
        let strategy = PartitionStrategy::custom(|text: &str| vec![0..1, 1..text.len()]);
        let err = partition("éa", &strategy).unwrap_err();
        assert!(matches!(err, AttributionError::InvalidPartition { .. }));
    }

    #[test]
    fn test_custom_strategy_zero_units_is_empty_input() {
        let strategy = PartitionStrategy::custom(|_| Vec::new());
        let err = partition("abc", &strategy).unwrap_err();
        assert!(matches!(err, AttributionError::EmptyInput { .. }));
    }

    #[test]
    fn test_unit_content_range_excludes_whitespace() {
        let p = partition("A.  B. ", &sentence()).unwrap();
        let unit = p.get(1).unwrap();
        assert_eq!(unit.text, "  B. ");
        assert_eq!(unit.content_range(), 4..6);
    }

    #[test]
    fn test_whitespace_only_unit_content_range_is_empty() {
        let p = partition("ab  ", &PartitionStrategy::custom(|_| vec![0..2, 2..4])).unwrap();
        assert_eq!(p.get(1).unwrap().content_range(), 4..4);
    }

    #[test]
    fn test_deserialize_valid_partition() {
        let p = partition("One. Two.", &sentence()).unwrap();
        let json = serde_json::to_string(&p).unwrap();
        let back: Partition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_deserialize_overlapping_units_rejected() {
        let json = r#"{"units": [
            {"index": 0, "start": 0, "end": 2, "text": "ab"},
            {"index": 1, "start": 1, "end": 4, "text": "bcd"}
        ]}"#;
        let err = serde_json::from_str::<Partition>(json).unwrap_err();
        assert!(err.to_string().contains("overlaps"), "{err}");
    }

    #[test]
    fn test_deserialize_empty_partition_rejected() {
        assert!(serde_json::from_str::<Partition>(r#"{"units": []}"#).is_err());
    }

    #[test]
    fn test_deserialize_inconsistent_unit_rejected() {
        let wrong_length = r#"{"units": [{"index": 0, "start": 0, "end": 3, "text": "ab"}]}"#;
        assert!(serde_json::from_str::<Partition>(wrong_length).is_err());

        let wrong_index = r#"{"units": [
            {"index": 0, "start": 0, "end": 1, "text": "a"},
            {"index": 5, "start": 1, "end": 2, "text": "b"}
        ]}"#;
        let err = serde_json::from_str::<Partition>(wrong_index).unwrap_err();
        assert!(err.to_string().contains("index 5"), "{err}");
    }

    #[test]
    fn test_from_config_rejects_bad_regex() {
        let err = PartitionStrategy::from_config(&PartitionConfig::Regex {
            pattern: "(unclosed".into(),
        })
        .unwrap_err();
        assert!(matches!(err, AttributionError::Configuration { .. }));
    }
}
