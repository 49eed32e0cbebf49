//! Essay Parser
//!
//! Essays are plain UTF-8 text annotated with three inline markers:
//!
//! ```text
//! ...earlier text [START]the part of the prompt shown in reports [CHANGEPOINT]what
//! the author actually wrote next[END] more text...
//! ```
//!
//! The k-th `[START]`, `[CHANGEPOINT]` and `[END]` form one triple, from which
//! three strings are cut:
//!
//! - **full prompt**: essay start → k-th CHANGEPOINT (everything the model sees)
//! - **short prompt**: k-th START → k-th CHANGEPOINT (the label used in reports)
//! - **actual output**: k-th CHANGEPOINT → k-th END (the ground-truth continuation)
//!
//! Every marker, including those of other triples, is removed from each slice.
//! The three marker counts must be equal or parsing fails; there is no attempt
//! to pair up a partially annotated essay.

use crate::error::{Result, TouchstoneError};
use std::fs;
use std::path::Path;

pub const START_MARKER: &str = "[START]";
pub const CHANGEPOINT_MARKER: &str = "[CHANGEPOINT]";
pub const END_MARKER: &str = "[END]";

/// One prompt/continuation pair cut from an essay
#[derive(Clone, Debug, PartialEq)]
pub struct PromptRecord {
    pub essay_id: usize,
    pub full_prompt: String,
    pub short_prompt: String,
    pub actual_output: String,
}

/// All triples of one essay, as parallel lists in marker order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EssayPrompts {
    pub essay_id: usize,
    pub prompts: Vec<String>,
    pub prompts_short: Vec<String>,
    pub actual_outputs: Vec<String>,
}

impl EssayPrompts {
    /// Number of triples in the essay
    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// The parallel lists zipped into records
    pub fn records(&self) -> Vec<PromptRecord> {
        self.prompts
            .iter()
            .zip(&self.prompts_short)
            .zip(&self.actual_outputs)
            .map(|((full, short), actual)| PromptRecord {
                essay_id: self.essay_id,
                full_prompt: full.clone(),
                short_prompt: short.clone(),
                actual_output: actual.clone(),
            })
            .collect()
    }
}

/// Read and parse an essay file
///
/// # Errors
///
/// - [`TouchstoneError::Io`] if the file cannot be read
/// - [`TouchstoneError::MarkerMismatch`] if the marker counts differ
/// - [`TouchstoneError::MarkerOrder`] if a triple's markers are out of order
pub fn read_essay<P: AsRef<Path>>(path: P, essay_id: usize) -> Result<EssayPrompts> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    parse_with_source(&text, essay_id, path)
}

/// Parse essay text that is already in memory
///
/// # Example
///
/// ```rust
/// # use touchstone::essay::parse_essay;
/// let essay = parse_essay("[START]Hello [CHANGEPOINT]world[END]", 1).unwrap();
/// assert_eq!(essay.prompts, vec!["Hello "]);
/// assert_eq!(essay.prompts_short, vec!["Hello "]);
/// assert_eq!(essay.actual_outputs, vec!["world"]);
/// ```
pub fn parse_essay(text: &str, essay_id: usize) -> Result<EssayPrompts> {
    parse_with_source(text, essay_id, Path::new("<inline essay>"))
}

fn parse_with_source(text: &str, essay_id: usize, source: &Path) -> Result<EssayPrompts> {
    let starts = marker_positions(text, START_MARKER);
    let changes = marker_positions(text, CHANGEPOINT_MARKER);
    let ends = marker_positions(text, END_MARKER);

    if starts.len() != changes.len() || changes.len() != ends.len() {
        return Err(TouchstoneError::MarkerMismatch {
            path: source.to_path_buf(),
            start: starts.len(),
            changepoint: changes.len(),
            end: ends.len(),
        });
    }

    let mut essay = EssayPrompts {
        essay_id,
        ..Default::default()
    };

    for (index, ((&start, &change), &end)) in starts.iter().zip(&changes).zip(&ends).enumerate() {
        if start > change || change > end {
            return Err(TouchstoneError::MarkerOrder { index });
        }
        essay.prompts.push(extract_span(text, 0, change));
        essay.prompts_short.push(extract_span(text, start, change));
        essay.actual_outputs.push(extract_span(text, change, end));
    }

    Ok(essay)
}

/// Byte offsets of every occurrence of `marker`
fn marker_positions(text: &str, marker: &str) -> Vec<usize> {
    text.match_indices(marker).map(|(i, _)| i).collect()
}

/// `text[from..to]` with every marker removed
///
/// Offsets come from marker matches, which always fall on char boundaries.
pub fn extract_span(text: &str, from: usize, to: usize) -> String {
    strip_markers(&text[from..to])
}

/// Remove all three marker strings
pub fn strip_markers(text: &str) -> String {
    text.replace(START_MARKER, "")
        .replace(CHANGEPOINT_MARKER, "")
        .replace(END_MARKER, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_triple() {
        let essay = parse_essay("[START]Hello [CHANGEPOINT]world[END]", 7).unwrap();
        assert_eq!(essay.essay_id, 7);
        assert_eq!(essay.prompts, vec!["Hello "]);
        assert_eq!(essay.prompts_short, vec!["Hello "]);
        assert_eq!(essay.actual_outputs, vec!["world"]);
    }

    #[test]
    fn test_full_prompt_spans_from_essay_start() {
        let text = "Intro. [START]First [CHANGEPOINT]one[END] middle [START]Second [CHANGEPOINT]two[END] tail";
        let essay = parse_essay(text, 1).unwrap();

        assert_eq!(essay.len(), 2);
        assert_eq!(essay.prompts[0], "Intro. First ");
        assert_eq!(essay.prompts[1], "Intro. First one middle Second ");
        assert_eq!(essay.prompts_short[1], "Second ");
        assert_eq!(essay.actual_outputs[1], "two");
    }

    #[test]
    fn test_short_prompt_and_actual_reproduce_source_span() {
        let text = "A [START]b [CHANGEPOINT]c d[END] e [START]f[CHANGEPOINT] g[END]";
        let essay = parse_essay(text, 1).unwrap();

        let starts = marker_positions(text, START_MARKER);
        let ends = marker_positions(text, END_MARKER);
        for (k, (&s, &e)) in starts.iter().zip(&ends).enumerate() {
            let joined = format!("{}{}", essay.prompts_short[k], essay.actual_outputs[k]);
            assert_eq!(joined, strip_markers(&text[s..e]));
        }
    }

    #[test]
    fn test_mismatched_counts_fail() {
        let err = parse_essay("[START]a[CHANGEPOINT]b[END] [START]c", 1).unwrap_err();
        match err {
            TouchstoneError::MarkerMismatch {
                start,
                changepoint,
                end,
                ..
            } => {
                assert_eq!((start, changepoint, end), (2, 1, 1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_out_of_order_markers_fail() {
        let err = parse_essay("[START]a[END]b[CHANGEPOINT]", 1).unwrap_err();
        assert!(matches!(err, TouchstoneError::MarkerOrder { index: 0 }));
    }

    #[test]
    fn test_no_markers_is_empty() {
        let essay = parse_essay("just prose", 2).unwrap();
        assert!(essay.is_empty());
        assert!(essay.records().is_empty());
    }

    #[test]
    fn test_multibyte_text() {
        let essay = parse_essay("Café [START]naïve [CHANGEPOINT]日本語[END]", 1).unwrap();
        assert_eq!(essay.prompts[0], "Café naïve ");
        assert_eq!(essay.actual_outputs[0], "日本語");
    }

    #[test]
    fn test_records_zip_parallel_lists() {
        let essay = parse_essay("[START]x [CHANGEPOINT]y[END][START]z [CHANGEPOINT]w[END]", 3).unwrap();
        let records = essay.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].essay_id, 3);
        assert_eq!(records[1].full_prompt, "x yz ");
        assert_eq!(records[1].short_prompt, "z ");
        assert_eq!(records[1].actual_output, "w");
    }
}
