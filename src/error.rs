//! Error types for the experiment harness

use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, TouchstoneError>;

/// Errors that can occur while parsing essays, driving the model or writing results
#[derive(Error, Debug)]
pub enum TouchstoneError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(
        "number of start, change and end markers must be equal in {}: \
         {start} [START], {changepoint} [CHANGEPOINT], {end} [END]",
        path.display()
    )]
    MarkerMismatch {
        path: PathBuf,
        start: usize,
        changepoint: usize,
        end: usize,
    },

    #[error("markers of triple {index} are out of order (expected START <= CHANGEPOINT <= END)")]
    MarkerOrder { index: usize },

    #[error("end of prompt not found in decoded output: {anchor:?}")]
    AnchorNotFound { anchor: String },

    #[error("nothing to score: start token {start} is past the last scorable token of a {len}-token text")]
    EmptyScoringSpan { start: usize, len: usize },

    #[error("cannot generate from a prompt that encodes to no tokens")]
    EmptyPrompt,

    #[error("{0} is not supported by this model")]
    Unsupported(&'static str),

    #[error("Invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    #[error("Invalid results table at line {line}: {reason}")]
    InvalidTable { line: usize, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
