//! Touchstone: Temperature Sweeps over Annotated Essays
//!
//! A harness for asking how a language model continues real writing at
//! different sampling temperatures, and how surprised the model is by its own
//! continuations compared with what the author actually wrote.
//!
//! Essays are annotated with `[START]`, `[CHANGEPOINT]` and `[END]` markers.
//! Every marked span becomes a prompt, which is run through a temperature
//! sweep; the outputs land in text reports and a CSV table, and a second pass
//! scores each continuation's perplexity.
//!
//! # Modules
//!
//! - [`essay`] - marker parsing
//! - [`generation`] - one prompt through a temperature sweep
//! - [`perplexity`] - sliding-window perplexity
//! - [`report`] - result tables and text reports
//! - [`experiment`] - the autocomplete and perplexity runs
//! - [`provider`] - the [`LanguageModel`] trait and the checkpoint backend
//! - [`tokenizer`], [`tensor`], [`model`], [`checkpoint`], [`sampling`] -
//!   the bundled GPT-2 style inference stack behind [`CheckpointModel`]
//!
//! # Example
//!
//! ```rust,no_run
//! use touchstone::{AutocompleteExperiment, CheckpointModel, ExperimentConfig};
//!
//! let config = ExperimentConfig::default();
//! let mut model = CheckpointModel::load(&config.model_path)?;
//! let table = AutocompleteExperiment::new(&mut model, config)?.run()?;
//! println!("{} continuations generated", table.len());
//! # Ok::<(), touchstone::TouchstoneError>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod essay;
pub mod experiment;
pub mod generation;
pub mod model;
pub mod perplexity;
pub mod provider;
pub mod report;
pub mod sampling;
pub mod tensor;
pub mod tokenizer;

// Re-export main types for convenience
pub use config::{ExperimentConfig, GenerationConfig};
pub use error::{Result, TouchstoneError};
pub use essay::{read_essay, EssayPrompts, PromptRecord};
pub use experiment::{
    complete_prompt, load_autocomplete_table, load_essays, AutocompleteExperiment,
    PerplexityExperiment,
};
pub use generation::{generate_text, strip_prompt, SweepSettings};
pub use provider::{CheckpointModel, LanguageModel};
pub use report::{ResultRow, ResultTable};
pub use tokenizer::BPETokenizer;
