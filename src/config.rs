//! Experiment and Decoding Configuration
//!
//! Two layers of configuration drive a run:
//!
//! - [`GenerationConfig`]: the decoding options handed to the model for a
//!   single generate call (temperature, output length, n-gram constraint,
//!   early stopping, sampling on/off)
//! - [`ExperimentConfig`]: everything around it (where the essays live, where
//!   results go, the temperature sweep, the seed, the length heuristic and the
//!   perplexity stride)
//!
//! Both are serde types, so a run can be described in a JSON file and
//! individual fields overridden from the command line.
//!
//! ## Defaults
//!
//! ```text
//! temperatures          0.1, 0.2, ..., 2.0   (20 values)
//! essays                essay/data/essay-{1..4}.txt
//! seed                  4242
//! max_new_tokens        3 × tokens(actual output)
//! prompt anchor         last 100 characters of the prompt
//! no_repeat_ngram_size  2
//! perplexity stride     1 (token by token)
//! ```

use crate::error::{Result, TouchstoneError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Lowest temperature of the default sweep
pub const MIN_TEMP: f32 = 0.1;
/// Highest temperature of the default sweep
pub const MAX_TEMP: f32 = 2.0;
/// Number of temperatures in the default sweep
pub const NUM_TEMPS: usize = 20;
/// Number of essays read by default
pub const NUM_ESSAYS: usize = 4;
/// Seed applied before every prompt's sweep
pub const DEFAULT_SEED: u64 = 4242;
/// Output length multiplier over the actual continuation's token count
pub const MAX_LENGTH_COEFF: usize = 3;
/// Largest n-gram allowed to repeat is `MAX_REPETITIONS - 1`
pub const MAX_REPETITIONS: usize = 2;
/// Number of trailing prompt characters used to find the echoed prompt
pub const PROMPT_END_LENGTH: usize = 100;

/// Decoding options for one generate call
///
/// # Fields
///
/// - `temperature`: divides the logits before softmax; `<= 0` means greedy
/// - `max_new_tokens`: fixed output length; `None` lets the driver size it
///   from the actual continuation
/// - `no_repeat_ngram_size`: forbid repeating any n-gram of this size (0 disables)
/// - `early_stopping`: stop at the end-of-sequence token if the model has one
/// - `do_sample`: sample from the distribution instead of taking the argmax
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_new_tokens: Option<usize>,
    pub no_repeat_ngram_size: usize,
    pub early_stopping: bool,
    pub do_sample: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_new_tokens: None,
            no_repeat_ngram_size: MAX_REPETITIONS,
            early_stopping: true,
            do_sample: true,
        }
    }
}

impl GenerationConfig {
    /// Copy of this config at a different temperature
    pub fn with_temperature(&self, temperature: f32) -> Self {
        Self {
            temperature,
            ..self.clone()
        }
    }

    /// Copy of this config with a fixed output length
    pub fn with_max_new_tokens(&self, max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens: Some(max_new_tokens),
            ..self.clone()
        }
    }
}

/// Evenly spaced temperatures from `min` to `max` inclusive, rounded to two decimals
///
/// Rounding keeps values like `0.7` from printing as `0.70000005` in the
/// reports and tables.
///
/// # Example
///
/// ```rust
/// # use touchstone::config::linspace;
/// assert_eq!(linspace(0.5, 1.5, 3), vec![0.5, 1.0, 1.5]);
/// ```
pub fn linspace(min: f32, max: f32, steps: usize) -> Vec<f32> {
    match steps {
        0 => Vec::new(),
        1 => vec![round2(min as f64)],
        _ => {
            let step = (max as f64 - min as f64) / (steps - 1) as f64;
            (0..steps)
                .map(|i| round2(min as f64 + step * i as f64))
                .collect()
        }
    }
}

fn round2(value: f64) -> f32 {
    ((value * 100.0).round() / 100.0) as f32
}

/// Configuration for a full autocomplete or perplexity run
///
/// Missing fields in a JSON file fall back to the defaults, so a config file
/// only needs to name what it changes:
///
/// ```json
/// { "num_essays": 3, "temperatures": [0.5, 1.0, 1.5] }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Checkpoint to load the model from
    pub model_path: PathBuf,
    /// Tokenizer JSON, for checkpoints saved without one
    pub tokenizer_path: Option<PathBuf>,
    /// End-of-sequence token id honoured by early stopping
    pub eos_token: Option<usize>,
    /// Directory holding `essay-<n>.txt`
    pub data_dir: PathBuf,
    /// Directory receiving reports and tables
    pub results_dir: PathBuf,
    /// Essays `1..=num_essays` are read
    pub num_essays: usize,
    /// Temperature sweep, in the order it is run
    pub temperatures: Vec<f32>,
    /// Generator seed, reapplied before every prompt
    pub seed: u64,
    /// `max_new_tokens = length_coefficient × tokens(actual output)`
    pub length_coefficient: usize,
    /// Trailing prompt characters used as the anchor when stripping the echo
    pub prompt_anchor_chars: usize,
    /// Target tokens per perplexity window
    pub stride: usize,
    /// Decoding options shared by every generate call
    pub generation: GenerationConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("essay/models/checkpoint.bin"),
            tokenizer_path: None,
            eos_token: None,
            data_dir: PathBuf::from("essay/data"),
            results_dir: PathBuf::from("essay/results"),
            num_essays: NUM_ESSAYS,
            temperatures: linspace(MIN_TEMP, MAX_TEMP, NUM_TEMPS),
            seed: DEFAULT_SEED,
            length_coefficient: MAX_LENGTH_COEFF,
            prompt_anchor_chars: PROMPT_END_LENGTH,
            stride: 1,
            generation: GenerationConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Load a config from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let config: ExperimentConfig = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Write this config as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Reject configurations that cannot produce a meaningful run
    pub fn validate(&self) -> Result<()> {
        if self.temperatures.is_empty() {
            return Err(TouchstoneError::InvalidConfig(
                "temperature sweep is empty".to_string(),
            ));
        }
        if let Some(t) = self.temperatures.iter().find(|t| !t.is_finite() || **t < 0.0) {
            return Err(TouchstoneError::InvalidConfig(format!(
                "temperature {} is not a finite non-negative number",
                t
            )));
        }
        if self.num_essays == 0 {
            return Err(TouchstoneError::InvalidConfig(
                "num_essays must be at least 1".to_string(),
            ));
        }
        if self.stride == 0 {
            return Err(TouchstoneError::InvalidConfig(
                "stride must be at least 1".to_string(),
            ));
        }
        if self.length_coefficient == 0 {
            return Err(TouchstoneError::InvalidConfig(
                "length_coefficient must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Essay ids in the order they are run
    pub fn essay_ids(&self) -> std::ops::RangeInclusive<usize> {
        1..=self.num_essays
    }

    pub fn essay_path(&self, essay_id: usize) -> PathBuf {
        self.data_dir.join(format!("essay-{}.txt", essay_id))
    }

    pub fn report_path(&self, essay_id: usize) -> PathBuf {
        self.results_dir
            .join(format!("autocomplete-results-essay-{}.txt", essay_id))
    }

    pub fn autocomplete_table_path(&self) -> PathBuf {
        self.results_dir.join("autocomplete-results.csv")
    }

    pub fn perplexity_table_path(&self) -> PathBuf {
        self.results_dir.join("perplexity-results.csv")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sweep_matches_constants() {
        let temps = linspace(MIN_TEMP, MAX_TEMP, NUM_TEMPS);
        assert_eq!(temps.len(), 20);
        assert_eq!(temps[0], 0.1);
        assert_eq!(temps[6], 0.7);
        assert_eq!(temps[19], 2.0);
    }

    #[test]
    fn test_linspace_edge_counts() {
        assert!(linspace(0.1, 2.0, 0).is_empty());
        assert_eq!(linspace(0.75, 2.0, 1), vec![0.75]);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "num_essays": 2, "temperatures": [0.5, 1.0] }"#;
        let config: ExperimentConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.num_essays, 2);
        assert_eq!(config.temperatures, vec![0.5, 1.0]);
        assert_eq!(config.seed, DEFAULT_SEED);
        assert_eq!(config.generation.no_repeat_ngram_size, 2);
        assert!(config.generation.early_stopping);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ExperimentConfig::default();
        assert!(config.validate().is_ok());

        config.temperatures.clear();
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.temperatures.push(-1.0);
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.stride = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_result_paths() {
        let config = ExperimentConfig::default();
        assert_eq!(config.essay_path(3), PathBuf::from("essay/data/essay-3.txt"));
        assert_eq!(
            config.report_path(1),
            PathBuf::from("essay/results/autocomplete-results-essay-1.txt")
        );
        assert_eq!(
            config.perplexity_table_path(),
            PathBuf::from("essay/results/perplexity-results.csv")
        );
    }

    #[test]
    fn test_with_temperature_keeps_other_options() {
        let base = GenerationConfig::default().with_max_new_tokens(7);
        let hot = base.with_temperature(1.5);
        assert_eq!(hot.temperature, 1.5);
        assert_eq!(hot.max_new_tokens, Some(7));
        assert_eq!(hot.no_repeat_ngram_size, base.no_repeat_ngram_size);
    }
}
