//! Generation Driver
//!
//! Runs one prompt through a temperature sweep:
//!
//! 1. Reseed the model once, before the sweep
//! 2. Size the output from the actual continuation
//!    (`length_coefficient × tokens(actual)`) unless a fixed length is set
//! 3. For each temperature, generate, then cut the echoed prompt off the
//!    decoded text
//!
//! The model returns prompt and continuation as one decoded string, and
//! decoding doesn't always reproduce the prompt's leading text exactly. The
//! cut is therefore made after the first occurrence of the prompt's last
//! `prompt_anchor_chars` characters (the anchor), not at a fixed offset.

use crate::config::{ExperimentConfig, GenerationConfig, DEFAULT_SEED, MAX_LENGTH_COEFF, PROMPT_END_LENGTH};
use crate::error::{Result, TouchstoneError};
use crate::provider::LanguageModel;
use crate::report::LINEBREAK;
use log::debug;

/// Everything about a sweep that isn't the prompt itself
#[derive(Clone, Debug)]
pub struct SweepSettings {
    pub seed: u64,
    pub length_coefficient: usize,
    pub prompt_anchor_chars: usize,
    pub generation: GenerationConfig,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            length_coefficient: MAX_LENGTH_COEFF,
            prompt_anchor_chars: PROMPT_END_LENGTH,
            generation: GenerationConfig::default(),
        }
    }
}

impl From<&ExperimentConfig> for SweepSettings {
    fn from(config: &ExperimentConfig) -> Self {
        Self {
            seed: config.seed,
            length_coefficient: config.length_coefficient,
            prompt_anchor_chars: config.prompt_anchor_chars,
            generation: config.generation.clone(),
        }
    }
}

/// Number of new tokens to request for a prompt whose true continuation is
/// `actual_output`
pub fn result_length<M>(model: &M, actual_output: &str, settings: &SweepSettings) -> usize
where
    M: LanguageModel + ?Sized,
{
    settings
        .generation
        .max_new_tokens
        .unwrap_or_else(|| settings.length_coefficient * model.count_tokens(actual_output))
}

/// The last `chars` characters of `prompt` (all of it when shorter)
pub fn prompt_anchor(prompt: &str, chars: usize) -> &str {
    if chars == 0 {
        return "";
    }
    match prompt.char_indices().rev().nth(chars - 1) {
        Some((i, _)) => &prompt[i..],
        None => prompt,
    }
}

/// Everything in `decoded` after the first occurrence of the prompt's anchor
///
/// # Errors
///
/// [`TouchstoneError::AnchorNotFound`] if the anchor is not in `decoded`.
///
/// # Example
///
/// ```rust
/// # use touchstone::generation::strip_prompt;
/// let out = strip_prompt("Once upon a time there was", "Once upon a time", 4).unwrap();
/// assert_eq!(out, " there was");
/// ```
pub fn strip_prompt(decoded: &str, prompt: &str, anchor_chars: usize) -> Result<String> {
    let anchor = prompt_anchor(prompt, anchor_chars);
    match decoded.find(anchor) {
        Some(i) => Ok(decoded[i + anchor.len()..].to_string()),
        None => Err(TouchstoneError::AnchorNotFound {
            anchor: anchor.to_string(),
        }),
    }
}

/// Generate one continuation of `prompt` per temperature, in order
///
/// `prompt_short` and `actual_output` are only used to size the output and
/// for the debug echo. Any model error aborts the rest of the sweep.
pub fn generate_text<M>(
    model: &mut M,
    prompt: &str,
    prompt_short: &str,
    actual_output: &str,
    temperatures: &[f32],
    settings: &SweepSettings,
) -> Result<Vec<String>>
where
    M: LanguageModel + ?Sized,
{
    model.reseed(settings.seed);
    let generation = settings
        .generation
        .with_max_new_tokens(result_length(model, actual_output, settings));

    debug!("{}", LINEBREAK);
    debug!("Prompt: {}", prompt_short);
    debug!("Actual Output: {}", actual_output);

    let mut pred_outputs = Vec::with_capacity(temperatures.len());
    for &temp in temperatures {
        let decoded = model.generate(prompt, &generation.with_temperature(temp))?;
        let pred_output = strip_prompt(&decoded, prompt, settings.prompt_anchor_chars)?;
        debug!("Predicted Output (w/temp {:.2}): {}", temp, pred_output);
        pred_outputs.push(pred_output);
    }

    Ok(pred_outputs)
}
