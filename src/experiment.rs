//! Experiments
//!
//! - [`AutocompleteExperiment`]: every prompt of every essay through the
//!   temperature sweep, written as per-essay text reports and one table
//! - [`PerplexityExperiment`]: reads that table back, scores every predicted
//!   continuation and each essay's actual continuation, writes a sorted table
//! - [`complete_prompt`]: one prompt through the sweep, for quick looks
//!
//! Both experiments borrow the model, so one loaded model serves a whole
//! process. Text reports are written as each essay finishes; the tables are
//! written once at the end of a run.

use crate::config::ExperimentConfig;
use crate::error::{Result, TouchstoneError};
use crate::essay::{read_essay, EssayPrompts};
use crate::generation::{generate_text, SweepSettings};
use crate::provider::LanguageModel;
use crate::report::{write_prompt_block, ResultRow, ResultTable};
use log::{info, warn};
use std::fs::{self, File};
use std::io::{BufWriter, Write};

/// Prompt of the single-prompt demo
pub const DEMO_PROMPT: &str = "Last Saturday, my friend annoyed me because he ";
/// What the author actually wrote after [`DEMO_PROMPT`]
pub const DEMO_ACTUAL: &str = "wasted all his lunch money.";
/// Temperatures of the single-prompt demo
pub const DEMO_TEMPERATURES: [f32; 5] = [0.5, 0.7, 1.0, 1.2, 1.5];

/// Validate `config` and parse every essay it names
///
/// Needs no model, so callers can check their inputs before paying for a
/// checkpoint load.
pub fn load_essays(config: &ExperimentConfig) -> Result<Vec<EssayPrompts>> {
    config.validate()?;
    config
        .essay_ids()
        .map(|id| read_essay(config.essay_path(id), id))
        .collect()
}

/// Generation sweep over all essays
pub struct AutocompleteExperiment<'a, M: LanguageModel + ?Sized> {
    model: &'a mut M,
    config: ExperimentConfig,
    essays: Vec<EssayPrompts>,
}

impl<'a, M: LanguageModel + ?Sized> AutocompleteExperiment<'a, M> {
    /// Validate the config and read every essay up front, so a malformed
    /// essay fails the run before any generation starts
    pub fn new(model: &'a mut M, config: ExperimentConfig) -> Result<Self> {
        let essays = load_essays(&config)?;
        Ok(Self::with_essays(model, config, essays))
    }

    /// Use essays already read with [`load_essays`]
    pub fn with_essays(model: &'a mut M, config: ExperimentConfig, essays: Vec<EssayPrompts>) -> Self {
        Self {
            model,
            config,
            essays,
        }
    }

    pub fn essays(&self) -> &[EssayPrompts] {
        &self.essays
    }

    pub fn run(&mut self) -> Result<ResultTable> {
        fs::create_dir_all(&self.config.results_dir)?;
        let settings = SweepSettings::from(&self.config);
        let temperatures = &self.config.temperatures;
        let mut table = ResultTable::new();

        for essay in &self.essays {
            info!("Running essay {}...", essay.essay_id);
            let mut report = BufWriter::new(File::create(self.config.report_path(essay.essay_id))?);

            for record in essay.records() {
                let pred_outputs = generate_text(
                    &mut *self.model,
                    &record.full_prompt,
                    &record.short_prompt,
                    &record.actual_output,
                    temperatures,
                    &settings,
                )?;
                write_prompt_block(
                    &mut report,
                    &record.short_prompt,
                    &record.actual_output,
                    temperatures,
                    &pred_outputs,
                )?;

                for (&temp, pred_output) in temperatures.iter().zip(pred_outputs) {
                    table.push(ResultRow {
                        essay: record.essay_id,
                        full_prompt: record.full_prompt.clone(),
                        short_prompt: record.short_prompt.clone(),
                        act_output: record.actual_output.clone(),
                        temp: Some(temp),
                        pred_output: Some(pred_output),
                        perplexity: None,
                    });
                }
            }
            report.flush()?;
        }

        let path = self.config.autocomplete_table_path();
        table.write_csv(&path)?;
        info!("Wrote {} rows to {}", table.len(), path.display());
        Ok(table)
    }
}

/// Validate `config` and read the table a finished autocomplete run wrote
pub fn load_autocomplete_table(config: &ExperimentConfig) -> Result<ResultTable> {
    config.validate()?;
    ResultTable::read_csv(config.autocomplete_table_path())
}

/// Perplexity scoring of a finished autocomplete run
pub struct PerplexityExperiment<'a, M: LanguageModel + ?Sized> {
    model: &'a M,
    config: ExperimentConfig,
    table: ResultTable,
}

impl<'a, M: LanguageModel + ?Sized> PerplexityExperiment<'a, M> {
    /// Read the autocomplete table named by `config`
    pub fn new(model: &'a M, config: ExperimentConfig) -> Result<Self> {
        let table = load_autocomplete_table(&config)?;
        Ok(Self::from_table(model, config, table))
    }

    pub fn from_table(model: &'a M, config: ExperimentConfig, table: ResultTable) -> Self {
        Self {
            model,
            config,
            table,
        }
    }

    /// Score every row, add one actual-output row per essay, sort and write
    ///
    /// The actual-output row reuses the prompt of the essay's first row.
    pub fn run(mut self) -> Result<ResultTable> {
        let model = self.model;
        let stride = self.config.stride;

        for row in &mut self.table.rows {
            info!(
                "Calculating perplexity for essay {} temp {} predicted outputs...",
                row.essay,
                row.temp.map(|t| format!("{:?}", t)).unwrap_or_else(|| "-".to_string())
            );
            let continuation = row.pred_output.as_deref().unwrap_or("");
            row.perplexity = score(model, stride, &row.full_prompt, continuation)?;
        }

        for essay in self.table.essays() {
            info!("Calculating perplexity for essay {} actual outputs...", essay);
            let Some(first) = self.table.rows.iter().find(|r| r.essay == essay) else {
                continue;
            };
            let mut actual = ResultRow {
                temp: None,
                pred_output: None,
                perplexity: None,
                ..first.clone()
            };
            actual.perplexity = score(model, stride, &actual.full_prompt, &actual.act_output)?;
            self.table.push(actual);
        }

        self.table.with_perplexity = true;
        self.table.sort_by_essay_and_temp();

        let path = self.config.perplexity_table_path();
        fs::create_dir_all(&self.config.results_dir)?;
        self.table.write_csv(&path)?;
        info!("Wrote {} rows to {}", self.table.len(), path.display());
        Ok(self.table)
    }
}

/// Perplexity of `continuation` given `prompt`; an empty continuation has
/// nothing to score and is recorded as missing
fn score<M>(model: &M, stride: usize, prompt: &str, continuation: &str) -> Result<Option<f64>>
where
    M: LanguageModel + ?Sized,
{
    let start = model.count_tokens(prompt);
    let text = format!("{}{}", prompt, continuation);
    match model.perplexity(&text, start, stride) {
        Ok(perplexity) => Ok(Some(perplexity)),
        Err(TouchstoneError::EmptyScoringSpan { start, len }) => {
            warn!(
                "Nothing to score after token {} of {}, recording no perplexity",
                start, len
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Run a single prompt through the sweep, pairing each output with its
/// temperature
pub fn complete_prompt<M>(
    model: &mut M,
    prompt: &str,
    actual_output: &str,
    temperatures: &[f32],
    settings: &SweepSettings,
) -> Result<Vec<(f32, String)>>
where
    M: LanguageModel + ?Sized,
{
    let outputs = generate_text(model, prompt, prompt, actual_output, temperatures, settings)?;
    Ok(temperatures.iter().copied().zip(outputs).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationConfig;

    /// Appends `T=<temp>`; scores by continuation length
    struct StubModel;

    impl LanguageModel for StubModel {
        fn count_tokens(&self, text: &str) -> usize {
            text.chars().count()
        }

        fn generate(&mut self, prompt: &str, config: &GenerationConfig) -> Result<String> {
            Ok(format!("{}T={:?}", prompt, config.temperature))
        }

        fn perplexity(&self, text: &str, start_token: usize, _stride: usize) -> Result<f64> {
            let len = text.chars().count();
            if start_token >= len {
                return Err(TouchstoneError::EmptyScoringSpan {
                    start: start_token,
                    len,
                });
            }
            Ok((len - start_token) as f64)
        }

        fn reseed(&mut self, _seed: u64) {}
    }

    fn row(essay: usize, temp: f32, pred: &str) -> ResultRow {
        ResultRow {
            essay,
            full_prompt: format!("prompt {} ", essay),
            short_prompt: "short ".to_string(),
            act_output: "actual".to_string(),
            temp: Some(temp),
            pred_output: Some(pred.to_string()),
            perplexity: None,
        }
    }

    #[test]
    fn test_demo_defaults() {
        let mut model = StubModel;
        let out = complete_prompt(
            &mut model,
            DEMO_PROMPT,
            DEMO_ACTUAL,
            &DEMO_TEMPERATURES,
            &SweepSettings::default(),
        )
        .unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(out[0], (0.5, "T=0.5".to_string()));
        assert_eq!(out[4], (1.5, "T=1.5".to_string()));
    }

    #[test]
    fn test_perplexity_adds_actual_rows_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExperimentConfig {
            results_dir: dir.path().join("results"),
            ..ExperimentConfig::default()
        };

        let mut table = ResultTable::new();
        table.push(row(2, 1.0, "xx"));
        table.push(row(1, 1.5, "abc"));
        table.push(row(1, 0.5, ""));

        let model = StubModel;
        let scored = PerplexityExperiment::from_table(&model, config, table)
            .run()
            .unwrap();

        let summary: Vec<(usize, Option<f32>, Option<f64>)> = scored
            .rows
            .iter()
            .map(|r| (r.essay, r.temp, r.perplexity))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, Some(0.5), None),
                (1, Some(1.5), Some(3.0)),
                (1, None, Some(6.0)),
                (2, Some(1.0), Some(2.0)),
                (2, None, Some(6.0)),
            ]
        );
        assert!(scored.with_perplexity);
        assert!(dir.path().join("results/perplexity-results.csv").exists());
    }

    #[test]
    fn test_inputs_checked_without_a_model() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("essay-1.txt"), "[START]Hi [CHANGEPOINT]there[END]").unwrap();
        let config = ExperimentConfig {
            data_dir: data,
            results_dir: dir.path().join("results"),
            num_essays: 1,
            ..ExperimentConfig::default()
        };

        let essays = load_essays(&config).unwrap();
        assert_eq!(essays[0].actual_outputs, vec!["there".to_string()]);

        let bad_temps = ExperimentConfig {
            temperatures: Vec::new(),
            ..config.clone()
        };
        assert!(matches!(
            load_essays(&bad_temps).unwrap_err(),
            TouchstoneError::InvalidConfig(_)
        ));
        assert!(matches!(
            load_autocomplete_table(&config).unwrap_err(),
            TouchstoneError::Io(_)
        ));

        let mut model = StubModel;
        let table = AutocompleteExperiment::with_essays(&mut model, config, essays)
            .run()
            .unwrap();
        assert_eq!(table.len(), 20);
    }
}
