//! Touchstone command line
//!
//! ## Usage
//!
//! ```bash
//! # Generate continuations for essay/data/essay-{1..4}.txt at 20 temperatures
//! touchstone autocomplete
//!
//! # Score them (reads essay/results/autocomplete-results.csv)
//! touchstone perplexity
//!
//! # Override the config file from the command line
//! touchstone --config run.json autocomplete --essays 2 --temps 0.5,1.0,1.5
//!
//! # One prompt, a handful of temperatures
//! touchstone --model model.bin complete --prompt "Once upon a time"
//!
//! # What would the model say next, and how sure is it?
//! touchstone probe --prompt "To be or not to" --temperature 0.7
//!
//! # Checkpoint summary
//! touchstone --model model.bin inspect
//! ```
//!
//! Progress goes to the log at `info`; set `RUST_LOG=debug` to see every
//! prompt and prediction as it is generated.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use touchstone::checkpoint::Checkpoint;
use touchstone::experiment::{DEMO_ACTUAL, DEMO_PROMPT, DEMO_TEMPERATURES};
use touchstone::{
    complete_prompt, load_autocomplete_table, load_essays, AutocompleteExperiment, BPETokenizer,
    CheckpointModel, ExperimentConfig, LanguageModel, PerplexityExperiment, SweepSettings,
};

#[derive(Parser)]
#[command(
    name = "touchstone",
    version,
    about = "Temperature sweeps and perplexity over annotated essays"
)]
struct Cli {
    /// JSON experiment config; flags override its fields
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Model checkpoint
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    /// Tokenizer JSON, for checkpoints saved without one
    #[arg(long, global = true)]
    tokenizer: Option<PathBuf>,

    /// End-of-sequence token id for early stopping
    #[arg(long, global = true)]
    eos_token: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every essay prompt through the temperature sweep
    Autocomplete {
        /// Number of essays to read (essay-1.txt ..= essay-N.txt)
        #[arg(long)]
        essays: Option<usize>,

        /// Comma-separated temperatures
        #[arg(long, value_delimiter = ',')]
        temps: Option<Vec<f32>>,

        /// Seed applied before each prompt
        #[arg(long)]
        seed: Option<u64>,

        /// Fixed output length instead of 3 × the actual output's tokens
        #[arg(long)]
        max_new_tokens: Option<usize>,

        /// Directory holding the essays
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Directory receiving reports and the table
        #[arg(long)]
        results_dir: Option<PathBuf>,
    },

    /// Score the autocomplete table and the actual outputs
    Perplexity {
        /// New tokens scored per window
        #[arg(long)]
        stride: Option<usize>,

        /// Directory holding autocomplete-results.csv
        #[arg(long)]
        results_dir: Option<PathBuf>,
    },

    /// Run a single prompt through a temperature sweep
    Complete {
        #[arg(long, default_value = DEMO_PROMPT)]
        prompt: String,

        /// The true continuation (sizes the output)
        #[arg(long, default_value = DEMO_ACTUAL)]
        actual: String,

        /// Comma-separated temperatures (default 0.5,0.7,1.0,1.2,1.5)
        #[arg(long, value_delimiter = ',')]
        temps: Option<Vec<f32>>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        max_new_tokens: Option<usize>,
    },

    /// Show the most likely next tokens after a prompt
    Probe {
        #[arg(long, default_value = DEMO_PROMPT)]
        prompt: String,

        #[arg(long, default_value = "1.0")]
        temperature: f32,

        /// Number of tokens to list
        #[arg(long, default_value = "10")]
        top_k: usize,
    },

    /// Print checkpoint configuration, size and tokenizer
    Inspect,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::from_file(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?,
        None => ExperimentConfig::default(),
    };
    if let Some(model) = cli.model {
        config.model_path = model;
    }
    if let Some(tokenizer) = cli.tokenizer {
        config.tokenizer_path = Some(tokenizer);
    }
    if cli.eos_token.is_some() {
        config.eos_token = cli.eos_token;
    }

    match cli.command {
        Command::Autocomplete {
            essays,
            temps,
            seed,
            max_new_tokens,
            data_dir,
            results_dir,
        } => {
            if let Some(essays) = essays {
                config.num_essays = essays;
            }
            if let Some(temps) = temps {
                config.temperatures = temps;
            }
            if let Some(seed) = seed {
                config.seed = seed;
            }
            if max_new_tokens.is_some() {
                config.generation.max_new_tokens = max_new_tokens;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if let Some(dir) = results_dir {
                config.results_dir = dir;
            }

            let essays = load_essays(&config).context("Failed to prepare autocomplete run")?;
            let mut model = load_model(&config)?;
            let table = AutocompleteExperiment::with_essays(&mut model, config, essays)
                .run()
                .context("Autocomplete run failed")?;
            info!("Generated {} continuations", table.len());
        }

        Command::Perplexity {
            stride,
            results_dir,
        } => {
            if let Some(stride) = stride {
                config.stride = stride;
            }
            if let Some(dir) = results_dir {
                config.results_dir = dir;
            }

            let results =
                load_autocomplete_table(&config).context("Failed to read autocomplete results")?;
            let model = load_model(&config)?;
            let table = PerplexityExperiment::from_table(&model, config, results)
                .run()
                .context("Perplexity run failed")?;
            info!("Scored {} rows", table.len());
        }

        Command::Complete {
            prompt,
            actual,
            temps,
            seed,
            max_new_tokens,
        } => {
            let temps = temps.unwrap_or_else(|| DEMO_TEMPERATURES.to_vec());
            let mut settings = SweepSettings::from(&config);
            if let Some(seed) = seed {
                settings.seed = seed;
            }
            if max_new_tokens.is_some() {
                settings.generation.max_new_tokens = max_new_tokens;
            }

            let mut model = load_model(&config)?;
            let outputs = complete_prompt(&mut model, &prompt, &actual, &temps, &settings)
                .context("Generation failed")?;

            println!("Prompt: {}", prompt);
            println!("Actual Output: {}", actual);
            for (temp, output) in outputs {
                println!("Predicted Output (w/temp {:.2}): {}", temp, output);
            }
        }

        Command::Probe {
            prompt,
            temperature,
            top_k,
        } => {
            let model = load_model(&config)?;
            let top = model
                .next_token_distribution(&prompt, temperature, top_k)
                .context("Probe failed")?;

            println!("Prompt: {}", prompt);
            println!("Next token at temperature {:.2}:", temperature);
            for (token, p) in top {
                println!("  {:>8.4}  {:?}", p, token);
            }
        }

        Command::Inspect => {
            let checkpoint = Checkpoint::load(&config.model_path).with_context(|| {
                format!("Failed to load checkpoint {}", config.model_path.display())
            })?;
            let model_config = &checkpoint.model.config;

            println!("Checkpoint: {}", config.model_path.display());
            println!("  vocab_size:   {}", model_config.vocab_size);
            println!("  n_embd:       {}", model_config.n_embd);
            println!("  n_heads:      {}", model_config.n_heads);
            println!("  n_layers:     {}", model_config.n_layers);
            println!("  block_size:   {}", model_config.block_size);
            println!("  parameters:   {}", checkpoint.model.count_parameters());
            println!("  step:         {}", checkpoint.metadata.step);
            match checkpoint.metadata.best_val_loss {
                Some(loss) => println!(
                    "  best val:     {:.4} (step {})",
                    loss, checkpoint.metadata.best_val_step
                ),
                None => println!("  best val:     n/a"),
            }
            println!("  optimizer:    {}", if checkpoint.had_optimizer { "present (skipped)" } else { "none" });
            match &checkpoint.tokenizer {
                Some(t) => println!(
                    "  tokenizer:    {} tokens, {} merges",
                    t.vocab_size(),
                    t.num_merges()
                ),
                None => println!("  tokenizer:    none"),
            }
        }
    }

    Ok(())
}

/// Load the checkpoint named by `config`, with its tokenizer override and EOS token
fn load_model(config: &ExperimentConfig) -> Result<CheckpointModel> {
    let mut model = CheckpointModel::load(&config.model_path).with_context(|| {
        format!("Failed to load model {}", config.model_path.display())
    })?;
    if let Some(path) = &config.tokenizer_path {
        let tokenizer = BPETokenizer::load(path)
            .with_context(|| format!("Failed to load tokenizer {}", path.display()))?;
        model = model.with_tokenizer(tokenizer);
    }
    Ok(model.with_eos_token(config.eos_token))
}
