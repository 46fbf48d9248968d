//! neural-sr: train, extract and scan with symbolic regression networks.
//!
//! Subcommands:
//!   train    load (or reuse cached) data, train, save a checkpoint, print expressions
//!   extract  print the expressions of a saved checkpoint
//!   scan     classify every word of one file with a saved checkpoint
//!
//! Logging follows `RUST_LOG` (default `neural_sr=info`).

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use neural_sr::config::ExperimentConfig;
use neural_sr::data::{self, Dataset, DatasetCache};
use neural_sr::model::{load_checkpoint, save_checkpoint};
use neural_sr::prelude::*;
use neural_sr::Result;

#[derive(Parser)]
#[command(name = "neural-sr", about = "Sparsity-regularized symbolic regression for file fragments")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Train a model and save it as a checkpoint
    Train {
        /// Experiment config (JSON); defaults are used when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Checkpoint directory to write
        #[arg(short, long, default_value = "checkpoints/neural-sr")]
        output: PathBuf,
        /// Override the number of epochs
        #[arg(long)]
        epochs: Option<usize>,
        /// Override the data root directory
        #[arg(long)]
        data_path: Option<String>,
        /// Significant digits in printed expressions
        #[arg(long, default_value_t = 2)]
        digits: u32,
    },
    /// Print the expressions learned by a checkpoint
    Extract {
        /// Checkpoint directory
        checkpoint: PathBuf,
        #[arg(long, default_value_t = 2)]
        digits: u32,
    },
    /// Classify each word of a file and list where the positives are
    Scan {
        /// Checkpoint directory
        checkpoint: PathBuf,
        /// File to scan
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("neural_sr=info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Cmd::Train {
            config,
            output,
            epochs,
            data_path,
            digits,
        } => cmd_train(config.as_deref(), &output, epochs, data_path, digits),
        Cmd::Extract { checkpoint, digits } => cmd_extract(&checkpoint, digits),
        Cmd::Scan { checkpoint, file } => cmd_scan(&checkpoint, &file),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Train/test split, from the cache when one exists
fn load_split(config: &ExperimentConfig, device: &Device) -> Result<(Dataset, Dataset)> {
    let id = config.data.dataset_id();
    let cache = config.data.cache_dir.as_ref().map(DatasetCache::new);
    if let Some(cache) = &cache {
        if cache.contains(&id) {
            return cache.load_split(&id, device);
        }
    }

    let mut rng = StdRng::seed_from_u64(config.data.seed);
    let dataset = data::load_dataset(&config.data, &mut rng, device)?;
    let (train, test) = dataset.split(config.data.test_fraction)?;
    if let Some(cache) = &cache {
        cache.save_split(&id, &train, &test)?;
    }
    Ok((train, test))
}

fn cmd_train(
    config_path: Option<&Path>,
    output: &Path,
    epochs: Option<usize>,
    data_path: Option<String>,
    digits: u32,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(epochs) = epochs {
        config.training.epochs = epochs;
    }
    if let Some(data_path) = data_path {
        config.data.data_path = data_path;
    }
    config.validate()?;

    let device = best_device();
    let (train, test) = load_split(&config, &device)?;
    info!(
        "Split: {} train ({} positive), {} test ({} positive)",
        train.len(),
        train.positives()?,
        test.len(),
        test.positives()?
    );

    let model = SymbolicModel::new(config.model.clone(), &device)?;
    let mut trainer = Trainer::new(model, config.targets, &config.training)?;
    let history = trainer.fit(&train, &config.training)?;
    if history.stopped_early {
        info!("Stopped early after {} epochs", history.epochs.len());
    }

    let model = trainer.into_model();
    if !test.is_empty() {
        let accuracy = model.accuracy(test.features(), test.labels())?;
        println!("test accuracy = {:.4}", accuracy);
    }
    save_checkpoint(&model, output)?;

    let extraction = extract_expressions(
        &model,
        &ExtractConfig {
            significant_digits: digits,
        },
    )?;
    println!("{}", extraction);
    Ok(())
}

fn cmd_extract(checkpoint: &Path, digits: u32) -> Result<()> {
    let model = load_checkpoint(checkpoint, &cpu_device())?;
    let extraction = extract_expressions(
        &model,
        &ExtractConfig {
            significant_digits: digits,
        },
    )?;
    println!("{}", extraction);
    Ok(())
}

fn cmd_scan(checkpoint: &Path, file: &Path) -> Result<()> {
    let device = best_device();
    let model = load_checkpoint(checkpoint, &device)?;
    let word_length = model.config().input_dim;

    let words = data::load_file(file, word_length)?;
    if words.is_empty() {
        println!("{} is shorter than one {}-bit word", file.display(), word_length);
        return Ok(());
    }
    let features = Dataset::from_samples(&[], &words, &device)?;
    let probabilities = model
        .predict(features.features())?
        .flatten_all()?
        .to_dtype(DType::F64)?
        .to_vec1::<f64>()?;

    let bytes_per_word = word_length / 8;
    let (positive, negative): (Vec<usize>, Vec<usize>) =
        (0..probabilities.len()).partition(|&i| probabilities[i] >= 0.5);
    let offsets = |words: &[usize]| -> Vec<usize> { words.iter().map(|i| i * bytes_per_word).collect() };

    println!("positive words: {} of {}", positive.len(), probabilities.len());
    println!("positive byte offsets: {:?}", offsets(&positive));
    println!("negative byte offsets: {:?}", offsets(&negative));
    Ok(())
}
