//! MixMatch Training CLI Tool
//!
//! Trains the reference OCT classifier with MixMatch on a seeded synthetic
//! OCT dataset and writes per-epoch metric summaries to the run directory.

mod synthetic;

use anyhow::{Context, Result};
use burn::{
    backend::{Autodiff, NdArray},
    optim::AdamConfig,
};
use chrono::Local;
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use oct_core::{
    load_toml_config, save_toml_config, setup_cli_logging, EpochSummary, ExperimentConfig,
    MetricsHistory, StepContext,
};
use oct_mixmatch::{MixMatchTrainer, OctClassifier, OctClassifierConfig};
use std::path::PathBuf;
use tracing::{debug, info};

use synthetic::{OctPool, CLASS_NAMES};

type TrainBackend = Autodiff<NdArray>;

/// OCT MixMatch Training Tool
#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train an OCT classifier with MixMatch",
    long_about = "Train a retinal OCT classifier with MixMatch semi-supervised learning: \
                  label guessing, mixup, interleaved batch norm and an EMA shadow model."
)]
struct Args {
    /// Path to experiment configuration file (TOML); defaults are used if omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override output directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Override number of epochs
    #[arg(short, long, value_name = "N")]
    epochs: Option<usize>,

    /// Override optimizer steps per epoch
    #[arg(long, value_name = "N")]
    steps: Option<usize>,

    /// Override learning rate
    #[arg(short, long, value_name = "LR")]
    lr: Option<f64>,

    /// Override batch size (train and test)
    #[arg(short, long, value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Override random seed
    #[arg(short, long)]
    seed: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Dry run (validate config without training)
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_cli_logging(args.verbose)?;

    info!("OCT MixMatch - Training Tool");
    info!("============================");

    let mut config = match &args.config {
        Some(path) => load_toml_config(path).context("Failed to load configuration file")?,
        None => ExperimentConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    print_config_summary(&config);

    if args.dry_run {
        info!("Configuration validated successfully (dry run)");
        return Ok(());
    }

    let run_dir = config.output_dir.join(format!(
        "{}_{}",
        config.name,
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    std::fs::create_dir_all(&run_dir).context("Failed to create output directory")?;

    let config_path = run_dir.join("config.toml");
    save_toml_config(&config, &config_path).context("Failed to save configuration")?;
    info!("Configuration saved to: {}", config_path.display());

    let summaries = run_training(&config)?;

    let metrics_path = run_dir.join("metrics.json");
    std::fs::write(&metrics_path, serde_json::to_string_pretty(&summaries)?)
        .context("Failed to write metrics")?;
    info!("Metrics saved to: {}", metrics_path.display());

    println!("{}", "Training completed successfully!".green().bold());

    Ok(())
}

fn apply_overrides(config: &mut ExperimentConfig, args: &Args) {
    if let Some(epochs) = args.epochs {
        config.train.epochs = epochs;
    }
    if let Some(steps) = args.steps {
        config.train.steps_per_epoch = steps;
    }
    if let Some(lr) = args.lr {
        config.optimizer.learning_rate = lr;
    }
    if let Some(batch_size) = args.batch_size {
        config.data.batch_size.train = batch_size;
        config.data.batch_size.test = batch_size;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(ref output) = args.output {
        config.output_dir = output.clone();
    }
}

fn print_config_summary(config: &ExperimentConfig) {
    let classes = &CLASS_NAMES[..config.data.num_classes.min(CLASS_NAMES.len())];

    info!("");
    info!("Configuration Summary:");
    info!("  Experiment: {}", config.name);
    info!("  Classes: {} ({})", config.data.num_classes, classes.join(", "));
    info!("  Image: {}x{}x{}", config.data.channels, config.data.image_size, config.data.image_size);
    info!(
        "  Samples: {} labeled/class, {} unlabeled, {} test",
        config.data.labeled_per_class, config.data.unlabeled_samples, config.data.test_samples
    );
    info!("  Epochs: {} x {} steps", config.train.epochs, config.train.steps_per_epoch);
    info!(
        "  Batch size: {} train / {} test",
        config.data.batch_size.train, config.data.batch_size.test
    );
    info!("  Learning rate: {}", config.optimizer.learning_rate);
    info!("  Seed: {}", config.seed);
    info!("  Output dir: {}", config.output_dir.display());
    info!("");
}

fn run_training(config: &ExperimentConfig) -> Result<Vec<EpochSummary>> {
    let device = Default::default();

    info!("Generating synthetic OCT scans...");
    let mut pool = OctPool::generate(config)?;
    info!(
        "{} labeled, {} unlabeled, {} test scans",
        pool.labeled.len(),
        pool.unlabeled.len(),
        pool.test.len()
    );
    let test_batches = pool.test_batches::<NdArray>(config.data.batch_size.test, &device);

    let model: OctClassifier<TrainBackend> = OctClassifierConfig::new()
        .with_num_classes(config.data.num_classes)
        .with_in_channels(config.data.channels)
        .init(&device);
    let optimizer = AdamConfig::new().init::<TrainBackend, OctClassifier<TrainBackend>>();
    let mut trainer = MixMatchTrainer::new(model, optimizer, config, &device)?;

    let epochs = config.train.epochs;
    let steps = config.train.steps_per_epoch;
    let batch_size = config.data.batch_size.train;

    let progress = ProgressBar::new((epochs * steps) as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} steps ({eta}) {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("=>-"),
    );

    let mut summaries = Vec::with_capacity(epochs);
    let mut best_acc: Option<f64> = None;

    for epoch in 0..epochs {
        let mut train_history = MetricsHistory::new();

        for step in 0..steps {
            let batch = pool.train_batch::<TrainBackend>(batch_size, &device)?;
            let ctx = StepContext::new(epoch, step, steps, config.optimizer.learning_rate);

            let diagnostics = trainer
                .train_step(&batch, &ctx)
                .with_context(|| format!("Training step failed at epoch {epoch}, step {step}"))?;
            diagnostics.publish(&mut train_history);

            progress.inc(1);
            progress.set_message(format!("loss={:.4}", diagnostics.loss));
        }

        let test_history = if (epoch + 1) % config.train.eval_every == 0 || epoch + 1 == epochs {
            let mut history = MetricsHistory::new();
            for diagnostics in trainer.eval_steps(&test_batches)? {
                diagnostics.publish(&mut history);
            }
            Some(history)
        } else {
            None
        };

        let summary = EpochSummary::new(epoch, &train_history, test_history.as_ref());
        log_epoch(&summary, epochs);

        if let Some(acc) = summary.test.as_ref().and_then(|t| t.get("acc_top1")).copied() {
            if best_acc.map_or(true, |best| acc > best) {
                best_acc = Some(acc);
                debug!("New best EMA accuracy: {:.4}", acc);
            }
        }
        summaries.push(summary);
    }

    progress.finish_with_message("Training completed");

    info!("");
    info!("Training Summary:");
    info!("  EMA updates: {}", trainer.ema().steps());
    if let Some(acc) = best_acc {
        info!("  Best EMA test accuracy: {:.2}%", acc * 100.0);
    }

    Ok(summaries)
}

fn log_epoch(summary: &EpochSummary, epochs: usize) {
    let train = |name: &str| summary.train.get(name).copied().unwrap_or(f64::NAN);

    info!(
        "Epoch {}/{}: loss={:.4}, Lx={:.4}, Lu={:.4}, w={:.2}, train_acc={:.4}",
        summary.epoch + 1,
        epochs,
        train("loss"),
        train("losses_l"),
        train("losses_u"),
        train("w"),
        train("acc_top1"),
    );

    if let Some(test) = &summary.test {
        let ce = test.get("cross_entropy").copied().unwrap_or(f64::NAN);
        match test.get("acc_top1") {
            Some(acc) => info!(
                "  {} cross_entropy={:.4}, acc_top1={}",
                "EMA test:".cyan(),
                ce,
                format!("{:.2}%", acc * 100.0).green()
            ),
            None => info!("  {} no labeled test rows", "EMA test:".cyan()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "train", "--epochs", "3", "--lr", "0.01", "--batch-size", "8", "--seed", "7",
        ]);
        let mut config = ExperimentConfig::default();
        apply_overrides(&mut config, &args);

        assert_eq!(config.train.epochs, 3);
        assert_eq!(config.optimizer.learning_rate, 0.01);
        assert_eq!(config.data.batch_size.train, 8);
        assert_eq!(config.data.batch_size.test, 8);
        assert_eq!(config.seed, 7);
        assert_eq!(config.rampup_epochs(), 3);
    }

    #[test]
    fn test_short_training_run() {
        let mut config = ExperimentConfig::default();
        config.data.image_size = 8;
        config.data.batch_size.train = 4;
        config.data.batch_size.test = 4;
        config.data.labeled_per_class = 2;
        config.data.unlabeled_samples = 8;
        config.data.test_samples = 8;
        config.train.epochs = 2;
        config.train.steps_per_epoch = 2;

        let summaries = run_training(&config).unwrap();
        assert_eq!(summaries.len(), 2);
        assert!(summaries[1].test.is_some());
        assert!(summaries[0].train.contains_key("losses_u"));
    }
}
