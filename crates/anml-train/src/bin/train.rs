//! `anml-train` binary: meta-train an ANML model.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin anml-train -- --config configs/omniglot.json
//! cargo run --release --bin anml-train -- --config configs/omniglot.json --epochs 100 --device cpu -v
//! ```
//!
//! Every option except `--config`, `--verbose` and `--log-level` overrides
//! the value of the same name in the config file, which in turn overrides
//! the built-in default.

use anml_train::config::{DatasetKind, DeviceChoice, TrainingConfig, TrainingOverrides};
use anml_train::context::RunContext;
use anml_train::meta::MetaTrainer;
use anml_train::sampler::{EpisodeSampler, Sampler};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

/// Command-line arguments for the training binary.
#[derive(Parser, Debug)]
#[command(name = "anml-train", version, about = "ANML meta-training", long_about = None)]
struct Args {
    /// Path to the JSON training config file.
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Dataset: synthetic, image-folder (alias omniglot).
    #[arg(long)]
    dataset: Option<DatasetKind>,

    /// Root directory of an image-folder dataset.
    #[arg(long, value_name = "DIR")]
    data_path: Option<PathBuf>,

    /// Resize images to this side length.
    #[arg(long, value_name = "PX")]
    im_size: Option<i64>,

    /// Image channels (1 = greyscale, 3 = RGB).
    #[arg(long)]
    channels: Option<i64>,

    /// Examples per inner-loop task; sets num_batches = train_size / batch_size.
    #[arg(long)]
    train_size: Option<usize>,

    /// Number of channels in the RLN.
    #[arg(long, value_name = "NUM_CHANNELS")]
    rln: Option<i64>,

    /// Number of channels in the NM.
    #[arg(long, value_name = "NUM_CHANNELS")]
    nm: Option<i64>,

    /// Classifier outputs.
    #[arg(long)]
    num_classes: Option<i64>,

    /// Examples per inner-loop batch.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Inner-loop batches per task.
    #[arg(long)]
    num_batches: Option<usize>,

    /// Passes over the task batches per outer iteration.
    #[arg(long)]
    train_cycles: Option<usize>,

    /// Held-out examples scored at each progress report.
    #[arg(long)]
    val_size: Option<usize>,

    /// Examples from other classes added to the meta-loss.
    #[arg(long)]
    remember_size: Option<usize>,

    /// Leave the task's own examples out of the meta-loss.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    remember_only: bool,

    /// Inner learning rate.
    #[arg(long, value_name = "RATE")]
    inner_lr: Option<f64>,

    /// Outer learning rate.
    #[arg(long, value_name = "RATE")]
    outer_lr: Option<f64>,

    /// Outer iterations between checkpoints.
    #[arg(long)]
    save_freq: Option<usize>,

    /// Number of outer iterations.
    #[arg(long)]
    epochs: Option<usize>,

    /// Directory for checkpoints.
    #[arg(long, value_name = "DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Compute device: auto, cpu, cuda, cuda:N.
    #[arg(long)]
    device: Option<DeviceChoice>,

    /// Random seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Report progress every iteration.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> TrainingOverrides {
        TrainingOverrides {
            dataset: self.dataset,
            data_path: self.data_path.clone(),
            im_size: self.im_size,
            channels: self.channels,
            rln_channels: self.rln,
            nm_channels: self.nm,
            num_classes: self.num_classes,
            train_size: self.train_size,
            batch_size: self.batch_size,
            num_batches: self.num_batches,
            train_cycles: self.train_cycles,
            inner_lr: self.inner_lr,
            remember_size: self.remember_size,
            // A bare flag can only switch this on.
            remember_only: self.remember_only.then_some(true),
            outer_lr: self.outer_lr,
            epochs: self.epochs,
            val_size: self.val_size,
            save_freq: self.save_freq,
            checkpoint_dir: self.checkpoint_dir.clone(),
            device: self.device,
            seed: self.seed,
        }
    }
}

fn main() {
    let args = Args::parse();

    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("ANML meta-training v{}", anml_train::VERSION);

    info!("Loading configuration from {}", args.config.display());
    let file = match TrainingOverrides::from_json(&args.config) {
        Ok(tier) => tier,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    let config = match TrainingConfig::resolve(args.overrides(), file) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Configuration validation failed: {e}");
            std::process::exit(1);
        }
    };

    info!("Configuration validated successfully");
    info!("  dataset      : {} ({})", config.dataset, config.data_path.display());
    info!("  input shape  : {:?}", config.input_shape());
    info!("  rln / nm     : {} / {}", config.rln_channels, config.nm_channels);
    info!("  task         : {} x {} (cycles {})", config.num_batches, config.batch_size, config.train_cycles);
    info!("  remember     : {} (only: {})", config.remember_size, config.remember_only);
    info!("  inner / outer: {} / {}", config.inner_lr, config.outer_lr);
    info!("  epochs       : {}", config.epochs);
    info!("  device       : {}", config.device);

    if let Err(e) = run(config, args.verbose) {
        error!("Training failed: {e}");
        std::process::exit(1);
    }
}

fn run(config: TrainingConfig, verbose: bool) -> anml_train::AnmlResult<()> {
    let ctx = RunContext::from_config(&config, verbose)?;
    let mut sampler = EpisodeSampler::from_config(&config)?;
    info!("Dataset: {} ({} training classes)", sampler.name(), sampler.num_train_classes());

    let mut trainer = MetaTrainer::from_config(config, ctx)?;
    info!("Commencing training.");
    let summary = trainer.train(&mut sampler)?;
    if let Some(last) = summary.last() {
        info!("Training complete: loss {:.4}, accuracy {:.3}", last.loss, last.accuracy);
    }
    if let Some(path) = summary.checkpoints.last() {
        info!("Final model: {}", path.display());
    }
    Ok(())
}
