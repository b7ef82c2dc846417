//! `anml-eval` binary: meta-test a trained model on novel classes.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin anml-eval -- --model checkpoints/ANML-1-28-28-final.net \
//!     --dataset omniglot --data-path data/omniglot --runs 10
//! ```

use anml_train::config::{DatasetKind, DeviceChoice, EvalConfig};
use anml_train::context::RunContext;
use anml_train::eval::evaluate;
use anml_train::sampler::{EpisodeSampler, SyntheticConfig};
use anml_train::AnmlResult;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

/// Command-line arguments for the evaluation binary.
#[derive(Parser, Debug)]
#[command(name = "anml-eval", version, about = "ANML meta-test evaluation", long_about = None)]
struct Args {
    /// Trained model (.net, or legacy .pt/.pth).
    #[arg(short, long, value_name = "FILE")]
    model: PathBuf,

    /// Dataset: synthetic, image-folder (alias omniglot).
    #[arg(long, default_value = "synthetic")]
    dataset: DatasetKind,

    /// Root directory of an image-folder dataset.
    #[arg(long, value_name = "DIR", default_value = "data/omniglot")]
    data_path: PathBuf,

    /// Image side length the model expects.
    #[arg(long, value_name = "PX", default_value_t = 28)]
    im_size: i64,

    /// Image channels the model expects.
    #[arg(long, default_value_t = 1)]
    channels: i64,

    /// Novel classes learned in sequence.
    #[arg(long, default_value_t = 10)]
    classes: usize,

    /// Fine-tuning examples per class.
    #[arg(long, default_value_t = 15)]
    train_examples: usize,

    /// Examples per class in the dataset; the rest are held out.
    #[arg(long, default_value_t = 20)]
    examples_per_class: usize,

    /// Fine-tuning learning rate.
    #[arg(long, value_name = "RATE", default_value_t = 0.01)]
    lr: f64,

    /// Independent repetitions.
    #[arg(long, default_value_t = 1)]
    runs: usize,

    /// Compute device: auto, cpu, cuda, cuda:N.
    #[arg(long, default_value = "auto")]
    device: DeviceChoice,

    /// Random seed.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
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

    info!("ANML meta-test v{}", anml_train::VERSION);

    let config = EvalConfig {
        num_classes: args.classes,
        train_examples: args.train_examples,
        examples_per_class: args.examples_per_class,
        lr: args.lr,
        runs: args.runs,
    };
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {e}");
        std::process::exit(1);
    }

    match run(&args, &config) {
        Ok(()) => {}
        Err(e) => {
            error!("Evaluation failed: {e}");
            std::process::exit(1);
        }
    }
}

fn run(args: &Args, config: &EvalConfig) -> AnmlResult<()> {
    let device = args.device.resolve()?;
    let ctx = RunContext::new(args.seed, device, false);
    let input_shape = [args.channels, args.im_size, args.im_size];

    let mut sampler = match args.dataset {
        DatasetKind::Synthetic => {
            let synthetic = SyntheticConfig {
                input_shape,
                num_test_classes: SyntheticConfig::default().num_test_classes.max(config.num_classes),
                examples_per_class: config.examples_per_class,
                ..SyntheticConfig::default()
            };
            EpisodeSampler::synthetic(&synthetic, args.seed)?
        }
        DatasetKind::ImageFolder => EpisodeSampler::image_folder(&args.data_path, input_shape, 0, args.seed)?,
    };

    let report = evaluate(&args.model, &mut sampler, config, &ctx)?;
    for (i, accs) in report.runs.iter().enumerate() {
        let formatted: Vec<String> = accs.iter().map(|a| format!("{a:.2}")).collect();
        info!("run {:>3}: [{}]", i + 1, formatted.join(", "));
    }
    info!("Mean accuracy: {:.4} (std {:.4} over {} runs)", report.mean, report.std, config.runs);
    Ok(())
}
