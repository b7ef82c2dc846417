//! # ANML meta-training
//!
//! Neuromodulated meta-learning for continual few-shot classification. A
//! representation network (RLN) produces features, a neuromodulatory network
//! (NM) produces a sigmoid gate of the same width, and a linear classifier
//! reads the gated features:
//!
//! ```text
//!          ┌──► RLN (3 conv blocks) ──► features [B, F] ─┐
//! x [B,C,H,W]                                             ⊙ ──► classifier ──► logits [B, K]
//!          └──► NM (3 conv blocks) ──► fc ──► sigmoid ───┘
//! ```
//!
//! Meta-training ([`meta`]) learns the RLN and NM so that sequential SGD on
//! new classes does not wipe out old ones; evaluation ([`eval`]) measures
//! exactly that on novel classes.
//!
//! ## Architecture
//!
//! ```text
//! TrainingConfig ──► MetaTrainer ──► Anml ──► artifact (.net / legacy .pt)
//!       │                │
//!       │           Sampler (EpisodeSampler: synthetic | image-folder)
//!       │
//!   RunContext (seed, device, verbose)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use anml_train::config::TrainingConfig;
//! use anml_train::context::RunContext;
//! use anml_train::meta::MetaTrainer;
//! use anml_train::sampler::{EpisodeSampler, SyntheticConfig};
//!
//! let config = TrainingConfig { rln_channels: 16, nm_channels: 8, epochs: 10, ..Default::default() };
//! config.validate().expect("config is valid");
//!
//! let ctx = RunContext::cpu(config.seed);
//! let mut sampler = EpisodeSampler::synthetic(&SyntheticConfig::default(), config.seed).unwrap();
//! let mut trainer = MetaTrainer::from_config(config, ctx).unwrap();
//! let summary = trainer.train(&mut sampler).unwrap();
//! println!("final meta-loss: {:?}", summary.last());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod artifact;
pub mod config;
pub mod context;
pub mod error;
pub mod eval;
pub mod meta;
pub mod model;
pub mod sampler;

// Convenient re-exports at the crate root.
pub use artifact::{load_model, save_packaged, ArtifactFormat, LegacyShape};
pub use config::{DatasetKind, DeviceChoice, EvalConfig, TrainingConfig, TrainingOverrides};
pub use context::RunContext;
pub use error::{AnmlError, AnmlResult, ConfigError, SamplerError};
pub use eval::{evaluate, test_test, test_train, EvalReport};
pub use meta::{adapt, Adaptation, IterationRecord, MetaTrainer, TrainingSummary};
pub use model::{Anml, FastWeights, ModelSpec, ParamLayout};
pub use sampler::{EpisodeSampler, Sampler, SyntheticConfig, TestEpisode, TrainEpisode, TrainRequest};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
