//! Run configuration for meta-training and evaluation.
//!
//! [`TrainingConfig`] is resolved exactly once at startup from three tiers,
//! highest precedence first:
//!
//! 1. values given explicitly on the command line,
//! 2. values present in the JSON config file,
//! 3. the documented defaults of [`TrainingConfig::default()`].
//!
//! The first two tiers are both expressed as [`TrainingOverrides`] (every
//! field optional), so "was this set?" is ordinary data rather than a
//! comparison against parser defaults.
//!
//! # Example
//!
//! ```rust
//! use anml_train::config::{TrainingConfig, TrainingOverrides};
//!
//! let cli = TrainingOverrides { inner_lr: Some(0.05), ..Default::default() };
//! let file = TrainingOverrides { inner_lr: Some(0.2), epochs: Some(10), ..Default::default() };
//!
//! let cfg = TrainingConfig::resolve(cli, file).expect("valid config");
//! assert_eq!(cfg.inner_lr, 0.05);
//! assert_eq!(cfg.epochs, 10);
//! assert_eq!(cfg.remember_size, 64);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tch::Device;

use crate::error::ConfigError;
use crate::model::{ModelSpec, MIN_INPUT_SIDE};

// ---------------------------------------------------------------------------
// DatasetKind
// ---------------------------------------------------------------------------

/// Which [`Sampler`](crate::sampler::Sampler) backs a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatasetKind {
    /// Deterministic generated class prototypes; no files needed.
    Synthetic,
    /// One sub-directory of images per class (e.g. Omniglot).
    #[serde(alias = "omniglot")]
    ImageFolder,
}

impl FromStr for DatasetKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "synthetic" => Ok(DatasetKind::Synthetic),
            "image-folder" | "omniglot" => Ok(DatasetKind::ImageFolder),
            other => Err(ConfigError::invalid_value(
                "dataset",
                format!("unknown dataset `{other}` (expected synthetic, image-folder or omniglot)"),
            )),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetKind::Synthetic => f.write_str("synthetic"),
            DatasetKind::ImageFolder => f.write_str("image-folder"),
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceChoice
// ---------------------------------------------------------------------------

/// Requested compute device: `auto`, `cpu`, `cuda` or `cuda:N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceChoice {
    /// CUDA device 0 when available, CPU otherwise.
    Auto,
    /// Always the CPU.
    Cpu,
    /// A specific CUDA device.
    Cuda(usize),
}

impl DeviceChoice {
    /// Map to a `tch` device.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when CUDA is requested but not
    /// available.
    pub fn resolve(self) -> Result<Device, ConfigError> {
        match self {
            DeviceChoice::Auto => Ok(Device::cuda_if_available()),
            DeviceChoice::Cpu => Ok(Device::Cpu),
            DeviceChoice::Cuda(index) => {
                if !tch::Cuda::is_available() {
                    return Err(ConfigError::invalid_value("device", "CUDA was requested but is not available"));
                }
                Ok(Device::Cuda(index))
            }
        }
    }
}

impl FromStr for DeviceChoice {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "auto" => Ok(DeviceChoice::Auto),
            "cpu" => Ok(DeviceChoice::Cpu),
            "cuda" | "gpu" => Ok(DeviceChoice::Cuda(0)),
            _ => lower
                .strip_prefix("cuda:")
                .and_then(|idx| idx.parse().ok())
                .map(DeviceChoice::Cuda)
                .ok_or_else(|| ConfigError::invalid_value("device", format!("unknown device `{s}`"))),
        }
    }
}

impl TryFrom<String> for DeviceChoice {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceChoice> for String {
    fn from(d: DeviceChoice) -> Self {
        d.to_string()
    }
}

impl fmt::Display for DeviceChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceChoice::Auto => f.write_str("auto"),
            DeviceChoice::Cpu => f.write_str("cpu"),
            DeviceChoice::Cuda(i) => write!(f, "cuda:{i}"),
        }
    }
}

// ---------------------------------------------------------------------------
// TrainingConfig
// ---------------------------------------------------------------------------

/// Fully resolved configuration of one meta-training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    // -----------------------------------------------------------------------
    // Data
    // -----------------------------------------------------------------------
    /// Dataset backing the sampler. Default: **synthetic**.
    pub dataset: DatasetKind,

    /// Root directory of an image-folder dataset. Default: **data/omniglot**.
    pub data_path: PathBuf,

    /// Side length of the square input images. Default: **28**.
    pub im_size: i64,

    /// Number of image channels. Default: **1** (greyscale).
    pub channels: i64,

    // -----------------------------------------------------------------------
    // Model
    // -----------------------------------------------------------------------
    /// RLN channel width. Default: **256**.
    pub rln_channels: i64,

    /// NM channel width. Default: **112**.
    pub nm_channels: i64,

    /// Classifier outputs. Default: **1000**.
    pub num_classes: i64,

    // -----------------------------------------------------------------------
    // Inner loop
    // -----------------------------------------------------------------------
    /// Examples per inner-loop batch. Default: **1**.
    pub batch_size: usize,

    /// Inner-loop batches per task. Default: **20**.
    pub num_batches: usize,

    /// Passes over the task batches per outer iteration. Default: **1**.
    pub train_cycles: usize,

    /// Inner learning rate (plain SGD). Default: **0.1**.
    pub inner_lr: f64,

    // -----------------------------------------------------------------------
    // Outer loop
    // -----------------------------------------------------------------------
    /// Randomly sampled examples from other classes added to the meta-loss.
    /// Default: **64**.
    pub remember_size: usize,

    /// Exclude the task's own examples from the meta-loss. Default: **false**.
    pub remember_only: bool,

    /// Outer (Adam) learning rate. Default: **1e-3**.
    pub outer_lr: f64,

    /// Number of outer iterations. Default: **30000**.
    pub epochs: usize,

    // -----------------------------------------------------------------------
    // Logging and checkpointing
    // -----------------------------------------------------------------------
    /// Held-out examples scored whenever progress is reported; 0 disables it.
    /// Default: **200**.
    pub val_size: usize,

    /// Outer iterations between checkpoints. Default: **1000**.
    pub save_freq: usize,

    /// Directory for packaged checkpoints. Default: **checkpoints**.
    pub checkpoint_dir: PathBuf,

    // -----------------------------------------------------------------------
    // Runtime
    // -----------------------------------------------------------------------
    /// Compute device. Default: **auto**.
    pub device: DeviceChoice,

    /// Seed for libtorch and the sampler. Default: **1**.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            dataset: DatasetKind::Synthetic,
            data_path: PathBuf::from("data/omniglot"),
            im_size: 28,
            channels: 1,
            rln_channels: 256,
            nm_channels: 112,
            num_classes: 1000,
            batch_size: 1,
            num_batches: 20,
            train_cycles: 1,
            inner_lr: 1e-1,
            remember_size: 64,
            remember_only: false,
            outer_lr: 1e-3,
            epochs: 30_000,
            val_size: 200,
            save_freq: 1000,
            checkpoint_dir: PathBuf::from("checkpoints"),
            device: DeviceChoice::Auto,
            seed: 1,
        }
    }
}

impl TrainingConfig {
    /// Merge command-line and file overrides over the defaults, then validate.
    ///
    /// `num_batches` and `train_size` form one setting: whichever tier names
    /// either of them decides the batch count, so a command-line
    /// `num_batches` beats a file `train_size`. A `train_size` yields
    /// `train_size / batch_size` batches, which must divide exactly.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for the first incoherent field.
    pub fn resolve(cli: TrainingOverrides, mut file: TrainingOverrides) -> Result<Self, ConfigError> {
        if cli.num_batches.is_some() || cli.train_size.is_some() {
            file.num_batches = None;
            file.train_size = None;
        }
        let o = cli.or(file);
        let d = TrainingConfig::default();
        let batch_size = o.batch_size.unwrap_or(d.batch_size);
        let num_batches = match o.train_size {
            Some(train_size) => {
                if batch_size == 0 || train_size % batch_size != 0 {
                    return Err(ConfigError::invalid_value(
                        "train_size",
                        format!("{train_size} is not a multiple of batch_size {batch_size}"),
                    ));
                }
                train_size / batch_size
            }
            None => o.num_batches.unwrap_or(d.num_batches),
        };
        let cfg = TrainingConfig {
            dataset: o.dataset.unwrap_or(d.dataset),
            data_path: o.data_path.unwrap_or(d.data_path),
            im_size: o.im_size.unwrap_or(d.im_size),
            channels: o.channels.unwrap_or(d.channels),
            rln_channels: o.rln_channels.unwrap_or(d.rln_channels),
            nm_channels: o.nm_channels.unwrap_or(d.nm_channels),
            num_classes: o.num_classes.unwrap_or(d.num_classes),
            batch_size,
            num_batches,
            train_cycles: o.train_cycles.unwrap_or(d.train_cycles),
            inner_lr: o.inner_lr.unwrap_or(d.inner_lr),
            remember_size: o.remember_size.unwrap_or(d.remember_size),
            remember_only: o.remember_only.unwrap_or(d.remember_only),
            outer_lr: o.outer_lr.unwrap_or(d.outer_lr),
            epochs: o.epochs.unwrap_or(d.epochs),
            val_size: o.val_size.unwrap_or(d.val_size),
            save_freq: o.save_freq.unwrap_or(d.save_freq),
            checkpoint_dir: o.checkpoint_dir.unwrap_or(d.checkpoint_dir),
            device: o.device.unwrap_or(d.device),
            seed: o.seed.unwrap_or(d.seed),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Input shape `[C, H, W]` implied by `channels` and `im_size`.
    pub fn input_shape(&self) -> [i64; 3] {
        [self.channels, self.im_size, self.im_size]
    }

    /// Model architecture implied by this configuration.
    pub fn model_spec(&self) -> ModelSpec {
        ModelSpec::new(self.input_shape(), self.rln_channels, self.nm_channels, self.num_classes)
    }

    /// Examples in one inner-loop task (`batch_size × num_batches`).
    pub fn train_size(&self) -> usize {
        self.batch_size * self.num_batches
    }

    /// Validate structural fields.
    ///
    /// Learning rates and the iteration count are checked by the meta-trainer
    /// itself, which reports them as parameter-validation errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.im_size < MIN_INPUT_SIDE {
            return Err(ConfigError::invalid_value(
                "im_size",
                format!("must be >= {MIN_INPUT_SIDE} to survive three valid convolutions"),
            ));
        }
        if self.channels <= 0 {
            return Err(ConfigError::invalid_value("channels", "must be > 0"));
        }
        self.model_spec().validate()?;
        if self.batch_size == 0 {
            return Err(ConfigError::invalid_value("batch_size", "must be > 0"));
        }
        if self.num_batches == 0 {
            return Err(ConfigError::invalid_value("num_batches", "must be > 0"));
        }
        if self.train_cycles == 0 {
            return Err(ConfigError::invalid_value("train_cycles", "must be > 0"));
        }
        if self.remember_only && self.remember_size == 0 {
            return Err(ConfigError::invalid_value(
                "remember_size",
                "must be > 0 when remember_only is set, or the meta-loss is empty",
            ));
        }
        if self.save_freq == 0 {
            return Err(ConfigError::invalid_value("save_freq", "must be > 0"));
        }
        Ok(())
    }

    /// Serialize to pretty-printed JSON at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be written.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| ConfigError::FileRead { path: parent.to_path_buf(), source })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead { path: path.to_path_buf(), source })
    }
}

// ---------------------------------------------------------------------------
// TrainingOverrides
// ---------------------------------------------------------------------------

/// One configuration tier: every field optional, `None` meaning "not set here".
///
/// Deserialized from the config file (unknown keys are rejected) and built
/// from command-line arguments. Fields mirror [`TrainingConfig`]; the extra
/// `train_size` is resolved into `num_batches`.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingOverrides {
    pub dataset: Option<DatasetKind>,
    pub data_path: Option<PathBuf>,
    pub im_size: Option<i64>,
    pub channels: Option<i64>,
    #[serde(alias = "rln")]
    pub rln_channels: Option<i64>,
    #[serde(alias = "nm")]
    pub nm_channels: Option<i64>,
    pub num_classes: Option<i64>,
    pub train_size: Option<usize>,
    pub batch_size: Option<usize>,
    pub num_batches: Option<usize>,
    pub train_cycles: Option<usize>,
    pub inner_lr: Option<f64>,
    pub remember_size: Option<usize>,
    pub remember_only: Option<bool>,
    pub outer_lr: Option<f64>,
    pub epochs: Option<usize>,
    pub val_size: Option<usize>,
    pub save_freq: Option<usize>,
    pub checkpoint_dir: Option<PathBuf>,
    pub device: Option<DeviceChoice>,
    pub seed: Option<u64>,
}

impl TrainingOverrides {
    /// Read a tier from a JSON config file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileRead`] if the file cannot be read and
    /// [`ConfigError::ParseError`] if it is not valid JSON for this schema.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::FileRead { path: path.to_path_buf(), source })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError { path: path.to_path_buf(), source })
    }

    /// Field-wise merge: values in `self` win, gaps are filled from `lower`.
    pub fn or(self, lower: TrainingOverrides) -> TrainingOverrides {
        TrainingOverrides {
            dataset: self.dataset.or(lower.dataset),
            data_path: self.data_path.or(lower.data_path),
            im_size: self.im_size.or(lower.im_size),
            channels: self.channels.or(lower.channels),
            rln_channels: self.rln_channels.or(lower.rln_channels),
            nm_channels: self.nm_channels.or(lower.nm_channels),
            num_classes: self.num_classes.or(lower.num_classes),
            train_size: self.train_size.or(lower.train_size),
            batch_size: self.batch_size.or(lower.batch_size),
            num_batches: self.num_batches.or(lower.num_batches),
            train_cycles: self.train_cycles.or(lower.train_cycles),
            inner_lr: self.inner_lr.or(lower.inner_lr),
            remember_size: self.remember_size.or(lower.remember_size),
            remember_only: self.remember_only.or(lower.remember_only),
            outer_lr: self.outer_lr.or(lower.outer_lr),
            epochs: self.epochs.or(lower.epochs),
            val_size: self.val_size.or(lower.val_size),
            save_freq: self.save_freq.or(lower.save_freq),
            checkpoint_dir: self.checkpoint_dir.or(lower.checkpoint_dir),
            device: self.device.or(lower.device),
            seed: self.seed.or(lower.seed),
        }
    }
}

// ---------------------------------------------------------------------------
// EvalConfig
// ---------------------------------------------------------------------------

/// Configuration of the meta-test protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Number of novel classes learned in sequence. Default: **10**.
    pub num_classes: usize,

    /// Examples per class used for fine-tuning. Default: **15**.
    pub train_examples: usize,

    /// Examples available per class; the rest are held out. Default: **20**.
    pub examples_per_class: usize,

    /// Fine-tuning (Adam) learning rate. Default: **0.01**.
    pub lr: f64,

    /// Independent repetitions of the protocol. Default: **1**.
    pub runs: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        EvalConfig { num_classes: 10, train_examples: 15, examples_per_class: 20, lr: 0.01, runs: 1 }
    }
}

impl EvalConfig {
    /// Held-out examples per class.
    pub fn test_examples(&self) -> usize {
        self.examples_per_class.saturating_sub(self.train_examples)
    }

    /// Validate all fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_classes == 0 {
            return Err(ConfigError::invalid_value("num_classes", "must be > 0"));
        }
        if self.train_examples == 0 {
            return Err(ConfigError::invalid_value("train_examples", "must be > 0"));
        }
        if self.train_examples >= self.examples_per_class {
            return Err(ConfigError::invalid_value(
                "train_examples",
                format!("must be < examples_per_class ({})", self.examples_per_class),
            ));
        }
        if self.lr <= 0.0 {
            return Err(ConfigError::invalid_value("lr", "must be > 0.0"));
        }
        if self.runs == 0 {
            return Err(ConfigError::invalid_value("runs", "must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        TrainingConfig::default().validate().expect("default config should be valid");
    }

    #[test]
    fn empty_tiers_resolve_to_defaults() {
        let cfg = TrainingConfig::resolve(TrainingOverrides::default(), TrainingOverrides::default()).unwrap();
        assert_eq!(cfg, TrainingConfig::default());
    }

    #[test]
    fn train_size_sets_num_batches() {
        let cli = TrainingOverrides { train_size: Some(20), batch_size: Some(4), ..Default::default() };
        let cfg = TrainingConfig::resolve(cli, TrainingOverrides::default()).unwrap();
        assert_eq!(cfg.num_batches, 5);
        assert_eq!(cfg.train_size(), 20);
    }

    #[test]
    fn uneven_train_size_is_invalid() {
        let cli = TrainingOverrides { train_size: Some(10), batch_size: Some(3), ..Default::default() };
        assert!(TrainingConfig::resolve(cli, TrainingOverrides::default()).is_err());
    }

    #[test]
    fn tiny_images_are_invalid() {
        let mut cfg = TrainingConfig::default();
        cfg.im_size = 12;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn remember_only_without_remember_set_is_invalid() {
        let mut cfg = TrainingConfig::default();
        cfg.remember_only = true;
        cfg.remember_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn device_choice_parses() {
        assert_eq!("cpu".parse::<DeviceChoice>().unwrap(), DeviceChoice::Cpu);
        assert_eq!("AUTO".parse::<DeviceChoice>().unwrap(), DeviceChoice::Auto);
        assert_eq!("cuda".parse::<DeviceChoice>().unwrap(), DeviceChoice::Cuda(0));
        assert_eq!("cuda:3".parse::<DeviceChoice>().unwrap(), DeviceChoice::Cuda(3));
        assert!("tpu".parse::<DeviceChoice>().is_err());
        assert!("cuda:x".parse::<DeviceChoice>().is_err());
    }

    #[test]
    fn cpu_device_always_resolves() {
        assert_eq!(DeviceChoice::Cpu.resolve().unwrap(), Device::Cpu);
    }

    #[test]
    fn dataset_kind_accepts_omniglot_alias() {
        assert_eq!("omniglot".parse::<DatasetKind>().unwrap(), DatasetKind::ImageFolder);
        assert!("mnist".parse::<DatasetKind>().is_err());
    }

    #[test]
    fn json_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("run").join("config.json");
        let mut original = TrainingConfig::default();
        original.device = DeviceChoice::Cuda(1);
        original.to_json(&path).unwrap();

        let file = TrainingOverrides::from_json(&path).unwrap();
        let loaded = TrainingConfig::resolve(TrainingOverrides::default(), file).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn eval_config_test_examples() {
        let cfg = EvalConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.test_examples(), 5);
    }

    #[test]
    fn eval_config_rejects_all_training_examples() {
        let cfg = EvalConfig { train_examples: 20, ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
