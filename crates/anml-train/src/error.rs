//! Error types for the ANML training pipeline.
//!
//! Every module that can fail imports its error type from here, keeping the
//! hierarchy in one place.
//!
//! ## Hierarchy
//!
//! ```text
//! AnmlError (top-level)
//! ├── ConfigError   (config values, config files, model file names)
//! ├── SamplerError  (dataset discovery, image decoding, episode sampling)
//! └── tch::TchError (libtorch failures, including tensor shape errors)
//! ```
//!
//! None of these are retried. Every variant describes a permanent
//! misconfiguration or a broken run, and the binaries terminate on the first
//! one they see.

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// AnmlResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used throughout the crate.
pub type AnmlResult<T> = Result<T, AnmlError>;

// ---------------------------------------------------------------------------
// AnmlError — top-level aggregator
// ---------------------------------------------------------------------------

/// Top-level error type for meta-training and evaluation.
#[derive(Debug, Error)]
pub enum AnmlError {
    /// A configuration, model-file-name, or option error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Two shapes that must agree do not.
    ///
    /// Raised when a sampler supplies images of a different shape than the
    /// model was built for, and when an architecture probe produces a tensor
    /// of unexpected rank.
    #[error("Shape mismatch ({context}): expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Where the mismatch was detected.
        context: String,
        /// Expected shape.
        expected: Vec<i64>,
        /// Actual shape.
        actual: Vec<i64>,
    },

    /// A training hyper-parameter is outside its legal range.
    #[error("Invalid training parameter `{name}`: {reason}")]
    ParameterValidation {
        /// Name of the parameter.
        name: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A class index does not address a classifier row.
    #[error("Class index {index} is out of range for a classifier with {num_classes} outputs")]
    InvalidClass {
        /// The requested class.
        index: i64,
        /// Number of classifier outputs.
        num_classes: i64,
    },

    /// Held-out labels cannot be split into equal per-class chunks.
    #[error("{len} held-out examples cannot be split into chunks of {chunk}")]
    UnevenChunks {
        /// Number of held-out examples.
        len: i64,
        /// Requested chunk size.
        chunk: i64,
    },

    /// A packaged model file is corrupt or was not written by this crate.
    #[error("Invalid model artifact `{path}`: {message}")]
    Artifact {
        /// File being read.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },

    /// Episode sampling failed.
    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    /// A libtorch operation failed.
    #[error("Tensor error: {0}")]
    Tch(#[from] tch::TchError),

    /// An I/O error with no more specific context.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AnmlError {
    /// Construct an [`AnmlError::ShapeMismatch`].
    pub fn shape_mismatch<S: Into<String>>(context: S, expected: Vec<i64>, actual: Vec<i64>) -> Self {
        AnmlError::ShapeMismatch { context: context.into(), expected, actual }
    }

    /// Construct an [`AnmlError::ParameterValidation`].
    pub fn invalid_parameter<S: Into<String>>(name: &'static str, reason: S) -> Self {
        AnmlError::ParameterValidation { name, reason: reason.into() }
    }

    /// Construct an [`AnmlError::Artifact`].
    pub fn artifact<S: Into<String>>(path: impl Into<PathBuf>, message: S) -> Self {
        AnmlError::Artifact { path: path.into(), message: message.into() }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced while resolving configuration or interpreting model files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A configuration file could not be read from disk.
    #[error("Cannot read config file `{path}`: {source}")]
    FileRead {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The model file extension is not one of the supported formats.
    #[error("Unsupported model file type: `{path}`. Expected one of .net, .pt, .pth")]
    UnsupportedModelFile {
        /// Offending path.
        path: PathBuf,
    },

    /// A legacy model file name does not encode a usable architecture.
    #[error("Unsupported legacy model shape in `{name}`: {reason}")]
    LegacyModelName {
        /// The file name that was parsed.
        name: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }

    /// Construct a [`ConfigError::LegacyModelName`].
    pub fn legacy_name<S: Into<String>, R: Into<String>>(name: S, reason: R) -> Self {
        ConfigError::LegacyModelName { name: name.into(), reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// SamplerError
// ---------------------------------------------------------------------------

/// Errors produced while loading a dataset or drawing an episode from it.
#[derive(Debug, Error)]
pub enum SamplerError {
    /// The dataset directory does not exist.
    #[error("Dataset directory not found: `{path}`")]
    DirectoryNotFound {
        /// The missing directory.
        path: PathBuf,
    },

    /// An image could not be decoded.
    #[error("Cannot decode image `{path}`: {message}")]
    ImageDecode {
        /// The image file.
        path: PathBuf,
        /// Decoder message.
        message: String,
    },

    /// The dataset cannot satisfy the requested episode.
    #[error("Not enough data: {0}")]
    NotEnoughData(String),

    /// Images in a pool do not share the pool's `[C, H, W]` shape.
    #[error("Image shape mismatch ({context}): expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Where the mismatch was detected.
        context: &'static str,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// A low-level I/O error while scanning the dataset.
    #[error("I/O error reading `{path}`: {source}")]
    Io {
        /// Path being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl SamplerError {
    /// Construct a [`SamplerError::NotEnoughData`].
    pub fn not_enough<S: Into<String>>(msg: S) -> Self {
        SamplerError::NotEnoughData(msg.into())
    }

    /// Construct a [`SamplerError::Io`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SamplerError::Io { path: path.into(), source }
    }
}
