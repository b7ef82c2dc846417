//! Saving and loading trained models.
//!
//! Two on-disk formats are understood, selected by file extension:
//!
//! | Extension      | Format                                                    |
//! |----------------|-----------------------------------------------------------|
//! | `.net`         | [`ArtifactFormat::Packaged`]: self-describing, checksummed |
//! | `.pt` / `.pth` | [`ArtifactFormat::LegacyWeights`]: bare tensor archive     |
//!
//! A packaged file is laid out as
//!
//! ```text
//! b"ANMLNET1" | header_len: u64 LE | header: JSON | weights: VarStore stream
//! ```
//!
//! where the header carries the [`ModelSpec`] needed to rebuild the network
//! and the SHA-256 of the weight block.
//!
//! Legacy archives carry no metadata. Their architecture is encoded in the
//! file name, `<rln>_<nm>_<mask>_<anything>.pt`, with `mask == rln * 9`, and
//! they always describe a 1x28x28, 1000-class model.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use tch::{Device, Tensor};
use tracing::{debug, info};

use crate::error::{AnmlError, AnmlResult, ConfigError};
use crate::model::{Anml, ModelSpec};

/// Leading bytes of every packaged model.
pub const MAGIC: &[u8; 8] = b"ANMLNET1";

/// Header layout revision written by [`save_packaged`].
pub const HEADER_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Format detection
// ---------------------------------------------------------------------------

/// Architecture recovered from a legacy file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyShape {
    /// RLN channel width.
    pub rln_channels: i64,
    /// NM channel width.
    pub nm_channels: i64,
    /// Width of the gate vector; always `rln_channels * 9`.
    pub mask_size: i64,
}

impl LegacyShape {
    /// Input shape every legacy model was trained on.
    pub const INPUT_SHAPE: [i64; 3] = [1, 28, 28];

    /// Classifier width every legacy model was trained with.
    pub const NUM_CLASSES: i64 = 1000;

    /// Architecture to rebuild before loading the weights.
    pub fn model_spec(&self) -> ModelSpec {
        ModelSpec::new(Self::INPUT_SHAPE, self.rln_channels, self.nm_channels, Self::NUM_CLASSES)
    }
}

/// On-disk model format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    /// A `.net` file written by [`save_packaged`].
    Packaged,
    /// A `.pt`/`.pth` tensor archive whose name encodes its shape.
    LegacyWeights(LegacyShape),
}

impl ArtifactFormat {
    /// Determine the format of `path` from its extension (and, for legacy
    /// archives, its file name).
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnsupportedModelFile`] for any other extension and
    /// [`ConfigError::LegacyModelName`] for a legacy name that does not
    /// encode a valid shape.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let unsupported = || ConfigError::UnsupportedModelFile { path: path.to_path_buf() };
        let ext = path.extension().and_then(|e| e.to_str()).ok_or_else(unsupported)?;
        match ext {
            "net" => Ok(ArtifactFormat::Packaged),
            "pt" | "pth" => {
                let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(unsupported)?;
                Ok(ArtifactFormat::LegacyWeights(parse_legacy_name(name)?))
            }
            _ => Err(unsupported()),
        }
    }
}

/// Parse `<rln>_<nm>_<mask>_<suffix>` into a [`LegacyShape`].
///
/// Every `_`-separated segment except the last must be an integer, and there
/// must be exactly three of them.
///
/// ```rust
/// use anml_train::artifact::parse_legacy_name;
/// let shape = parse_legacy_name("64_32_576_model.pt").unwrap();
/// assert_eq!(shape.rln_channels, 64);
/// assert!(parse_legacy_name("64_32_500_model.pt").is_err());
/// ```
pub fn parse_legacy_name(name: &str) -> Result<LegacyShape, ConfigError> {
    let segments: Vec<&str> = name.split('_').collect();
    let sizes = segments[..segments.len() - 1]
        .iter()
        .map(|s| s.parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::legacy_name(name, format!("size segment is not an integer: {e}")))?;

    let &[rln_channels, nm_channels, mask_size] = sizes.as_slice() else {
        return Err(ConfigError::legacy_name(name, format!("expected 3 sizes, found {sizes:?}")));
    };
    let expected_mask = rln_channels
        .checked_mul(9)
        .ok_or_else(|| ConfigError::legacy_name(name, format!("rln channels {rln_channels} x 9 overflows")))?;
    if mask_size != expected_mask {
        return Err(ConfigError::legacy_name(
            name,
            format!("mask size {mask_size} != rln channels {rln_channels} x 9"),
        ));
    }
    Ok(LegacyShape { rln_channels, nm_channels, mask_size })
}

// ---------------------------------------------------------------------------
// Packaged format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    version: u32,
    spec: ModelSpec,
    weights_len: u64,
    weights_sha256: String,
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

/// Write `model` to `path` in the packaged format, creating parent
/// directories as needed.
pub fn save_packaged(model: &Anml, path: &Path) -> AnmlResult<()> {
    let mut weights = Vec::new();
    model.var_store().save_to_stream(&mut weights)?;

    let header = Header {
        version: HEADER_VERSION,
        spec: *model.spec(),
        weights_len: weights.len() as u64,
        weights_sha256: sha256_hex(&weights),
    };
    let header_bytes = serde_json::to_vec(&header)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    file.write_all(MAGIC)?;
    file.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
    file.write_all(&header_bytes)?;
    file.write_all(&weights)?;
    file.flush()?;

    debug!(path = %path.display(), bytes = weights.len(), "packaged model written");
    Ok(())
}

/// Read a packaged model onto `device`.
///
/// # Errors
///
/// [`AnmlError::Artifact`] for a wrong magic, a truncated file, or a
/// checksum mismatch.
pub fn load_packaged(path: &Path, device: Device) -> AnmlResult<Anml> {
    let bytes = fs::read(path)?;
    let bad = |msg: &str| AnmlError::artifact(path, msg);

    if bytes.len() < MAGIC.len() + 8 || &bytes[..MAGIC.len()] != MAGIC {
        return Err(bad("missing ANMLNET1 magic"));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[MAGIC.len()..MAGIC.len() + 8]);
    let header_len = u64::from_le_bytes(len_bytes) as usize;
    let header_start = MAGIC.len() + 8;
    let weights_start = header_start
        .checked_add(header_len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| bad("header extends past end of file"))?;

    let header: Header = serde_json::from_slice(&bytes[header_start..weights_start])?;
    if header.version != HEADER_VERSION {
        return Err(AnmlError::artifact(path, format!("unsupported header version {}", header.version)));
    }
    let weights = &bytes[weights_start..];
    if weights.len() as u64 != header.weights_len {
        return Err(AnmlError::artifact(
            path,
            format!("weight block is {} bytes, header says {}", weights.len(), header.weights_len),
        ));
    }
    if sha256_hex(weights) != header.weights_sha256 {
        return Err(bad("weight checksum mismatch"));
    }

    let mut model = Anml::new(header.spec, device)?;
    model.var_store_mut().load_from_stream(Cursor::new(weights))?;
    Ok(model)
}

// ---------------------------------------------------------------------------
// Legacy format
// ---------------------------------------------------------------------------

/// Archive key under which a legacy file stores the parameter this crate
/// calls `name`.
///
/// ```rust
/// use anml_train::artifact::legacy_key;
/// assert_eq!(legacy_key("rln.block1.conv.weight"), "rln.convBlock1.conv.weight");
/// assert_eq!(legacy_key("classifier.bias"), "fc.bias");
/// assert_eq!(legacy_key("nm.fc.weight"), "nm.fc.weight");
/// ```
pub fn legacy_key(name: &str) -> String {
    if let Some(rest) = name.strip_prefix("classifier.") {
        return format!("fc.{rest}");
    }
    name.replace(".block", ".convBlock")
}

/// Read a legacy tensor archive into a freshly built model.
///
/// # Errors
///
/// [`AnmlError::Artifact`] when a parameter is missing from the archive and
/// [`AnmlError::ShapeMismatch`] when a stored tensor has the wrong shape.
pub fn load_legacy(path: &Path, shape: LegacyShape, device: Device) -> AnmlResult<Anml> {
    let model = Anml::new(shape.model_spec(), device)?;
    let mut stored: HashMap<String, Tensor> = Tensor::load_multi_with_device(path, device)?.into_iter().collect();

    for (name, param) in model.parameter_names().iter().zip(model.parameters()) {
        let key = legacy_key(name);
        let value = stored
            .remove(&key)
            .ok_or_else(|| AnmlError::artifact(path, format!("missing tensor `{key}`")))?;
        if value.size() != param.size() {
            return Err(AnmlError::shape_mismatch(format!("legacy tensor `{key}`"), param.size(), value.size()));
        }
        tch::no_grad(|| {
            let mut dst = param.shallow_clone();
            dst.copy_(&value);
        });
    }
    if !stored.is_empty() {
        debug!(unused = ?stored.keys().collect::<Vec<_>>(), "legacy archive has extra tensors");
    }
    Ok(model)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Load a model in either format and check it accepts the sampler's images.
///
/// # Errors
///
/// Besides the format-specific errors, [`AnmlError::ShapeMismatch`] when
/// the model's input shape differs from `sampler_shape`. The check runs
/// before any forward pass.
pub fn load_model(path: &Path, sampler_shape: [i64; 3], device: Device) -> AnmlResult<Anml> {
    let format = ArtifactFormat::from_path(path)?;
    let model = match format {
        ArtifactFormat::Packaged => load_packaged(path, device)?,
        ArtifactFormat::LegacyWeights(shape) => load_legacy(path, shape, device)?,
    };
    info!(path = %path.display(), ?format, "model loaded");
    debug!("model shape:\n{model}");
    model.check_input_shape(sampler_shape)?;
    Ok(model)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn extension_selects_format() {
        assert_eq!(ArtifactFormat::from_path(Path::new("ckpt/ANML-1-28-28.net")).unwrap(), ArtifactFormat::Packaged);
        assert!(matches!(
            ArtifactFormat::from_path(Path::new("256_112_2304_model.pth")).unwrap(),
            ArtifactFormat::LegacyWeights(LegacyShape { rln_channels: 256, nm_channels: 112, mask_size: 2304 })
        ));
    }

    #[test]
    fn unknown_extension_is_config_error() {
        for p in ["model.onnx", "model", "64_32_576_model.PT"] {
            let err = ArtifactFormat::from_path(&PathBuf::from(p)).unwrap_err();
            assert!(matches!(err, ConfigError::UnsupportedModelFile { .. }), "{p}: {err}");
        }
    }

    #[test]
    fn legacy_name_rules() {
        assert!(parse_legacy_name("64_32_576_model.pt").is_ok());
        assert!(parse_legacy_name("64_32_500_model.pt").is_err());
        assert!(parse_legacy_name("64_32_model.pt").is_err());
        assert!(parse_legacy_name("64_32_576_9_model.pt").is_err());
        assert!(parse_legacy_name("a_32_576_model.pt").is_err());
        assert!(parse_legacy_name("model.pt").is_err());
        assert!(matches!(
            parse_legacy_name("2000000000000000000_1_0_model.pt"),
            Err(ConfigError::LegacyModelName { .. })
        ));
    }

    #[test]
    fn legacy_keys_cover_every_parameter() {
        let model = Anml::new(ModelSpec::new([1, 28, 28], 4, 3, 5), Device::Cpu).unwrap();
        let keys: Vec<String> = model.parameter_names().iter().map(|n| legacy_key(n)).collect();
        assert!(keys.contains(&"nm.convBlock3.norm.bias".to_string()));
        assert!(keys.contains(&"fc.weight".to_string()));
        assert!(keys.iter().all(|k| !k.contains(".block")));
    }

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(sha256_hex(b""), "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }
}
