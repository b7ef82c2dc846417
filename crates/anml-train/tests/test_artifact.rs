//! Integration tests for [`anml_train::artifact`]: packaged and legacy model
//! files.

use anml_train::artifact::{legacy_key, load_model, parse_legacy_name, save_packaged, ArtifactFormat, MAGIC};
use anml_train::model::{Anml, ModelSpec};
use anml_train::{AnmlError, ConfigError};
use std::path::Path;
use tch::{Device, Kind, Tensor};

fn probe() -> Tensor {
    tch::manual_seed(11);
    Tensor::rand([3, 1, 28, 28], (Kind::Float, Device::Cpu))
}

// ---------------------------------------------------------------------------
// Format detection
// ---------------------------------------------------------------------------

#[test]
fn legacy_name_with_consistent_mask_parses() {
    let shape = parse_legacy_name("64_32_576_model.pt").unwrap();
    assert_eq!((shape.rln_channels, shape.nm_channels, shape.mask_size), (64, 32, 576));
    let spec = shape.model_spec();
    assert_eq!(spec.input_shape, [1, 28, 28]);
    assert_eq!(spec.num_classes, 1000);
}

#[test]
fn legacy_name_with_wrong_mask_is_config_error() {
    let err = ArtifactFormat::from_path(Path::new("models/64_32_500_model.pt")).unwrap_err();
    assert!(matches!(err, ConfigError::LegacyModelName { .. }), "{err}");

    // Reported through `load_model` as a configuration error, before any I/O.
    let err = load_model(Path::new("does/not/exist/64_32_500_model.pt"), [1, 28, 28], Device::Cpu)
        .err()
        .expect("must fail");
    assert!(matches!(err, AnmlError::Config(ConfigError::LegacyModelName { .. })), "{err}");
}

#[test]
fn unsupported_extension_is_config_error() {
    let err = load_model(Path::new("model.ckpt"), [1, 28, 28], Device::Cpu).err().expect("must fail");
    assert!(matches!(err, AnmlError::Config(ConfigError::UnsupportedModelFile { .. })), "{err}");
}

// ---------------------------------------------------------------------------
// Packaged format
// ---------------------------------------------------------------------------

#[test]
fn packaged_round_trip_reproduces_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("ANML-1-28-28-final.net");
    let model = Anml::new(ModelSpec::new([1, 28, 28], 6, 4, 7), Device::Cpu).unwrap();
    save_packaged(&model, &path).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..8], MAGIC);

    let loaded = load_model(&path, [1, 28, 28], Device::Cpu).unwrap();
    assert_eq!(loaded.spec(), model.spec());
    let x = probe();
    assert!(loaded.forward_inference(&x).allclose(&model.forward_inference(&x), 1e-6, 1e-6, false));
}

/// A model trained on 28x28 greyscale refuses a 32x32 RGB dataset.
#[test]
fn loading_for_a_different_image_shape_is_shape_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m.net");
    let model = Anml::new(ModelSpec::new([1, 28, 28], 6, 4, 7), Device::Cpu).unwrap();
    save_packaged(&model, &path).unwrap();

    let err = load_model(&path, [3, 32, 32], Device::Cpu).err().expect("must fail");
    match err {
        AnmlError::ShapeMismatch { expected, actual, .. } => {
            assert_eq!(expected, vec![1, 28, 28]);
            assert_eq!(actual, vec![3, 32, 32]);
        }
        other => panic!("expected ShapeMismatch, got {other}"),
    }
}

#[test]
fn corrupted_weights_fail_the_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m.net");
    let model = Anml::new(ModelSpec::new([1, 28, 28], 6, 4, 7), Device::Cpu).unwrap();
    save_packaged(&model, &path).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let err = load_model(&path, [1, 28, 28], Device::Cpu).err().expect("must fail");
    assert!(matches!(err, AnmlError::Artifact { .. }), "{err}");
}

#[test]
fn wrong_magic_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m.net");
    std::fs::write(&path, b"NOTANMODELFILE--------").unwrap();
    let err = load_model(&path, [1, 28, 28], Device::Cpu).err().expect("must fail");
    assert!(matches!(err, AnmlError::Artifact { .. }), "{err}");
}

// ---------------------------------------------------------------------------
// Legacy format
// ---------------------------------------------------------------------------

/// A tensor archive keyed by the old parameter names loads into an
/// equivalent model.
#[test]
fn legacy_archive_loads_under_renamed_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("4_3_36_model.pt");
    let source = Anml::new(ModelSpec::new([1, 28, 28], 4, 3, 1000), Device::Cpu).unwrap();

    let keys: Vec<String> = source.parameter_names().iter().map(|n| legacy_key(n)).collect();
    let named: Vec<(&str, Tensor)> =
        keys.iter().zip(source.parameters()).map(|(k, t)| (k.as_str(), t.detach())).collect();
    Tensor::save_multi(&named, &path).unwrap();

    let loaded = load_model(&path, [1, 28, 28], Device::Cpu).unwrap();
    let x = probe();
    assert!(loaded.forward_inference(&x).allclose(&source.forward_inference(&x), 1e-6, 1e-6, false));
}

#[test]
fn legacy_archive_missing_a_tensor_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("4_3_36_model.pt");
    let only = Tensor::zeros([1000], (Kind::Float, Device::Cpu));
    Tensor::save_multi(&[("fc.bias", &only)], &path).unwrap();

    let err = load_model(&path, [1, 28, 28], Device::Cpu).err().expect("must fail");
    assert!(matches!(err, AnmlError::Artifact { .. }), "{err}");
}
