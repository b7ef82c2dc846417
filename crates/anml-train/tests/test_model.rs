//! Integration tests for [`anml_train::model`].
//!
//! All models here are small (a handful of channels) so the suite runs on a
//! CPU in seconds.

use anml_train::model::{Anml, ModelSpec, ParamLayout};
use anml_train::AnmlError;
use tch::{Device, Kind, Tensor};

fn build(shape: [i64; 3], rln: i64, nm: i64, classes: i64) -> Anml {
    Anml::new(ModelSpec::new(shape, rln, nm, classes), Device::Cpu).expect("valid spec")
}

fn batch(b: i64, shape: [i64; 3]) -> Tensor {
    let [c, h, w] = shape;
    Tensor::rand([b, c, h, w], (Kind::Float, Device::Cpu))
}

// ---------------------------------------------------------------------------
// Shapes
// ---------------------------------------------------------------------------

/// 28x28 greyscale, RLN 64, NM 32, 10 classes, batch of 2 gives `[2, 10]` logits.
#[test]
fn omniglot_sized_forward_gives_one_logit_per_class() {
    let model = build([1, 28, 28], 64, 32, 10);
    let logits = model.forward(&batch(2, [1, 28, 28]));
    assert_eq!(logits.size(), vec![2, 10]);
}

/// RLN features and NM gates agree on `F` across shapes and batch sizes.
#[test]
fn feature_and_gate_widths_match() {
    for (shape, rln, nm) in [([1, 28, 28], 8, 4), ([3, 32, 32], 6, 5), ([1, 18, 18], 4, 4), ([3, 40, 24], 5, 3)] {
        let model = build(shape, rln, nm, 7);
        for b in [1, 3] {
            let x = batch(b, shape);
            let f = model.features(&x);
            let g = model.gate(&x);
            assert_eq!(f.size(), vec![b, model.feature_size()], "{shape:?} b={b}");
            assert_eq!(g.size(), f.size(), "{shape:?} b={b}");
        }
    }
}

/// The gate is a sigmoid, so it stays in `[0, 1]` even for extreme inputs.
#[test]
fn gate_is_bounded() {
    let model = build([1, 28, 28], 8, 4, 5);
    let x = batch(4, [1, 28, 28]) * 1000.0 - 500.0;
    let g = model.gate(&x);
    assert!(g.min().double_value(&[]) >= 0.0);
    assert!(g.max().double_value(&[]) <= 1.0);
}

/// Forward has no side effects: two calls give identical logits.
#[test]
fn forward_is_pure() {
    let model = build([1, 28, 28], 8, 4, 5);
    let x = batch(2, [1, 28, 28]);
    assert!(model.forward_inference(&x).equal(&model.forward_inference(&x)));
}

/// `forward_with` on the model's own snapshot reproduces `forward`.
#[test]
fn snapshot_forward_matches_forward() {
    let model = build([1, 28, 28], 8, 4, 5);
    let x = batch(2, [1, 28, 28]);
    let snap = model.snapshot();
    assert!(model.forward(&x).allclose(&model.forward_with(&snap, &x), 1e-6, 1e-6, false));
}

// ---------------------------------------------------------------------------
// Lobotomize
// ---------------------------------------------------------------------------

/// Only the selected classifier row changes; other rows and the bias are
/// bit-identical.
#[test]
fn lobotomize_rewrites_only_one_row() {
    let mut model = build([1, 28, 28], 8, 4, 6);
    let w_before = model.parameters()[ParamLayout::CLASSIFIER_WEIGHT].copy();
    let b_before = model.parameters()[ParamLayout::CLASSIFIER_BIAS].copy();

    model.lobotomize(3).unwrap();

    let w_after = &model.parameters()[ParamLayout::CLASSIFIER_WEIGHT];
    for row in 0..6 {
        let same = w_after.get(row).equal(&w_before.get(row));
        assert_eq!(same, row != 3, "row {row}");
    }
    assert!(model.parameters()[ParamLayout::CLASSIFIER_BIAS].equal(&b_before));
}

/// A fresh row is drawn with std sqrt(2 / F).
#[test]
fn lobotomize_uses_kaiming_scale() {
    let mut model = build([1, 28, 28], 64, 8, 3);
    model.lobotomize(0).unwrap();
    let row = model.parameters()[ParamLayout::CLASSIFIER_WEIGHT].get(0);
    let expected = (2.0 / model.feature_size() as f64).sqrt();
    let std = row.std(true).double_value(&[]);
    assert!((std - expected).abs() < expected * 0.25, "std {std} vs {expected}");
}

#[test]
fn lobotomize_rejects_out_of_range_class() {
    let mut model = build([1, 28, 28], 8, 4, 6);
    for bad in [-1, 6, 100] {
        assert!(matches!(model.lobotomize(bad), Err(AnmlError::InvalidClass { num_classes: 6, .. })));
    }
}

// ---------------------------------------------------------------------------
// Construction errors
// ---------------------------------------------------------------------------

#[test]
fn input_too_small_is_shape_mismatch() {
    let err = Anml::new(ModelSpec::new([1, 10, 10], 8, 4, 5), Device::Cpu).err().expect("must fail");
    assert!(matches!(err, AnmlError::ShapeMismatch { .. }), "{err}");
}

#[test]
fn mismatched_sampler_shape_is_rejected() {
    let model = build([1, 28, 28], 8, 4, 5);
    assert!(model.check_input_shape([1, 28, 28]).is_ok());
    assert!(matches!(model.check_input_shape([3, 32, 32]), Err(AnmlError::ShapeMismatch { .. })));
}
