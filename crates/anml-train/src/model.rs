//! ANML network: a representation network gated by a neuromodulator.
//!
//! # Architecture
//!
//! ```text
//!            x : [B, C, H, W]
//!          ┌──────┴───────┐
//!          ▼              ▼
//!   ┌─────────────┐ ┌─────────────┐
//!   │ RLN         │ │ NM          │   3 × ConvEncoderBlock each
//!   │ conv stage  │ │ conv stage  │   (pool, pool, no pool)
//!   └─────────────┘ └─────────────┘
//!          │              │ flatten
//!          │ flatten      ▼
//!          │        Linear → sigmoid
//!          ▼              ▼
//!     features [B,F] ⊙ gate [B,F]
//!                 │
//!                 ▼
//!        Classifier Linear(F → classes)
//! ```
//!
//! Every forward pass is written as a pure function of a parameter slice, so
//! the same code runs on the persistent parameters owned by the `VarStore`
//! and on the functional [`FastWeights`] produced by the inner loop.
//!
//! Parameter names in the `VarStore` follow `"{rln|nm}.block{i}.{conv|norm}.{weight|bias}"`,
//! `"nm.fc.{weight|bias}"` and `"classifier.{weight|bias}"`.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tch::{nn, nn::Init, Device, Kind, Tensor};
use tracing::debug;

use crate::error::{AnmlError, AnmlResult, ConfigError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Number of convolutional encoder blocks in both the RLN and the NM.
pub const NUM_CONV_BLOCKS: usize = 3;

/// Whether each encoder block ends with a 2×2 max-pool.
pub const BLOCK_POOLING: [bool; NUM_CONV_BLOCKS] = [true, true, false];

/// Convolution kernel side length.
pub const KERNEL_SIZE: i64 = 3;

/// Smallest square input side that survives the conv stage.
pub const MIN_INPUT_SIDE: i64 = 18;

const TENSORS_PER_BLOCK: usize = 4;
const INSTANCE_NORM_EPS: f64 = 1e-5;
const PROBE_BATCH: i64 = 2;

// ---------------------------------------------------------------------------
// Parameter layout
// ---------------------------------------------------------------------------

/// Fixed positions of every learnable tensor in a parameter list.
///
/// Each conv block contributes `[conv.weight, conv.bias, norm.weight, norm.bias]`.
pub struct ParamLayout;

impl ParamLayout {
    /// RLN conv blocks.
    pub const RLN: Range<usize> = 0..12;
    /// NM conv blocks.
    pub const NM_CONV: Range<usize> = 12..24;
    /// NM linear projection `[weight, bias]`.
    pub const NM_FC: Range<usize> = 24..26;
    /// Classifier head `[weight, bias]`.
    pub const CLASSIFIER: Range<usize> = 26..28;
    /// Index of the classifier weight matrix `[classes, F]`.
    pub const CLASSIFIER_WEIGHT: usize = 26;
    /// Index of the classifier bias `[classes]`.
    pub const CLASSIFIER_BIAS: usize = 27;
    /// Total number of tensors.
    pub const LEN: usize = 28;

    /// Indices updated by the differentiable inner loop (RLN + classifier).
    pub fn inner_loop_indices() -> Vec<usize> {
        Self::RLN.chain(Self::CLASSIFIER).collect()
    }

    /// Indices of the feature extractor (RLN + NM), frozen at meta-test time.
    pub fn feature_extractor_indices() -> Range<usize> {
        Self::RLN.start..Self::NM_FC.end
    }
}

// ---------------------------------------------------------------------------
// ModelSpec
// ---------------------------------------------------------------------------

/// Architecture metadata fixed at construction time.
///
/// Stored alongside the weights in packaged artifacts so a loaded model can
/// be checked against the dataset it is about to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Input image shape `[channels, height, width]`.
    pub input_shape: [i64; 3],
    /// Channel width of every RLN conv block.
    pub rln_channels: i64,
    /// Channel width of every NM conv block.
    pub nm_channels: i64,
    /// Number of classifier outputs.
    pub num_classes: i64,
}

impl ModelSpec {
    /// Create a spec.
    pub fn new(input_shape: [i64; 3], rln_channels: i64, nm_channels: i64, num_classes: i64) -> Self {
        ModelSpec { input_shape, rln_channels, nm_channels, num_classes }
    }

    /// Check that every dimension is strictly positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_shape.iter().any(|&d| d <= 0) {
            return Err(ConfigError::invalid_value(
                "input_shape",
                format!("all dimensions must be > 0, got {:?}", self.input_shape),
            ));
        }
        if self.rln_channels <= 0 {
            return Err(ConfigError::invalid_value("rln_channels", "must be > 0"));
        }
        if self.nm_channels <= 0 {
            return Err(ConfigError::invalid_value("nm_channels", "must be > 0"));
        }
        if self.num_classes <= 0 {
            return Err(ConfigError::invalid_value("num_classes", "must be > 0"));
        }
        Ok(())
    }

    /// Spatial side lengths `(h, w)` after the three conv blocks, or `None`
    /// when the input is too small to survive them.
    pub fn conv_output_hw(&self) -> Option<(i64, i64)> {
        let side = |mut s: i64| {
            for &pool in &BLOCK_POOLING {
                s -= KERNEL_SIZE - 1;
                if pool {
                    s /= 2;
                }
                if s < 1 {
                    return None;
                }
            }
            Some(s)
        };
        Some((side(self.input_shape[1])?, side(self.input_shape[2])?))
    }
}

// ---------------------------------------------------------------------------
// FastWeights
// ---------------------------------------------------------------------------

/// A complete parameter snapshot in [`ParamLayout`] order.
///
/// The snapshot taken from a model shares storage and autograd identity with
/// the persistent parameters, so a loss computed from any snapshot derived
/// from it can be differentiated back to the model.
pub struct FastWeights {
    tensors: Vec<Tensor>,
}

impl FastWeights {
    /// Wrap a parameter list.
    ///
    /// # Errors
    ///
    /// Returns [`AnmlError::ShapeMismatch`] if the list does not have exactly
    /// [`ParamLayout::LEN`] entries.
    pub fn new(tensors: Vec<Tensor>) -> AnmlResult<Self> {
        if tensors.len() != ParamLayout::LEN {
            return Err(AnmlError::shape_mismatch(
                "parameter list length",
                vec![ParamLayout::LEN as i64],
                vec![tensors.len() as i64],
            ));
        }
        Ok(FastWeights { tensors })
    }

    /// Borrow the tensors.
    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    /// Borrow one tensor.
    pub fn get(&self, index: usize) -> &Tensor {
        &self.tensors[index]
    }

    /// Replace one tensor, returning the previous value.
    pub fn replace(&mut self, index: usize, tensor: Tensor) -> Tensor {
        std::mem::replace(&mut self.tensors[index], tensor)
    }
}

// ---------------------------------------------------------------------------
// Anml
// ---------------------------------------------------------------------------

/// The composed ANML model: `classifier(RLN(x) ⊙ NM(x))`.
pub struct Anml {
    vs: nn::VarStore,
    spec: ModelSpec,
    feature_size: i64,
    nm_conv_features: i64,
    params: Vec<Tensor>,
    names: Vec<String>,
}

impl Anml {
    /// Build a freshly initialised model on `device`.
    ///
    /// The feature size `F` is derived by probing the RLN with a zero batch
    /// of the configured input shape; the NM projection and the classifier
    /// are then sized from it.
    ///
    /// # Errors
    ///
    /// - [`AnmlError::Config`] when a dimension in `spec` is not positive.
    /// - [`AnmlError::ShapeMismatch`] when the input is too small for three
    ///   valid convolutions, or a probe does not return `[batch, features]`.
    pub fn new(spec: ModelSpec, device: Device) -> AnmlResult<Self> {
        spec.validate()?;
        if spec.conv_output_hw().is_none() {
            return Err(AnmlError::shape_mismatch(
                "input too small for the conv stage",
                vec![spec.input_shape[0], MIN_INPUT_SIDE, MIN_INPUT_SIDE],
                spec.input_shape.to_vec(),
            ));
        }

        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let mut params = Vec::with_capacity(ParamLayout::LEN);
        let mut names = Vec::with_capacity(ParamLayout::LEN);
        let in_ch = spec.input_shape[0];

        add_conv_stage(&root, "rln", in_ch, spec.rln_channels, &mut params, &mut names);
        let feature_size = probe_features(&params[ParamLayout::RLN], &spec, device, "RLN probe")?;

        add_conv_stage(&root, "nm", in_ch, spec.nm_channels, &mut params, &mut names);
        let nm_conv_features =
            probe_features(&params[ParamLayout::NM_CONV], &spec, device, "NM probe")?;
        add_linear(&root.sub("nm").sub("fc"), "nm.fc", nm_conv_features, feature_size, &mut params, &mut names);

        add_linear(&root.sub("classifier"), "classifier", feature_size, spec.num_classes, &mut params, &mut names);

        let model = Anml { vs, spec, feature_size, nm_conv_features, params, names };

        let gate_dims = tch::no_grad(|| model.gate(&model.probe_batch()).size());
        if gate_dims != [PROBE_BATCH, feature_size] {
            return Err(AnmlError::shape_mismatch(
                "NM output vs RLN output",
                vec![PROBE_BATCH, feature_size],
                gate_dims,
            ));
        }

        debug!(
            feature_size,
            nm_conv_features,
            num_parameters = model.num_parameters(),
            "ANML model constructed"
        );
        Ok(model)
    }

    /// Architecture metadata.
    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// Input shape `[C, H, W]` this model was built for.
    pub fn input_shape(&self) -> [i64; 3] {
        self.spec.input_shape
    }

    /// Dimensionality `F` of the feature and gate vectors.
    pub fn feature_size(&self) -> i64 {
        self.feature_size
    }

    /// Number of classifier outputs.
    pub fn num_classes(&self) -> i64 {
        self.spec.num_classes
    }

    /// Device holding the parameters.
    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Persistent parameters in [`ParamLayout`] order.
    pub fn parameters(&self) -> &[Tensor] {
        &self.params
    }

    /// `VarStore` names in [`ParamLayout`] order.
    pub fn parameter_names(&self) -> &[String] {
        &self.names
    }

    /// Count all learnable scalars.
    pub fn num_parameters(&self) -> usize {
        self.params.iter().map(|t| t.numel()).sum()
    }

    /// Access the internal `VarStore` (e.g. to build an optimizer).
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Mutable access to the internal `VarStore` (e.g. to load weights).
    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    /// Snapshot 0 of an inner-loop trajectory: the persistent tensors
    /// themselves, shallow-cloned.
    pub fn snapshot(&self) -> FastWeights {
        FastWeights { tensors: self.params.iter().map(|t| t.shallow_clone()).collect() }
    }

    /// Forward pass on the persistent parameters, tracking gradients.
    pub fn forward(&self, x: &Tensor) -> Tensor {
        forward_params(&self.params, x)
    }

    /// Forward pass on an arbitrary parameter snapshot.
    pub fn forward_with(&self, weights: &FastWeights, x: &Tensor) -> Tensor {
        forward_params(weights.tensors(), x)
    }

    /// Forward pass without gradient tracking.
    pub fn forward_inference(&self, x: &Tensor) -> Tensor {
        tch::no_grad(|| self.forward(x))
    }

    /// RLN feature vectors `[B, F]`.
    pub fn features(&self, x: &Tensor) -> Tensor {
        conv_stage(x, &self.params[ParamLayout::RLN])
    }

    /// NM gate vectors `[B, F]`, values in `[0, 1]`.
    pub fn gate(&self, x: &Tensor) -> Tensor {
        gate_params(&self.params, x)
    }

    /// Re-initialise classifier row `class_index` so the class must be
    /// re-learned from features.
    ///
    /// Only that row changes; every other row and the bias keep their exact
    /// values.
    ///
    /// # Errors
    ///
    /// Returns [`AnmlError::InvalidClass`] if `class_index` is not a valid row.
    pub fn lobotomize(&mut self, class_index: i64) -> AnmlResult<()> {
        let num_classes = self.spec.num_classes;
        if !(0..num_classes).contains(&class_index) {
            return Err(AnmlError::InvalidClass { index: class_index, num_classes });
        }
        let weight = &self.params[ParamLayout::CLASSIFIER_WEIGHT];
        let fresh = kaiming_normal(&[self.feature_size], self.feature_size, weight.device());
        tch::no_grad(|| {
            let mut row = weight.get(class_index);
            row.copy_(&fresh);
        });
        Ok(())
    }

    /// Re-initialise the whole classifier weight matrix (bias untouched).
    pub fn reset_classifier(&mut self) {
        let weight = &self.params[ParamLayout::CLASSIFIER_WEIGHT];
        let fresh = kaiming_normal(&weight.size(), self.feature_size, weight.device());
        tch::no_grad(|| {
            let mut w = weight.shallow_clone();
            w.copy_(&fresh);
        });
    }

    /// Stop gradient tracking for the RLN and NM parameters.
    pub fn freeze_feature_extractor(&mut self) {
        for t in &self.params[ParamLayout::feature_extractor_indices()] {
            let _ = t.set_requires_grad(false);
        }
    }

    /// Fail unless `shape` equals the input shape this model was built for.
    ///
    /// # Errors
    ///
    /// Returns [`AnmlError::ShapeMismatch`] on any difference.
    pub fn check_input_shape(&self, shape: [i64; 3]) -> AnmlResult<()> {
        if shape != self.spec.input_shape {
            return Err(AnmlError::shape_mismatch(
                "dataset image size differs from the size this model was trained for",
                self.spec.input_shape.to_vec(),
                shape.to_vec(),
            ));
        }
        Ok(())
    }

    fn probe_batch(&self) -> Tensor {
        let [c, h, w] = self.spec.input_shape;
        Tensor::zeros([PROBE_BATCH, c, h, w], (Kind::Float, self.device()))
    }
}

impl fmt::Display for Anml {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [c, h, w] = self.spec.input_shape;
        writeln!(f, "ANML(input=[{c}, {h}, {w}], classes={})", self.spec.num_classes)?;
        writeln!(f, "  rln: 3 × ConvEncoderBlock({} ch) -> {} features", self.spec.rln_channels, self.feature_size)?;
        writeln!(
            f,
            "  nm:  3 × ConvEncoderBlock({} ch) -> Linear({} -> {}) -> sigmoid",
            self.spec.nm_channels, self.nm_conv_features, self.feature_size
        )?;
        write!(f, "  classifier: Linear({} -> {})", self.feature_size, self.spec.num_classes)
    }
}

// ---------------------------------------------------------------------------
// Functional forward
// ---------------------------------------------------------------------------

fn forward_params(params: &[Tensor], x: &Tensor) -> Tensor {
    let features = conv_stage(x, &params[ParamLayout::RLN]);
    let gate = gate_params(params, x);
    let w = &params[ParamLayout::CLASSIFIER_WEIGHT];
    let b = &params[ParamLayout::CLASSIFIER_BIAS];
    (features * gate).linear(w, Some(b))
}

fn gate_params(params: &[Tensor], x: &Tensor) -> Tensor {
    let fc = &params[ParamLayout::NM_FC];
    conv_stage(x, &params[ParamLayout::NM_CONV]).linear(&fc[0], Some(&fc[1])).sigmoid()
}

/// Three encoder blocks followed by a flatten to `[B, features]`.
fn conv_stage(x: &Tensor, params: &[Tensor]) -> Tensor {
    let mut h = x.shallow_clone();
    for (block, &pool) in params.chunks(TENSORS_PER_BLOCK).zip(BLOCK_POOLING.iter()) {
        h = conv_block(&h, block, pool);
    }
    h.flatten(1, -1)
}

/// conv 3×3 (valid) → instance norm → ReLU → optional 2×2 max-pool.
fn conv_block(x: &Tensor, p: &[Tensor], pool: bool) -> Tensor {
    let h = x.conv2d(&p[0], Some(&p[1]), [1, 1], [0, 0], [1, 1], 1);
    let h = instance_norm(&h, &p[2], &p[3]).relu();
    if pool {
        h.max_pool2d([2, 2], [2, 2], [0, 0], [1, 1], false)
    } else {
        h
    }
}

/// Per-sample, per-channel normalisation over H×W with a learned affine.
///
/// Written with elementary ops so it stays twice differentiable.
fn instance_norm(x: &Tensor, weight: &Tensor, bias: &Tensor) -> Tensor {
    let mean = x.mean_dim(&[2_i64, 3_i64][..], true, Kind::Float);
    let centered = x - &mean;
    let var = centered.square().mean_dim(&[2_i64, 3_i64][..], true, Kind::Float);
    let normed = centered / (var + INSTANCE_NORM_EPS).sqrt();
    normed * weight.view([1, -1, 1, 1]) + bias.view([1, -1, 1, 1])
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

fn add_conv_stage(
    root: &nn::Path,
    prefix: &str,
    in_channels: i64,
    channels: i64,
    params: &mut Vec<Tensor>,
    names: &mut Vec<String>,
) {
    let stage = root.sub(prefix);
    let mut c_in = in_channels;
    for i in 1..=NUM_CONV_BLOCKS {
        let block = stage.sub(format!("block{i}"));
        let conv = block.sub("conv");
        let fan_in = c_in * KERNEL_SIZE * KERNEL_SIZE;
        params.push(conv.var("weight", &[channels, c_in, KERNEL_SIZE, KERNEL_SIZE], nn::init::DEFAULT_KAIMING_UNIFORM));
        params.push(conv.var("bias", &[channels], bias_init(fan_in)));
        let norm = block.sub("norm");
        params.push(norm.ones("weight", &[channels]));
        params.push(norm.zeros("bias", &[channels]));
        for leaf in ["conv.weight", "conv.bias", "norm.weight", "norm.bias"] {
            names.push(format!("{prefix}.block{i}.{leaf}"));
        }
        c_in = channels;
    }
}

fn add_linear(
    path: &nn::Path,
    prefix: &str,
    in_dim: i64,
    out_dim: i64,
    params: &mut Vec<Tensor>,
    names: &mut Vec<String>,
) {
    params.push(path.var("weight", &[out_dim, in_dim], nn::init::DEFAULT_KAIMING_UNIFORM));
    params.push(path.var("bias", &[out_dim], bias_init(in_dim)));
    names.push(format!("{prefix}.weight"));
    names.push(format!("{prefix}.bias"));
}

/// PyTorch's default bias init: `U(-1/√fan_in, 1/√fan_in)`.
fn bias_init(fan_in: i64) -> Init {
    let bound = 1.0 / (fan_in as f64).sqrt();
    Init::Uniform { lo: -bound, up: bound }
}

/// Kaiming-normal values (ReLU gain): `N(0, 2 / fan_in)`.
fn kaiming_normal(dims: &[i64], fan_in: i64, device: Device) -> Tensor {
    let std = (2.0 / fan_in as f64).sqrt();
    tch::no_grad(|| Tensor::randn(dims, (Kind::Float, device)) * std)
}

fn probe_features(stage: &[Tensor], spec: &ModelSpec, device: Device, context: &str) -> AnmlResult<i64> {
    let [c, h, w] = spec.input_shape;
    let dims = tch::no_grad(|| {
        let probe = Tensor::zeros([PROBE_BATCH, c, h, w], (Kind::Float, device));
        conv_stage(&probe, stage).size()
    });
    match dims.as_slice() {
        [_, features] => Ok(*features),
        _ => Err(AnmlError::shape_mismatch(context, vec![PROBE_BATCH, -1], dims)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn small_spec() -> ModelSpec {
        ModelSpec::new([1, 28, 28], 8, 4, 5)
    }

    #[test]
    fn conv_output_hw_matches_legacy_geometry() {
        // 28 -> 26 -> 13 -> 11 -> 5 -> 3
        assert_eq!(small_spec().conv_output_hw(), Some((3, 3)));
    }

    #[test]
    fn conv_output_hw_rejects_tiny_inputs() {
        let spec = ModelSpec::new([1, 8, 8], 8, 4, 5);
        assert_eq!(spec.conv_output_hw(), None);
    }

    #[test]
    fn feature_size_is_channels_times_spatial() {
        tch::manual_seed(0);
        let model = Anml::new(small_spec(), Device::Cpu).unwrap();
        assert_eq!(model.feature_size(), 8 * 9);
    }

    #[test]
    fn parameter_layout_is_complete() {
        let model = Anml::new(small_spec(), Device::Cpu).unwrap();
        assert_eq!(model.parameters().len(), ParamLayout::LEN);
        assert_eq!(model.parameter_names().len(), ParamLayout::LEN);
        assert_eq!(model.parameter_names()[ParamLayout::CLASSIFIER_WEIGHT], "classifier.weight");
        assert_eq!(model.parameters()[ParamLayout::CLASSIFIER_WEIGHT].size(), vec![5, 72]);
        assert_eq!(model.parameters()[ParamLayout::NM_FC.start].size(), vec![72, 4 * 9]);
    }

    #[test]
    fn var_store_names_match_layout() {
        let model = Anml::new(small_spec(), Device::Cpu).unwrap();
        let vars = model.var_store().variables();
        for name in model.parameter_names() {
            assert!(vars.contains_key(name), "missing var {name}");
        }
        assert_eq!(vars.len(), ParamLayout::LEN);
    }

    #[test]
    fn too_small_input_is_shape_error() {
        let spec = ModelSpec::new([1, 10, 10], 8, 4, 5);
        let err = Anml::new(spec, Device::Cpu).err().expect("should fail");
        assert!(matches!(err, AnmlError::ShapeMismatch { .. }));
    }

    #[test]
    fn zero_channels_is_config_error() {
        let spec = ModelSpec::new([1, 28, 28], 0, 4, 5);
        let err = Anml::new(spec, Device::Cpu).err().expect("should fail");
        assert!(matches!(err, AnmlError::Config(_)));
    }

    #[test]
    fn instance_norm_normalises_each_channel() {
        let x = Tensor::arange(96_i64, (Kind::Float, Device::Cpu)).reshape([2, 3, 4, 4]);
        let w = Tensor::ones([3], (Kind::Float, Device::Cpu));
        let b = Tensor::zeros([3], (Kind::Float, Device::Cpu));
        let y = instance_norm(&x, &w, &b);
        let means = y.mean_dim(&[2_i64, 3_i64][..], false, Kind::Float);
        let max_abs_mean = means.abs().max().double_value(&[]);
        assert!(max_abs_mean < 1e-5, "channel means should be ~0, got {max_abs_mean}");
    }

    #[test]
    fn lobotomize_rejects_out_of_range_class() {
        let mut model = Anml::new(small_spec(), Device::Cpu).unwrap();
        assert!(matches!(model.lobotomize(5), Err(AnmlError::InvalidClass { .. })));
        assert!(matches!(model.lobotomize(-1), Err(AnmlError::InvalidClass { .. })));
    }

    #[test]
    fn freeze_feature_extractor_keeps_classifier_trainable() {
        let mut model = Anml::new(small_spec(), Device::Cpu).unwrap();
        model.freeze_feature_extractor();
        for t in &model.parameters()[ParamLayout::feature_extractor_indices()] {
            assert!(!t.requires_grad());
        }
        for t in &model.parameters()[ParamLayout::CLASSIFIER] {
            assert!(t.requires_grad());
        }
    }

    #[test]
    fn fast_weights_rejects_wrong_length() {
        assert!(FastWeights::new(Vec::new()).is_err());
    }
}
