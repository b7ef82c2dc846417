//! Episode samplers for meta-training and meta-testing.
//!
//! A [`Sampler`] hands the training loop one episode at a time:
//!
//! - [`Sampler::sample_train`] returns a single-class task split into
//!   inner-loop batches, plus the meta batch used for the outer loss (the
//!   task's own examples unless `remember_only`, followed by a remember set
//!   drawn from *other* classes).
//! - [`Sampler::sample_test`] returns one few-shot task per novel class and
//!   the held-out examples, grouped class by class.
//!
//! [`EpisodeSampler`] implements the trait over an in-memory [`ClassPool`]
//! that is either generated ([`EpisodeSampler::synthetic`]) or read from a
//! class-per-directory image tree ([`EpisodeSampler::image_folder`]).
//!
//! # Image-folder layout
//!
//! ```text
//! <root>/
//!   images_background/        # or train/ — meta-training classes
//!     Alphabet_of_the_Magi/
//!       character01/*.png     # every directory holding images is a class
//!   images_evaluation/        # or test/  — novel classes for meta-testing
//!     ...
//! ```

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tch::{Device, Tensor};
use tracing::{debug, info};

use crate::config::{DatasetKind, TrainingConfig};
use crate::error::SamplerError;

/// An `(inputs [N, C, H, W], labels [N])` pair.
pub type Batch = (Tensor, Tensor);

// ---------------------------------------------------------------------------
// Requests and episodes
// ---------------------------------------------------------------------------

/// Shape of one meta-training episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainRequest {
    /// Examples per inner-loop batch.
    pub batch_size: usize,
    /// Inner-loop batches in the task.
    pub num_batches: usize,
    /// Examples from other classes appended to the meta batch.
    pub remember_size: usize,
    /// Leave the task's own examples out of the meta batch.
    pub remember_only: bool,
}

impl TrainRequest {
    /// Total examples in the task.
    pub fn train_size(&self) -> usize {
        self.batch_size * self.num_batches
    }
}

/// One meta-training episode.
pub struct TrainEpisode {
    /// Inner-loop batches, all labelled `class_id`.
    pub task: Vec<Batch>,
    /// Class the task belongs to.
    pub class_id: i64,
    /// Examples and labels for the meta-loss.
    pub meta: Batch,
}

/// One meta-test episode.
pub struct TestEpisode {
    /// One task per novel class, each a sequence of batches.
    pub tasks: Vec<Vec<Batch>>,
    /// Held-out examples, `test_examples` per class, in class order.
    pub held_out: Batch,
}

// ---------------------------------------------------------------------------
// Sampler trait
// ---------------------------------------------------------------------------

/// Source of meta-training and meta-test episodes.
pub trait Sampler {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Shape `[C, H, W]` of every image this sampler produces.
    fn input_shape(&self) -> [i64; 3];

    /// Number of distinct meta-training classes (labels are `0..n`).
    fn num_train_classes(&self) -> usize;

    /// Draw a meta-training episode.
    fn sample_train(&mut self, request: &TrainRequest, device: Device) -> Result<TrainEpisode, SamplerError>;

    /// Draw a meta-test episode over `num_classes` novel classes, relabelled
    /// `0..num_classes`.
    fn sample_test(
        &mut self,
        num_classes: usize,
        train_examples: usize,
        test_examples: usize,
        device: Device,
    ) -> Result<TestEpisode, SamplerError>;

    /// Draw `size` never-trained-on examples of meta-training classes, if
    /// this sampler keeps any.
    fn sample_validation(&mut self, _size: usize, _device: Device) -> Result<Option<Batch>, SamplerError> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// ClassPool
// ---------------------------------------------------------------------------

/// Examples of one class, split into trainable and held-out images.
#[derive(Debug, Clone)]
pub struct ClassExamples {
    /// Examples available to episodes.
    pub train: Vec<Array3<f32>>,
    /// Examples reserved for validation.
    pub holdout: Vec<Array3<f32>>,
}

/// In-memory classes of `[C, H, W]` images.
#[derive(Debug, Clone)]
pub struct ClassPool {
    input_shape: [i64; 3],
    classes: Vec<ClassExamples>,
}

impl ClassPool {
    /// Build a pool, checking that every image has `input_shape`.
    pub fn new(input_shape: [i64; 3], classes: Vec<ClassExamples>) -> Result<Self, SamplerError> {
        let expected: Vec<usize> = input_shape.iter().map(|&d| d as usize).collect();
        let bad = classes
            .iter()
            .flat_map(|c| c.train.iter().chain(c.holdout.iter()))
            .find(|img| img.shape() != expected.as_slice());
        if let Some(img) = bad {
            return Err(SamplerError::ShapeMismatch {
                context: "class pool image",
                expected,
                actual: img.shape().to_vec(),
            });
        }
        Ok(ClassPool { input_shape, classes })
    }

    /// Number of classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns `true` when the pool has no classes.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Borrow one class.
    pub fn class(&self, index: usize) -> &ClassExamples {
        &self.classes[index]
    }
}

// ---------------------------------------------------------------------------
// SyntheticConfig
// ---------------------------------------------------------------------------

/// Parameters of the generated dataset.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Image shape `[C, H, W]`.
    pub input_shape: [i64; 3],
    /// Meta-training classes.
    pub num_train_classes: usize,
    /// Meta-test classes.
    pub num_test_classes: usize,
    /// Examples per class.
    pub examples_per_class: usize,
    /// Extra held-out examples per meta-training class.
    pub holdout_per_class: usize,
    /// Amplitude of the per-pixel uniform noise around a class prototype.
    pub noise: f32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        SyntheticConfig {
            input_shape: [1, 28, 28],
            num_train_classes: 64,
            num_test_classes: 20,
            examples_per_class: 20,
            holdout_per_class: 5,
            noise: 0.25,
        }
    }
}

// ---------------------------------------------------------------------------
// EpisodeSampler
// ---------------------------------------------------------------------------

/// [`Sampler`] over a meta-training pool and a meta-test pool.
///
/// All randomness comes from one `StdRng` seeded at construction, so a run is
/// reproducible from its seed.
pub struct EpisodeSampler {
    name: String,
    train: ClassPool,
    test: ClassPool,
    rng: StdRng,
}

impl EpisodeSampler {
    /// Build a sampler from explicit pools.
    pub fn new(name: impl Into<String>, train: ClassPool, test: ClassPool, seed: u64) -> Result<Self, SamplerError> {
        if train.input_shape != test.input_shape {
            return Err(SamplerError::ShapeMismatch {
                context: "test pool",
                expected: train.input_shape.iter().map(|&d| d as usize).collect(),
                actual: test.input_shape.iter().map(|&d| d as usize).collect(),
            });
        }
        if train.is_empty() {
            return Err(SamplerError::not_enough("no meta-training classes"));
        }
        Ok(EpisodeSampler { name: name.into(), train, test, rng: StdRng::seed_from_u64(seed) })
    }

    /// Generated classes: each class is a random prototype image and every
    /// example is that prototype plus bounded uniform noise.
    pub fn synthetic(config: &SyntheticConfig, seed: u64) -> Result<Self, SamplerError> {
        let mut rng = StdRng::seed_from_u64(seed ^ 0x5EED_DA7A);
        let mut make_pool = |n_classes: usize, holdout: usize| {
            let classes = (0..n_classes)
                .map(|_| {
                    let proto = random_image(config.input_shape, &mut rng);
                    let mut noisy = |n: usize| -> Vec<Array3<f32>> {
                        (0..n).map(|_| jitter(&proto, config.noise, &mut rng)).collect()
                    };
                    let train = noisy(config.examples_per_class);
                    let holdout = noisy(holdout);
                    ClassExamples { train, holdout }
                })
                .collect();
            ClassPool::new(config.input_shape, classes)
        };
        let train = make_pool(config.num_train_classes, config.holdout_per_class)?;
        let test = make_pool(config.num_test_classes, 0)?;
        Self::new("synthetic", train, test, seed)
    }

    /// Load a class-per-directory image dataset rooted at `root`.
    ///
    /// Images are resized to `input_shape` and scaled to `[0, 1]`. The last
    /// `holdout_per_class` images of each meta-training class (in file-name
    /// order) are kept back for validation.
    pub fn image_folder(
        root: &Path,
        input_shape: [i64; 3],
        holdout_per_class: usize,
        seed: u64,
    ) -> Result<Self, SamplerError> {
        if !root.is_dir() {
            return Err(SamplerError::DirectoryNotFound { path: root.to_path_buf() });
        }
        let train_dir = first_existing(root, &["images_background", "train"])?;
        let test_dir = first_existing(root, &["images_evaluation", "test"])?;
        let train = load_pool(&train_dir, input_shape, holdout_per_class)?;
        let test = load_pool(&test_dir, input_shape, 0)?;
        info!(
            root = %root.display(),
            train_classes = train.len(),
            test_classes = test.len(),
            "image-folder dataset loaded"
        );
        Self::new(format!("image-folder:{}", root.display()), train, test, seed)
    }

    /// Sampler for a resolved training configuration.
    ///
    /// The synthetic dataset is sized so that every task and remember set
    /// fits: at most `num_classes` training classes and at least
    /// `train_size` examples per class. Image-folder classes keep no holdout,
    /// since a task may use every example of a class.
    pub fn from_config(config: &TrainingConfig) -> Result<Self, SamplerError> {
        match config.dataset {
            DatasetKind::Synthetic => {
                let defaults = SyntheticConfig::default();
                let synthetic = SyntheticConfig {
                    input_shape: config.input_shape(),
                    num_train_classes: defaults.num_train_classes.min(config.num_classes.max(2) as usize),
                    examples_per_class: defaults.examples_per_class.max(config.train_size()),
                    ..defaults
                };
                Self::synthetic(&synthetic, config.seed)
            }
            DatasetKind::ImageFolder => Self::image_folder(&config.data_path, config.input_shape(), 0, config.seed),
        }
    }
}

/// Uniform class in `0..n` other than `exclude`. Requires `n >= 2`.
fn other_class(rng: &mut StdRng, n: usize, exclude: usize) -> usize {
    let k = rng.gen_range(0..n - 1);
    if k >= exclude {
        k + 1
    } else {
        k
    }
}

impl Sampler for EpisodeSampler {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_shape(&self) -> [i64; 3] {
        self.train.input_shape
    }

    fn num_train_classes(&self) -> usize {
        self.train.len()
    }

    fn sample_train(&mut self, request: &TrainRequest, device: Device) -> Result<TrainEpisode, SamplerError> {
        let train_size = request.train_size();
        if train_size == 0 {
            return Err(SamplerError::not_enough("an inner-loop task needs at least one example"));
        }
        if request.remember_size > 0 && self.train.len() < 2 {
            return Err(SamplerError::not_enough("a remember set needs at least two classes"));
        }

        let class_id = self.rng.gen_range(0..self.train.len());
        let available = self.train.class(class_id).train.len();
        if available < train_size {
            return Err(SamplerError::not_enough(format!(
                "class {class_id} has {available} examples, task needs {train_size}"
            )));
        }
        let picks = rand::seq::index::sample(&mut self.rng, available, train_size).into_vec();
        let task_images: Vec<&Array3<f32>> = picks.iter().map(|&i| &self.train.class(class_id).train[i]).collect();

        let task = task_images
            .chunks(request.batch_size)
            .map(|chunk| to_batch(chunk, &vec![class_id as i64; chunk.len()], self.train.input_shape, device))
            .collect();

        let mut remember: Vec<(usize, usize)> = Vec::with_capacity(request.remember_size);
        for _ in 0..request.remember_size {
            let other = other_class(&mut self.rng, self.train.len(), class_id);
            let n = self.train.class(other).train.len();
            if n == 0 {
                return Err(SamplerError::not_enough(format!("class {other} has no examples")));
            }
            remember.push((other, self.rng.gen_range(0..n)));
        }

        let mut meta_images: Vec<&Array3<f32>> = Vec::new();
        let mut meta_labels: Vec<i64> = Vec::new();
        if !request.remember_only {
            meta_images.extend(task_images.iter().copied());
            meta_labels.extend(std::iter::repeat(class_id as i64).take(task_images.len()));
        }
        for &(class, idx) in &remember {
            meta_images.push(&self.train.class(class).train[idx]);
            meta_labels.push(class as i64);
        }
        if meta_images.is_empty() {
            return Err(SamplerError::not_enough("the meta batch is empty"));
        }
        let meta = to_batch(&meta_images, &meta_labels, self.train.input_shape, device);

        debug!(class_id, task_batches = request.num_batches, meta_examples = meta_labels.len(), "sampled train episode");
        Ok(TrainEpisode { task, class_id: class_id as i64, meta })
    }

    fn sample_test(
        &mut self,
        num_classes: usize,
        train_examples: usize,
        test_examples: usize,
        device: Device,
    ) -> Result<TestEpisode, SamplerError> {
        if num_classes > self.test.len() {
            return Err(SamplerError::not_enough(format!(
                "{num_classes} test classes requested, {} available",
                self.test.len()
            )));
        }
        let chosen = rand::seq::index::sample(&mut self.rng, self.test.len(), num_classes).into_vec();
        let shape = self.test.input_shape;

        let mut tasks = Vec::with_capacity(num_classes);
        let mut held_images: Vec<&Array3<f32>> = Vec::with_capacity(num_classes * test_examples);
        let mut held_labels: Vec<i64> = Vec::with_capacity(num_classes * test_examples);
        for (label, &class) in chosen.iter().enumerate() {
            let examples = &self.test.class(class).train;
            let needed = train_examples + test_examples;
            if examples.len() < needed {
                return Err(SamplerError::not_enough(format!(
                    "test class {class} has {} examples, episode needs {needed}",
                    examples.len()
                )));
            }
            let mut order: Vec<usize> = (0..examples.len()).collect();
            order.shuffle(&mut self.rng);
            let label = label as i64;
            tasks.push(
                order[..train_examples]
                    .iter()
                    .map(|&i| to_batch(&[&examples[i]], &[label], shape, device))
                    .collect(),
            );
            for &i in &order[train_examples..needed] {
                held_images.push(&examples[i]);
                held_labels.push(label);
            }
        }
        let held_out = to_batch(&held_images, &held_labels, shape, device);
        Ok(TestEpisode { tasks, held_out })
    }

    fn sample_validation(&mut self, size: usize, device: Device) -> Result<Option<Batch>, SamplerError> {
        let candidates: Vec<(usize, usize)> = (0..self.train.len())
            .flat_map(|c| (0..self.train.class(c).holdout.len()).map(move |i| (c, i)))
            .collect();
        if size == 0 || candidates.is_empty() {
            return Ok(None);
        }
        let picked: Vec<(usize, usize)> = candidates
            .choose_multiple(&mut self.rng, size.min(candidates.len()))
            .copied()
            .collect();
        let images: Vec<&Array3<f32>> = picked.iter().map(|&(c, i)| &self.train.class(c).holdout[i]).collect();
        let labels: Vec<i64> = picked.iter().map(|&(c, _)| c as i64).collect();
        Ok(Some(to_batch(&images, &labels, self.train.input_shape, device)))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Stack host images into an `[N, C, H, W]` float tensor with `[N]` labels.
fn to_batch(images: &[&Array3<f32>], labels: &[i64], shape: [i64; 3], device: Device) -> Batch {
    let mut data = Vec::with_capacity(images.len() * shape.iter().product::<i64>() as usize);
    for img in images {
        data.extend(img.iter().copied());
    }
    let [c, h, w] = shape;
    let x = Tensor::from_slice(&data).reshape([images.len() as i64, c, h, w]).to_device(device);
    let y = Tensor::from_slice(labels).to_device(device);
    (x, y)
}

fn random_image(shape: [i64; 3], rng: &mut StdRng) -> Array3<f32> {
    let [c, h, w] = shape;
    Array3::from_shape_fn((c as usize, h as usize, w as usize), |_| rng.gen::<f32>())
}

fn jitter(proto: &Array3<f32>, noise: f32, rng: &mut StdRng) -> Array3<f32> {
    proto.mapv(|v| (v + (rng.gen::<f32>() * 2.0 - 1.0) * noise).clamp(0.0, 1.0))
}

fn first_existing(root: &Path, names: &[&str]) -> Result<PathBuf, SamplerError> {
    names
        .iter()
        .map(|n| root.join(n))
        .find(|p| p.is_dir())
        .ok_or_else(|| SamplerError::DirectoryNotFound { path: root.join(names[0]) })
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("png" | "jpg" | "jpeg")
    )
}

/// Recursively collect directories that directly contain images, sorted.
fn class_dirs(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), SamplerError> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| SamplerError::io(dir, e))?
        .map(|entry| entry.map(|e| e.path()).map_err(|e| SamplerError::io(dir, e)))
        .collect::<Result<_, _>>()?;
    entries.sort();
    if entries.iter().any(|p| p.is_file() && is_image(p)) {
        out.push(dir.to_path_buf());
    }
    for sub in entries.iter().filter(|p| p.is_dir()) {
        class_dirs(sub, out)?;
    }
    Ok(())
}

fn load_pool(dir: &Path, shape: [i64; 3], holdout_per_class: usize) -> Result<ClassPool, SamplerError> {
    let mut dirs = Vec::new();
    class_dirs(dir, &mut dirs)?;
    let mut classes = Vec::with_capacity(dirs.len());
    for class_dir in &dirs {
        let mut files: Vec<PathBuf> = std::fs::read_dir(class_dir)
            .map_err(|e| SamplerError::io(class_dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        files.sort();
        let mut images = files.iter().map(|f| load_image(f, shape)).collect::<Result<Vec<_>, _>>()?;
        let split = images.len().saturating_sub(holdout_per_class);
        let holdout = images.split_off(split);
        classes.push(ClassExamples { train: images, holdout });
    }
    ClassPool::new(shape, classes)
}

/// Decode, resize to `[C, H, W]`, and scale pixels to `[0, 1]`.
fn load_image(path: &Path, shape: [i64; 3]) -> Result<Array3<f32>, SamplerError> {
    let [c, h, w] = shape;
    let decode_err = |message: String| SamplerError::ImageDecode { path: path.to_path_buf(), message };
    let img = image::open(path)
        .map_err(|e| decode_err(e.to_string()))?
        .resize_exact(w as u32, h as u32, image::imageops::FilterType::Triangle);
    let (raw, channels) = match c {
        1 => (img.to_luma8().into_raw(), 1),
        3 => (img.to_rgb8().into_raw(), 3),
        other => return Err(decode_err(format!("unsupported channel count {other}"))),
    };
    let hwc = Array3::from_shape_vec((h as usize, w as usize, channels), raw.into_iter().map(|p| p as f32 / 255.0).collect())
        .map_err(|e| decode_err(e.to_string()))?;
    Ok(hwc.permuted_axes([2, 0, 1]).as_standard_layout().into_owned())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
