//! Meta-training: the differentiable inner loop and the outer Adam update.
//!
//! One outer iteration runs
//!
//! ```text
//! sample episode ─► lobotomize(class) ─► adapt(task) ─► meta-loss ─► Adam step ─► log
//! ```
//!
//! The inner loop is plain SGD written as tensor arithmetic on a
//! [`FastWeights`] snapshot, with gradients taken under `create_graph`, so
//! the meta-loss is differentiable through every inner step back to the
//! persistent parameters. Only the RLN and classifier are adapted in the
//! inner loop; the neuromodulator learns purely from the meta-gradient.

use std::path::PathBuf;
use tch::{nn, nn::OptimizerConfig, Kind, Reduction, Tensor};
use tracing::{debug, info, warn};

use crate::artifact::save_packaged;
use crate::config::TrainingConfig;
use crate::context::RunContext;
use crate::error::{AnmlError, AnmlResult, ConfigError};
use crate::model::{Anml, FastWeights, ParamLayout};
use crate::sampler::{Batch, Sampler, TrainRequest};

// ---------------------------------------------------------------------------
// Loss helpers
// ---------------------------------------------------------------------------

/// Mean cross-entropy of `logits [N, K]` against class indices `labels [N]`.
///
/// Uses the fallible tensor API so a label/logit mismatch surfaces as
/// [`AnmlError::Tch`] instead of a panic.
pub fn cross_entropy(logits: &Tensor, labels: &Tensor) -> AnmlResult<Tensor> {
    Ok(logits
        .f_log_softmax(-1, Kind::Float)?
        .f_nll_loss(labels, None::<Tensor>, Reduction::Mean, -100)?)
}

/// Fraction of rows whose argmax equals the label.
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> AnmlResult<f64> {
    let correct = logits.f_argmax(-1, false)?.f_eq_tensor(labels)?.to_kind(Kind::Float);
    Ok(correct.f_mean(Kind::Float)?.f_double_value(&[])?)
}

// ---------------------------------------------------------------------------
// Inner loop
// ---------------------------------------------------------------------------

/// Result of adapting a model to one task.
pub struct Adaptation {
    /// Final snapshot; still attached to the graph of every inner step.
    pub weights: FastWeights,
    /// Inner loss at each step, before the step's update.
    pub inner_losses: Vec<f64>,
    /// Number of SGD steps taken.
    pub steps: usize,
}

/// Run `cycles` passes of SGD over `task`, starting from the model's own
/// parameters and keeping the graph for second-order gradients.
///
/// # Errors
///
/// [`AnmlError::ParameterValidation`] for a non-positive `inner_lr`, and
/// [`AnmlError::Tch`] when a batch does not fit the model.
pub fn adapt(model: &Anml, inner_lr: f64, task: &[Batch], cycles: usize) -> AnmlResult<Adaptation> {
    if inner_lr <= 0.0 {
        return Err(AnmlError::invalid_parameter("inner_lr", format!("must be > 0, got {inner_lr}")));
    }
    let adapted = ParamLayout::inner_loop_indices();
    let mut weights = model.snapshot();
    let mut inner_losses = Vec::with_capacity(task.len() * cycles);

    for _ in 0..cycles {
        for (x, y) in task {
            let loss = cross_entropy(&model.forward_with(&weights, x), y)?;
            let updated: Vec<Tensor> = {
                let inputs: Vec<&Tensor> = adapted.iter().map(|&i| weights.get(i)).collect();
                let grads = Tensor::f_run_backward(&[&loss], &inputs, true, true)?;
                inputs.iter().zip(&grads).map(|(w, g)| *w - g * inner_lr).collect()
            };
            for (&i, w) in adapted.iter().zip(updated) {
                weights.replace(i, w);
            }
            inner_losses.push(loss.f_double_value(&[])?);
        }
    }

    let steps = inner_losses.len();
    Ok(Adaptation { weights, inner_losses, steps })
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Metrics of one outer iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationRecord {
    /// Zero-based outer iteration.
    pub iteration: usize,
    /// Meta-loss after adaptation.
    pub loss: f64,
    /// Meta-batch accuracy after adaptation.
    pub accuracy: f64,
}

/// Everything a completed run produced.
#[derive(Debug, Clone, Default)]
pub struct TrainingSummary {
    /// One record per outer iteration, in order.
    pub history: Vec<IterationRecord>,
    /// Checkpoints written, in order; the last is the final model.
    pub checkpoints: Vec<PathBuf>,
}

impl TrainingSummary {
    /// Record of the last iteration.
    pub fn last(&self) -> Option<&IterationRecord> {
        self.history.last()
    }
}

// ---------------------------------------------------------------------------
// Progress log
// ---------------------------------------------------------------------------

/// Averages metrics between reports and writes periodic checkpoints.
struct ProgressLog {
    name: String,
    print_every: usize,
    save_every: usize,
    dir: PathBuf,
    loss_sum: f64,
    acc_sum: f64,
    count: usize,
}

impl ProgressLog {
    fn new(input_shape: [i64; 3], config: &TrainingConfig, ctx: &RunContext) -> Self {
        let dims: Vec<String> = input_shape.iter().map(i64::to_string).collect();
        ProgressLog {
            name: format!("ANML-{}", dims.join("-")),
            print_every: ctx.log_every(),
            save_every: config.save_freq,
            dir: config.checkpoint_dir.clone(),
            loss_sum: 0.0,
            acc_sum: 0.0,
            count: 0,
        }
    }

    fn checkpoint_path(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{}-{tag}.net", self.name))
    }

    /// Returns `true` when a report is due after this record.
    fn record(&mut self, rec: &IterationRecord) -> bool {
        self.loss_sum += rec.loss;
        self.acc_sum += rec.accuracy;
        self.count += 1;
        (rec.iteration + 1) % self.print_every == 0
    }

    fn report(&mut self, iteration: usize, val_accuracy: Option<f64>) {
        let n = self.count.max(1) as f64;
        match val_accuracy {
            Some(val) => info!(
                iteration = iteration + 1,
                loss = self.loss_sum / n,
                accuracy = self.acc_sum / n,
                val_accuracy = val,
                "meta-train"
            ),
            None => info!(iteration = iteration + 1, loss = self.loss_sum / n, accuracy = self.acc_sum / n, "meta-train"),
        }
        self.loss_sum = 0.0;
        self.acc_sum = 0.0;
        self.count = 0;
    }

    fn save_due(&self, iteration: usize) -> bool {
        (iteration + 1) % self.save_every == 0
    }
}

// ---------------------------------------------------------------------------
// MetaTrainer
// ---------------------------------------------------------------------------

/// Owns a model and its outer optimizer for one meta-training run.
pub struct MetaTrainer {
    model: Anml,
    opt: nn::Optimizer,
    config: TrainingConfig,
    ctx: RunContext,
}

impl MetaTrainer {
    /// Validate the hyper-parameters and build the Adam optimizer over every
    /// model parameter.
    ///
    /// # Errors
    ///
    /// [`AnmlError::ParameterValidation`] unless `inner_lr`, `outer_lr` and
    /// `epochs` are all positive, checked before any other work.
    pub fn new(model: Anml, config: TrainingConfig, ctx: RunContext) -> AnmlResult<Self> {
        if config.inner_lr <= 0.0 {
            return Err(AnmlError::invalid_parameter("inner_lr", format!("must be > 0, got {}", config.inner_lr)));
        }
        if config.outer_lr <= 0.0 {
            return Err(AnmlError::invalid_parameter("outer_lr", format!("must be > 0, got {}", config.outer_lr)));
        }
        if config.epochs == 0 {
            return Err(AnmlError::invalid_parameter("epochs", "must be > 0"));
        }
        let opt = nn::Adam::default().build(model.var_store(), config.outer_lr)?;
        Ok(MetaTrainer { model, opt, config, ctx })
    }

    /// Build a fresh model from `config` and wrap it.
    pub fn from_config(config: TrainingConfig, ctx: RunContext) -> AnmlResult<Self> {
        let model = Anml::new(config.model_spec(), ctx.device)?;
        info!("model shape:\n{model}");
        Self::new(model, config, ctx)
    }

    /// The model being trained.
    pub fn model(&self) -> &Anml {
        &self.model
    }

    /// Give up the trained model.
    pub fn into_model(self) -> Anml {
        self.model
    }

    /// The configuration this run uses.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    fn request(&self) -> TrainRequest {
        TrainRequest {
            batch_size: self.config.batch_size,
            num_batches: self.config.num_batches,
            remember_size: self.config.remember_size,
            remember_only: self.config.remember_only,
        }
    }

    /// Fail unless `sampler` produces images and labels this model accepts.
    pub fn check_sampler(&self, sampler: &dyn Sampler) -> AnmlResult<()> {
        self.model.check_input_shape(sampler.input_shape())?;
        let classes = sampler.num_train_classes() as i64;
        if classes > self.model.num_classes() {
            return Err(ConfigError::invalid_value(
                "num_classes",
                format!("sampler has {classes} training classes, classifier has {}", self.model.num_classes()),
            )
            .into());
        }
        Ok(())
    }

    /// Run one outer iteration.
    pub fn step(&mut self, iteration: usize, sampler: &mut dyn Sampler) -> AnmlResult<IterationRecord> {
        let episode = sampler.sample_train(&self.request(), self.ctx.device)?;
        self.model.lobotomize(episode.class_id)?;

        let adaptation = adapt(&self.model, self.config.inner_lr, &episode.task, self.config.train_cycles)?;
        let (meta_x, meta_y) = &episode.meta;
        let logits = self.model.forward_with(&adaptation.weights, meta_x);
        let meta_loss = cross_entropy(&logits, meta_y)?;
        let meta_acc = accuracy(&logits, meta_y)?;

        self.opt.zero_grad();
        meta_loss.backward();
        self.opt.step();

        debug!(
            iteration,
            class_id = episode.class_id,
            inner_steps = adaptation.steps,
            first_inner_loss = adaptation.inner_losses.first().copied().unwrap_or_default(),
            "outer step"
        );
        Ok(IterationRecord { iteration, loss: meta_loss.f_double_value(&[])?, accuracy: meta_acc })
    }

    /// Accuracy of the current model on `val_size` held-out examples, if
    /// the sampler keeps any.
    pub fn validate(&self, sampler: &mut dyn Sampler) -> AnmlResult<Option<f64>> {
        if self.config.val_size == 0 {
            return Ok(None);
        }
        match sampler.sample_validation(self.config.val_size, self.ctx.device)? {
            Some((x, y)) => Ok(Some(accuracy(&self.model.forward_inference(&x), &y)?)),
            None => {
                warn!(
                    sampler = sampler.name(),
                    val_size = self.config.val_size,
                    "val_size is set but the sampler keeps no held-out examples; skipping validation"
                );
                Ok(None)
            }
        }
    }

    /// Run every outer iteration, reporting progress and writing
    /// checkpoints, then save the final model.
    pub fn train(&mut self, sampler: &mut dyn Sampler) -> AnmlResult<TrainingSummary> {
        self.check_sampler(sampler)?;
        let mut log = ProgressLog::new(self.model.input_shape(), &self.config, &self.ctx);
        let mut summary = TrainingSummary::default();
        info!(
            sampler = sampler.name(),
            epochs = self.config.epochs,
            train_size = self.config.train_size(),
            remember_size = self.config.remember_size,
            "commencing meta-training"
        );

        for it in 0..self.config.epochs {
            let record = self.step(it, sampler)?;
            summary.history.push(record);
            if log.record(&record) {
                let val = self.validate(sampler)?;
                log.report(it, val);
            }
            if log.save_due(it) {
                let path = log.checkpoint_path(&(it + 1).to_string());
                save_packaged(&self.model, &path)?;
                info!(path = %path.display(), "checkpoint saved");
                summary.checkpoints.push(path);
            }
        }

        let final_path = log.checkpoint_path("final");
        save_packaged(&self.model, &final_path)?;
        info!(path = %final_path.display(), "final model saved");
        summary.checkpoints.push(final_path);
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelSpec;
    use approx::assert_abs_diff_eq;
    use tch::Device;

    fn tiny_model() -> Anml {
        Anml::new(ModelSpec::new([1, 28, 28], 4, 3, 5), Device::Cpu).unwrap()
    }

    fn task(n: usize) -> Vec<Batch> {
        (0..n)
            .map(|_| (Tensor::rand([1, 1, 28, 28], (Kind::Float, Device::Cpu)), Tensor::from_slice(&[2_i64])))
            .collect()
    }

    #[test]
    fn cross_entropy_of_uniform_logits_is_log_k() {
        let logits = Tensor::zeros([3, 4], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice(&[0_i64, 1, 3]);
        let loss = cross_entropy(&logits, &labels).unwrap().double_value(&[]);
        assert_abs_diff_eq!(loss, 4f64.ln(), epsilon = 1e-6);
    }

    #[test]
    fn accuracy_counts_argmax_hits() {
        let logits = Tensor::from_slice(&[1.0_f32, 0.0, 0.0, 1.0, 1.0, 0.0]).reshape([3, 2]);
        let labels = Tensor::from_slice(&[0_i64, 1, 1]);
        assert_abs_diff_eq!(accuracy(&logits, &labels).unwrap(), 2.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn adapt_takes_one_step_per_batch_per_cycle() {
        let model = tiny_model();
        let batches = task(3);
        let out = adapt(&model, 0.1, &batches, 2).unwrap();
        assert_eq!(out.steps, 6);
        assert_eq!(out.inner_losses.len(), 6);
        assert!(out.inner_losses.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn adapt_leaves_nm_untouched_and_moves_classifier() {
        let model = tiny_model();
        let out = adapt(&model, 0.5, &task(2), 1).unwrap();
        for i in ParamLayout::NM_CONV.chain(ParamLayout::NM_FC) {
            assert!(out.weights.get(i).equal(&model.parameters()[i]));
        }
        let before = &model.parameters()[ParamLayout::CLASSIFIER_BIAS];
        assert!(!out.weights.get(ParamLayout::CLASSIFIER_BIAS).allclose(before, 0.0, 0.0, false));
    }

    #[test]
    fn non_positive_learning_rates_are_rejected() {
        let model = tiny_model();
        assert!(matches!(
            adapt(&model, 0.0, &task(1), 1),
            Err(AnmlError::ParameterValidation { name: "inner_lr", .. })
        ));

        let ctx = RunContext::cpu(0);
        for (field, config) in [
            ("inner_lr", TrainingConfig { inner_lr: -1.0, ..TrainingConfig::default() }),
            ("outer_lr", TrainingConfig { outer_lr: 0.0, ..TrainingConfig::default() }),
            ("epochs", TrainingConfig { epochs: 0, ..TrainingConfig::default() }),
        ] {
            match MetaTrainer::new(tiny_model(), config, ctx) {
                Err(AnmlError::ParameterValidation { name, .. }) => assert_eq!(name, field),
                Err(e) => panic!("{field}: unexpected error {e}"),
                Ok(_) => panic!("{field}: accepted"),
            }
        }
    }
}
