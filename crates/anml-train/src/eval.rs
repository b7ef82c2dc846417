//! Meta-test evaluation.
//!
//! A trained model is judged on classes it never saw during meta-training:
//!
//! 1. **meta-test-train**: freeze the RLN and NM, re-initialise the
//!    classifier, then learn the novel classes one after another with
//!    ordinary Adam steps, one step per example.
//! 2. **meta-test-test**: score the held-out examples of every class with
//!    the final model and report one accuracy per class.
//!
//! Because the classes are learned sequentially, the per-class accuracies
//! show how much of the early classes survives the later ones.

use std::path::Path;
use tch::nn::{self, OptimizerConfig};
use tch::Tensor;
use tracing::{debug, info};

use crate::artifact::load_model;
use crate::config::EvalConfig;
use crate::context::RunContext;
use crate::error::{AnmlError, AnmlResult};
use crate::meta::cross_entropy;
use crate::model::Anml;
use crate::sampler::{Batch, Sampler};

/// Split `len` items into chunks of exactly `chunk`.
///
/// # Errors
///
/// [`AnmlError::UnevenChunks`] unless `chunk > 0` and it divides `len`.
pub fn divide_chunks(len: i64, chunk: i64) -> AnmlResult<i64> {
    if chunk <= 0 || len % chunk != 0 {
        return Err(AnmlError::UnevenChunks { len, chunk });
    }
    Ok(len / chunk)
}

/// Per-class accuracy of `model` on held-out data grouped class by class,
/// `test_examples` rows per class.
///
/// Runs without gradient tracking. Returns `len(labels) / test_examples`
/// values, each in `[0, 1]`.
///
/// # Errors
///
/// [`AnmlError::UnevenChunks`] when the held-out set cannot be split evenly.
pub fn test_test(model: &Anml, held_out: &Batch, test_examples: usize) -> AnmlResult<Vec<f64>> {
    let (x, y) = held_out;
    let chunk = test_examples as i64;
    let n_chunks = divide_chunks(y.size1()?, chunk)?;
    if n_chunks == 0 {
        return Ok(Vec::new());
    }

    let hits = tch::no_grad(|| -> AnmlResult<Tensor> {
        let predicted = model.forward(x).f_argmax(-1, false)?;
        Ok(predicted.f_eq_tensor(y)?)
    })?;

    let mut accs = Vec::with_capacity(n_chunks as usize);
    for hits_c in hits.f_split(chunk, 0)? {
        let correct = hits_c.f_sum(tch::Kind::Int64)?.f_int64_value(&[])?;
        accs.push(correct as f64 / chunk as f64);
    }
    Ok(accs)
}

/// Fine-tune the classifier of `model` on the tasks in order.
///
/// Freezes the RLN and NM, re-initialises the classifier weight, and takes
/// one Adam step per batch. Updates accumulate across tasks.
pub fn fine_tune(model: &mut Anml, tasks: &[Vec<Batch>], lr: f64) -> AnmlResult<usize> {
    model.freeze_feature_extractor();
    model.reset_classifier();
    let mut opt = nn::Adam::default().build(model.var_store(), lr)?;

    let mut steps = 0;
    for task in tasks {
        for (x, y) in task {
            let loss = cross_entropy(&model.forward(x), y)?;
            opt.zero_grad();
            loss.backward();
            opt.step();
            steps += 1;
        }
    }
    debug!(steps, "meta-test-train finished");
    Ok(steps)
}

/// Full meta-test protocol on one sampled episode: load the model, learn
/// the novel classes, and score the held-out examples.
pub fn test_train(
    model_path: &Path,
    sampler: &mut dyn Sampler,
    config: &EvalConfig,
    ctx: &RunContext,
) -> AnmlResult<Vec<f64>> {
    config.validate()?;
    let mut model = load_model(model_path, sampler.input_shape(), ctx.device)?;

    let test_examples = config.test_examples();
    let episode = sampler.sample_test(config.num_classes, config.train_examples, test_examples, ctx.device)?;
    fine_tune(&mut model, &episode.tasks, config.lr)?;
    test_test(&model, &episode.held_out, test_examples)
}

/// Aggregated result of [`evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    /// Per-class accuracies of each run.
    pub runs: Vec<Vec<f64>>,
    /// Mean accuracy of each run.
    pub run_means: Vec<f64>,
    /// Mean of `run_means`.
    pub mean: f64,
    /// Population standard deviation of `run_means`.
    pub std: f64,
}

impl EvalReport {
    /// Summarise per-run accuracies.
    pub fn from_runs(runs: Vec<Vec<f64>>) -> Self {
        let run_means: Vec<f64> = runs.iter().map(|r| mean(r)).collect();
        let mean_all = mean(&run_means);
        let var = if run_means.is_empty() {
            0.0
        } else {
            run_means.iter().map(|m| (m - mean_all).powi(2)).sum::<f64>() / run_means.len() as f64
        };
        EvalReport { runs, run_means, mean: mean_all, std: var.sqrt() }
    }
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

/// Repeat [`test_train`] `config.runs` times with fresh episodes, reloading
/// the model each time.
pub fn evaluate(
    model_path: &Path,
    sampler: &mut dyn Sampler,
    config: &EvalConfig,
    ctx: &RunContext,
) -> AnmlResult<EvalReport> {
    config.validate()?;
    let mut runs = Vec::with_capacity(config.runs);
    for run in 0..config.runs {
        let accs = test_train(model_path, sampler, config, ctx)?;
        info!(run = run + 1, mean_accuracy = mean(&accs), "meta-test run");
        runs.push(accs);
    }
    let report = EvalReport::from_runs(runs);
    info!(runs = config.runs, mean = report.mean, std = report.std, "meta-test complete");
    Ok(report)
}
