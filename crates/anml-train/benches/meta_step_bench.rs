//! Benchmarks for one ANML outer iteration and its inner loop.
//!
//! Run with:
//!
//! ```bash
//! cargo bench -p anml-train
//! ```
//!
//! Criterion HTML reports are written to `target/criterion/`.

use anml_train::config::TrainingConfig;
use anml_train::context::RunContext;
use anml_train::meta::{adapt, MetaTrainer};
use anml_train::model::{Anml, ModelSpec};
use anml_train::sampler::{EpisodeSampler, Sampler, SyntheticConfig, TrainRequest};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tch::Device;

fn synthetic(seed: u64) -> EpisodeSampler {
    let cfg = SyntheticConfig { num_train_classes: 16, ..SyntheticConfig::default() };
    EpisodeSampler::synthetic(&cfg, seed).expect("synthetic sampler")
}

/// Inner loop alone, for a growing number of SGD steps.
fn bench_inner_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("inner_loop");
    let model = Anml::new(ModelSpec::new([1, 28, 28], 32, 16, 16), Device::Cpu).expect("model");
    let mut sampler = synthetic(0);

    for steps in [1_usize, 5, 20] {
        let req = TrainRequest { batch_size: 1, num_batches: steps, remember_size: 0, remember_only: false };
        let episode = sampler.sample_train(&req, Device::Cpu).expect("episode");
        group.bench_with_input(BenchmarkId::from_parameter(steps), &episode.task, |b, task| {
            b.iter(|| adapt(&model, 0.1, black_box(task), 1).expect("adapt"));
        });
    }
    group.finish();
}

/// Full outer iteration with the default 20-example task and remember set.
fn bench_outer_step(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = TrainingConfig {
        rln_channels: 32,
        nm_channels: 16,
        num_classes: 16,
        checkpoint_dir: dir.path().to_path_buf(),
        ..TrainingConfig::default()
    };
    let mut sampler = synthetic(1);
    let mut trainer = MetaTrainer::from_config(config, RunContext::cpu(1)).expect("trainer");

    let mut it = 0;
    c.bench_function("outer_step_20x1_remember64", |b| {
        b.iter(|| {
            let rec = trainer.step(it, &mut sampler).expect("step");
            it += 1;
            black_box(rec)
        });
    });
}

criterion_group!(benches, bench_inner_loop, bench_outer_step);
criterion_main!(benches);
