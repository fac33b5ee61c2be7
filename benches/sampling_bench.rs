//! Benchmarks for token sampling.
//!
//! Covers softmax and argmax over the vocabulary, nucleus filtering, and the
//! full sampler at several temperature / top-p settings.

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use llama_engine::ops::{argmax, softmax};
use llama_engine::sampling::{nucleus_filter, Sampler, SamplingConfig};
use std::hint::black_box;

/// Generate logits with a controlled spread.
fn random_logits(vocab_size: usize, seed: u64) -> Vec<f32> {
    (0..vocab_size)
        .map(|i| {
            let x = ((i as u64 * 17 + seed) % 1000) as f32 / 100.0;
            x - 5.0 // Range roughly [-5, 5]
        })
        .collect()
}

fn probabilities(vocab_size: usize) -> Vec<f32> {
    let mut probs = random_logits(vocab_size, 1);
    softmax(&mut probs);
    probs
}

/// Benchmark softmax with varying vocabulary sizes.
fn bench_softmax(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampling/softmax");

    for vocab_size in [512, 32000, 128000] {
        group.throughput(Throughput::Elements(vocab_size as u64));
        let logits = random_logits(vocab_size, 1);

        group.bench_with_input(BenchmarkId::new("vocab", vocab_size), &vocab_size, |b, _| {
            b.iter_batched_ref(
                || logits.clone(),
                |x| softmax(black_box(x)),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark argmax.
fn bench_argmax(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampling/argmax");

    for vocab_size in [512, 32000, 128000] {
        group.throughput(Throughput::Elements(vocab_size as u64));
        let probs = probabilities(vocab_size);

        group.bench_with_input(BenchmarkId::new("vocab", vocab_size), &vocab_size, |b, _| {
            b.iter(|| black_box(argmax(black_box(&probs))));
        });
    }

    group.finish();
}

/// Benchmark nucleus filtering at several thresholds.
fn bench_nucleus(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampling/nucleus");
    let probs = probabilities(32000);

    for top_p in [0.5, 0.9, 0.99] {
        group.bench_with_input(BenchmarkId::new("top_p", top_p), &top_p, |b, &top_p| {
            b.iter_batched_ref(
                || probs.clone(),
                |p| black_box(nucleus_filter(black_box(p), top_p)),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark the full sampler.
fn bench_sampler(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampling/sampler");
    let logits = random_logits(32000, 1);

    let configs = [
        ("greedy", SamplingConfig::greedy()),
        ("temperature", SamplingConfig::new(0.8, 1.0, 7)),
        ("temp_top_p", SamplingConfig::new(0.8, 0.9, 7)),
    ];

    for (name, config) in configs {
        group.bench_function(name, |b| {
            let mut sampler = Sampler::<f32>::new(config).unwrap();
            b.iter(|| black_box(sampler.sample(black_box(&logits)).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_softmax, bench_argmax, bench_nucleus, bench_sampler);
criterion_main!(benches);
