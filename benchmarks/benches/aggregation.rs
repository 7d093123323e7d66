//! Benchmarks for folding updates into the running average

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::ArrayD;
use ndarray::IxDyn;
use node_core::{weighted_mean, ModelTensors};

/// A model of `layers` square dense layers with `width * width` weights each
fn model(layers: usize, width: usize, fill: f64) -> ModelTensors {
    ModelTensors::new(
        (0..layers)
            .map(|_| ArrayD::from_elem(IxDyn(&[width, width]), fill))
            .collect(),
    )
}

fn weighted_fold_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted_fold");

    for width in [32usize, 128, 512] {
        let layers = 4;
        group.throughput(Throughput::Elements((layers * width * width) as u64));

        let update = model(layers, width, 0.5);
        group.bench_with_input(BenchmarkId::from_parameter(width), &update, |b, update| {
            let mut accumulator = model(layers, width, 1.0);
            let mut sigma = 1.0;
            b.iter(|| {
                accumulator
                    .weighted_fold(sigma, black_box(update), 2.0)
                    .unwrap();
                sigma += 2.0;
            });
        });
    }

    group.finish();
}

fn weighted_mean_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted_mean");

    for clients in [10usize, 100] {
        let updates: Vec<(ModelTensors, f64)> = (0..clients)
            .map(|i| (model(4, 64, i as f64), 1.0 + (i % 3) as f64))
            .collect();
        group.throughput(Throughput::Elements(clients as u64));

        group.bench_with_input(BenchmarkId::from_parameter(clients), &updates, |b, updates| {
            b.iter(|| weighted_mean(black_box(updates)).unwrap());
        });
    }

    group.finish();
}

fn decode_benchmark(c: &mut Criterion) {
    let json = model(4, 128, 0.25).to_json();
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(4 * 128 * 128));
    group.bench_function("from_json_4x128x128", |b| {
        b.iter(|| ModelTensors::from_json(black_box(&json)).unwrap());
    });
    group.finish();
}

criterion_group!(
    benches,
    weighted_fold_benchmark,
    weighted_mean_benchmark,
    decode_benchmark
);
criterion_main!(benches);
