use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use droid_inference::model::{argmax, LogitsSampler, SamplingStrategy, TokenSampler};

/// Deterministic pseudo-logits with a realistic spread.
fn logits(vocab: usize) -> Vec<f32> {
    (0..vocab)
        .map(|i| ((i as f32 * 0.618_034).fract() - 0.5) * 12.0)
        .collect()
}

fn bench_argmax(c: &mut Criterion) {
    let logits = logits(50_257);
    c.bench_function("argmax_gpt2_vocab", |b| b.iter(|| argmax(black_box(&logits))));
}

fn bench_sampling_strategies(c: &mut Criterion) {
    let logits = Tensor::new(logits(50_257), &Device::Cpu).unwrap();
    let mut group = c.benchmark_group("sample_gpt2_vocab");

    let strategies = [
        ("greedy", SamplingStrategy::Greedy),
        (
            "temperature",
            SamplingStrategy::Sample {
                temperature: 0.8,
                top_k: None,
                top_p: None,
            },
        ),
        (
            "top_k_50",
            SamplingStrategy::Sample {
                temperature: 0.7,
                top_k: Some(50),
                top_p: None,
            },
        ),
        (
            "top_k_top_p",
            SamplingStrategy::Sample {
                temperature: 0.7,
                top_k: Some(50),
                top_p: Some(0.95),
            },
        ),
        (
            "top_p_only",
            SamplingStrategy::Sample {
                temperature: 0.8,
                top_k: None,
                top_p: Some(0.85),
            },
        ),
    ];

    for (name, strategy) in strategies {
        let mut sampler = LogitsSampler::new(42, strategy);
        group.bench_with_input(BenchmarkId::from_parameter(name), &logits, |b, logits| {
            b.iter(|| sampler.sample(black_box(logits)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_argmax, bench_sampling_strategies);
criterion_main!(benches);
