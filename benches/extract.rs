use criterion::{Criterion, black_box, criterion_group, criterion_main};

use clonewatch::audio_pipeline::TARGET_SAMPLE_RATE;
use clonewatch::loader::load_samples;
use clonewatch::{Opts, extract, synth};

fn bench_extract_3s(c: &mut Criterion) {
    let waveform = load_samples(synth::natural_voice(3.0, 1), TARGET_SAMPLE_RATE, &Opts::default())
        .expect("synthetic voice must preprocess");

    c.bench_function("extract_natural_3s", |b| {
        b.iter(|| {
            let _ = black_box(extract(black_box(&waveform)));
        });
    });
}

fn bench_preprocess_44k(c: &mut Criterion) {
    // 3 s at 44.1 kHz exercises the resampler as well as trimming.
    let samples: Vec<f32> = (0..132_300)
        .map(|i| (2.0 * std::f32::consts::PI * 220.0 * i as f32 / 44_100.0).sin() * 0.5)
        .collect();
    let opts = Opts::default();

    c.bench_function("preprocess_44k_3s", |b| {
        b.iter(|| {
            let _ = black_box(load_samples(black_box(samples.clone()), 44_100, &opts));
        });
    });
}

criterion_group!(benches, bench_extract_3s, bench_preprocess_44k);
criterion_main!(benches);
