//! Criterion benchmarks for the frame pipeline.
//!
//! Every completed loop reshapes the raw sensor buffer and computes one
//! derived image per species before the next loop is armed, so these paths
//! bound how fast a continuous loop can cycle.
//!
//! Key metrics:
//! - Optical density throughput (pixels/sec) for common frame sizes
//! - Reshape and stacking cost per shot
//! - Full derived image computation for a three-shot absorption loop
//!
//! Run with: cargo bench --bench derived_images

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use krbcam::config::ImagingSettings;
use krbcam::frames::{
    optical_density, reshape, DerivationMode, DerivedImageComputer, FrameRoles, RawFrameSet,
};
use ndarray::Array2;
use rand::Rng;

fn random_frame(rows: usize, cols: usize, lo: i32, hi: i32) -> Array2<i32> {
    let mut rng = rand::thread_rng();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(lo..hi))
}

/// Optical density of one species at binned frame sizes seen on the experiment.
fn optical_density_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("optical_density");

    let sizes = vec![
        ("64x256", 64, 256),
        ("128x256", 128, 256),
        ("256x256", 256, 256),
        ("512x512", 512, 512),
    ];

    for (name, rows, cols) in sizes {
        let shadow = random_frame(rows, cols, 200, 1200);
        let light = random_frame(rows, cols, 1500, 2000);
        let dark = random_frame(rows, cols, 90, 110);

        group.throughput(Throughput::Elements((rows * cols) as u64));
        group.bench_with_input(BenchmarkId::new("od", name), &(rows, cols), |b, _| {
            b.iter(|| {
                optical_density(
                    black_box(shadow.view()),
                    black_box(light.view()),
                    black_box(dark.view()),
                    2200.0,
                    10.0,
                )
                .unwrap()
            });
        });
    }

    group.finish();
}

/// Reshape a fast-kinetics buffer and append it to a loop's frame set.
fn reshape_and_stack(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_assembly");

    for kinetics in [2usize, 4] {
        let (rows, cols) = (128, 256);
        let len = kinetics * rows * cols;
        let buffer: Vec<i32> = (0..len).map(|i| (i % 4096) as i32).collect();

        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(
            BenchmarkId::new("shot", format!("{kinetics}_frames")),
            &kinetics,
            |b, &kinetics| {
                b.iter(|| {
                    let mut set = RawFrameSet::new();
                    for _ in 0..3 {
                        let frames = reshape(black_box(&buffer), kinetics, cols, rows).unwrap();
                        set.push_shot(frames).unwrap();
                    }
                    set
                });
            },
        );
    }

    group.finish();
}

/// Derived images for a complete absorption loop: 3 shots, 2 species.
fn absorption_loop(c: &mut Criterion) {
    let (rows, cols) = (256, 256);
    let mut set = RawFrameSet::new();
    for (lo, hi) in [(200, 1200), (1500, 2000), (90, 110)] {
        set.push_shot(vec![
            random_frame(rows, cols, lo, hi),
            random_frame(rows, cols, lo, hi),
        ])
        .unwrap();
    }
    let computer = DerivedImageComputer::new(&ImagingSettings::default());

    c.bench_function("absorption_loop_256x256", |b| {
        b.iter(|| {
            computer
                .compute(
                    black_box(&set),
                    DerivationMode::Absorption,
                    FrameRoles::default(),
                )
                .unwrap()
        });
    });
}

criterion_group!(
    benches,
    optical_density_throughput,
    reshape_and_stack,
    absorption_loop
);
criterion_main!(benches);
