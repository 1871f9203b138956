//! Benchmarks for heatmap rendering and the joint transform.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array3;

use atelier_core::{JointCoords, LandmarkPoint};
use atelier_data::assembly::joint_transform;
use atelier_data::heatmap::{joint_heatmap, landmark_heatmap};
use atelier_data::image_ops::{chw_to_hwc, gaussian_blur, Geometry};

fn upper_landmarks() -> Vec<LandmarkPoint> {
    (0..6)
        .map(|i| LandmarkPoint::new(40.0 + 30.0 * i as f32, 60.0 + 20.0 * i as f32, 0))
        .collect()
}

fn benchmark_heatmaps(c: &mut Criterion) {
    let landmarks = upper_landmarks();
    let joints = JointCoords((0..18).map(|i| [10.0 * i as f32, 12.0 * i as f32]).collect());

    c.bench_function("landmark_heatmap_256", |b| {
        b.iter(|| landmark_heatmap(256, 256, black_box(&landmarks), 1, 15.0))
    });

    c.bench_function("joint_heatmap_256", |b| {
        b.iter(|| joint_heatmap(256, 256, black_box(&joints), 6.0))
    });
}

fn benchmark_joint_transform(c: &mut Criterion) {
    let img = Array3::from_elem((256, 256, 3), 0.5f32);
    let lm = match landmark_heatmap(256, 256, &upper_landmarks(), 1, 15.0) {
        Ok(map) => chw_to_hwc(map),
        Err(e) => panic!("heatmap failed: {e}"),
    };
    let edge = Array3::from_elem((256, 256, 1), 0.0f32);
    let seg = Array3::from_elem((256, 256, 1), 3.0f32);
    let geometry = Geometry {
        scaled: 256,
        top: 16,
        left: 16,
        size: 224,
        flip: true,
    };

    c.bench_function("joint_transform_256_to_224", |b| {
        b.iter(|| {
            joint_transform(
                &geometry,
                black_box(&[("img", &img), ("lm", &lm), ("edge", &edge)]),
                Some(&seg),
            )
        })
    });

    c.bench_function("color_blur_256_k15", |b| {
        b.iter(|| gaussian_blur(black_box(&img), 15, 10.0))
    });
}

criterion_group!(benches, benchmark_heatmaps, benchmark_joint_transform);
criterion_main!(benches);
