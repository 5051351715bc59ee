//! Benchmarks for image normalization and payload preparation.
//!
//! Run with: cargo bench -p glimpse-core

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use glimpse_core::normalize::{encode_jpeg, flatten_to_rgb, ImageNormalizer, NormalizePolicy};
use glimpse_core::provider::ImagePayload;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// A gradient with some texture so JPEG sizes are realistic.
fn photo_like(width: u32, height: u32) -> DynamicImage {
    let img = RgbImage::from_fn(width, height, |x, y| {
        let n = (x.wrapping_mul(31) ^ y.wrapping_mul(17)) % 23;
        Rgb([
            ((x * 255 / width) as u8).wrapping_add(n as u8),
            ((y * 255 / height) as u8).wrapping_add(n as u8),
            (((x + y) / 8) % 255) as u8,
        ])
    });
    DynamicImage::ImageRgb8(img)
}

fn encoded_png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    photo_like(width, height)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn benchmark_normalize_camera_photo(c: &mut Criterion) {
    let bytes = encoded_png(4032, 3024);
    let normalizer = ImageNormalizer::new();
    let policy = NormalizePolicy::new(1568, 3_750_000);

    c.bench_function("normalize_4032x3024_to_1568", |b| {
        b.iter(|| {
            let _ = normalizer.normalize(black_box(&bytes), Some("png"), &policy);
        })
    });
}

fn benchmark_normalize_tight_budget(c: &mut Criterion) {
    let bytes = encoded_png(2048, 1536);
    let normalizer = ImageNormalizer::new();
    // Forces several steps down the quality ladder
    let policy = NormalizePolicy::new(2048, 150_000);

    c.bench_function("normalize_tight_budget", |b| {
        b.iter(|| {
            let _ = normalizer.normalize(black_box(&bytes), Some("png"), &policy);
        })
    });
}

fn benchmark_encode_jpeg(c: &mut Criterion) {
    let rgb = flatten_to_rgb(&photo_like(1568, 1176));

    c.bench_function("encode_jpeg_q85", |b| {
        b.iter(|| {
            let _ = encode_jpeg(black_box(&rgb), 85);
        })
    });
}

fn benchmark_payload_base64(c: &mut Criterion) {
    let rgb = flatten_to_rgb(&photo_like(1568, 1176));
    let jpeg = encode_jpeg(&rgb, 85).unwrap();

    c.bench_function("payload_base64", |b| {
        b.iter(|| {
            let _ = ImagePayload::from_bytes(black_box(&jpeg), "jpeg");
        })
    });
}

criterion_group!(
    benches,
    benchmark_normalize_camera_photo,
    benchmark_normalize_tight_budget,
    benchmark_encode_jpeg,
    benchmark_payload_base64,
);
criterion_main!(benches);
