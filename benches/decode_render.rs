//! Decode and CPU reference render benchmarks.
//! Run: cargo bench
//!
//! The GPU path is covered by tests/gpu_render_smoke.rs rather than timed here.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ptm_relight::ptm::decode;
use ptm_relight::shading::{render_reference, FrameParams, LightDirection, RenderMode};

fn synthetic_lrgb(width: usize, height: usize) -> Vec<u8> {
    let mut bytes = format!(
        "PTM_1.2\nPTM_FORMAT_LRGB\n{width} {height}\n0.5 0.5 0.5 1 1 1\n128 128 128 128 128 0\n"
    )
    .into_bytes();
    for pixel in 0..width * height {
        let shade = (pixel % 251) as u8;
        bytes.extend_from_slice(&[120, 136, shade, 140, 116, shade / 2 + 64]);
    }
    for pixel in 0..width * height {
        bytes.extend_from_slice(&[(pixel % 256) as u8, 180, 90]);
    }
    bytes
}

fn bench_decode(c: &mut Criterion) {
    let bytes = synthetic_lrgb(512, 512);

    let mut group = c.benchmark_group("decode");
    group.sample_size(30);
    group.bench_function("lrgb_512", |b| {
        b.iter(|| black_box(decode(black_box(&bytes)).expect("decode")));
    });
    group.finish();
}

fn bench_reference_render(c: &mut Criterion) {
    let file = decode(&synthetic_lrgb(256, 256)).expect("decode");

    let mut group = c.benchmark_group("render_reference");
    group.sample_size(20);
    for (name, mode) in [
        ("default_256", RenderMode::Default),
        ("specular_256", RenderMode::SpecularEnhancement),
        ("normal_map_256", RenderMode::NormalMap),
    ] {
        let params = FrameParams {
            light: LightDirection { u: 0.4, v: 0.3 },
            mode,
            ..FrameParams::default()
        };
        group.bench_function(name, |b| {
            b.iter(|| black_box(render_reference(&file, &params, 256, 256).expect("render")));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decode, bench_reference_render);
criterion_main!(benches);
