use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use emu_core::graphics::{ColorOps, PixelFormat};

const WIDTH: usize = 480;

fn bench_convert_row(c: &mut Criterion) {
    let mut group = c.benchmark_group("convert_row");

    for format in [
        PixelFormat::Rgb565,
        PixelFormat::Rgba5551,
        PixelFormat::Rgba4444,
        PixelFormat::Rgba8888,
    ] {
        let src = vec![0x5Au8; WIDTH * format.bytes_per_pixel() as usize];
        let mut dst = vec![0u32; WIDTH];
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:?}", format)),
            &src,
            |b, src| {
                b.iter(|| {
                    ColorOps::convert_row(format, black_box(src), &mut dst);
                    black_box(dst[WIDTH - 1]);
                });
            },
        );
    }

    group.finish();
}

fn bench_full_frame(c: &mut Criterion) {
    let src = vec![0xA5u8; WIDTH * 272 * 2];
    let mut dst = vec![0u32; WIDTH * 272];
    c.bench_function("convert_frame_565", |b| {
        b.iter(|| {
            for (s, d) in src.chunks_exact(WIDTH * 2).zip(dst.chunks_exact_mut(WIDTH)) {
                ColorOps::convert_row(PixelFormat::Rgb565, s, d);
            }
            black_box(dst[0]);
        });
    });
}

criterion_group!(benches, bench_convert_row, bench_full_frame);
criterion_main!(benches);
