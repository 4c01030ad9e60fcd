use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use emu_psp::command::*;
use emu_psp::memory::RAM_BASE;
use emu_psp::{HeadlessDrawContext, PspGpu};

const LIST: u32 = RAM_BASE + 0x10_0000;
const VERTS: u32 = RAM_BASE + 0x20_0000;

fn new_gpu() -> PspGpu<HeadlessDrawContext> {
    PspGpu::with_backend(HeadlessDrawContext::new(480, 272))
}

/// `count` state writes that alternate values, so every word changes state.
fn state_list(count: u32) -> Vec<u32> {
    let mut words: Vec<u32> = (0..count)
        .map(|i| match i % 4 {
            0 => word(GE_CMD_FOGCOLOR, i),
            1 => word(GE_CMD_MORPHWEIGHT0, to_float24(i as f32)),
            2 => word(GE_CMD_ALPHATEST, i & 0xFF),
            _ => word(GE_CMD_TEXENVCOLOR, i),
        })
        .collect();
    words.extend([word(GE_CMD_FINISH, 0), word(GE_CMD_END, 0)]);
    words
}

/// Through-mode rectangles, one PRIM each.
fn draw_list(prims: u32) -> Vec<u32> {
    let mut words = vec![
        word(GE_CMD_BASE, (RAM_BASE >> 8) & 0x0F_0000),
        word(GE_CMD_FRAMEBUFPTR, 0),
        word(GE_CMD_FRAMEBUFWIDTH, 512),
        word(GE_CMD_REGION2, 479 | (271 << 10)),
        word(GE_CMD_SCISSOR2, 479 | (271 << 10)),
        word(GE_CMD_VERTEXTYPE, (1 << 23) | (2 << 7)),
    ];
    for _ in 0..prims {
        words.push(word(GE_CMD_VADDR, VERTS & 0xFF_FFFF));
        words.push(word(GE_CMD_PRIM, (6 << 16) | 2));
    }
    words.extend([word(GE_CMD_FINISH, 0), word(GE_CMD_END, 0)]);
    words
}

fn bench_state_commands(c: &mut Criterion) {
    let mut group = c.benchmark_group("ge_state_commands");

    for count in [100u32, 1000, 10000] {
        let mut gpu = new_gpu();
        gpu.memory_mut().write_words(LIST, &state_list(count)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let id = gpu.enqueue_list(LIST, 0).unwrap();
                black_box(id);
            });
        });
    }

    group.finish();
}

fn bench_with_hook(c: &mut Criterion) {
    let mut gpu = new_gpu();
    gpu.memory_mut().write_words(LIST, &state_list(1000)).unwrap();
    gpu.set_command_hook(Box::new(|t| {
        black_box(t.op);
    }));
    c.bench_function("ge_state_commands_hooked_1000", |b| {
        b.iter(|| {
            let id = gpu.enqueue_list(LIST, 0).unwrap();
            black_box(id);
        });
    });
}

fn bench_draws(c: &mut Criterion) {
    let mut gpu = new_gpu();
    let verts: Vec<u8> = [[0i16, 0, 0], [16, 16, 0]]
        .iter()
        .flat_map(|v| v.iter().flat_map(|c| c.to_le_bytes()))
        .collect();
    gpu.memory_mut().write_bytes(VERTS, &verts).unwrap();
    gpu.memory_mut().write_words(LIST, &draw_list(256)).unwrap();
    c.bench_function("ge_rect_draws_256", |b| {
        b.iter(|| {
            gpu.enqueue_list(LIST, 0).unwrap();
            black_box(gpu.flush());
            gpu.backend_mut().clear_calls();
        });
    });
}

criterion_group!(benches, bench_state_commands, bench_with_hook, bench_draws);
criterion_main!(benches);
