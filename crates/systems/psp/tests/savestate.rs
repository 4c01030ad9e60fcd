//! Save, load and resume a stalled list on a second GPU.

use emu_core::System;
use emu_psp::backend::headless::{DrawCall, HeadlessDrawContext};
use emu_psp::command::*;
use emu_psp::display_list::ListState;
use emu_psp::memory::RAM_BASE;
use emu_psp::PspGpu;

const LIST: u32 = RAM_BASE + 0x1_0000;
const VERTS: u32 = RAM_BASE + 0x2_0000;

fn list_words() -> Vec<u32> {
    vec![
        word(GE_CMD_BASE, (RAM_BASE >> 8) & 0x0F_0000),
        word(GE_CMD_FRAMEBUFPTR, 0),
        word(GE_CMD_FRAMEBUFWIDTH, 512),
        word(GE_CMD_REGION2, 479 | (271 << 10)),
        word(GE_CMD_SCISSOR2, 479 | (271 << 10)),
        word(GE_CMD_VERTEXTYPE, (1 << 23) | (2 << 7)),
        word(GE_CMD_FOGCOLOR, 0x102030),
        // Stall here.
        word(GE_CMD_VADDR, VERTS & 0xFF_FFFF),
        word(GE_CMD_PRIM, (3 << 16) | 3),
        word(GE_CMD_ALPHATEST, 0x1),
        word(GE_CMD_VADDR, VERTS & 0xFF_FFFF),
        word(GE_CMD_PRIM, (3 << 16) | 3),
        word(GE_CMD_FINISH, 0),
        word(GE_CMD_END, 0),
    ]
}

fn draws(gpu: &PspGpu<HeadlessDrawContext>) -> Vec<DrawCall> {
    gpu.backend()
        .calls()
        .iter()
        .filter(|c| matches!(c, DrawCall::DrawIndexed { .. }))
        .cloned()
        .collect()
}

fn loaded_gpu() -> PspGpu<HeadlessDrawContext> {
    let mut gpu = PspGpu::with_backend(HeadlessDrawContext::new(480, 272));
    let verts: Vec<u8> = [[0i16, 0, 0], [50, 0, 0], [0, 50, 0]]
        .iter()
        .flat_map(|v| v.iter().flat_map(|c| c.to_le_bytes()))
        .collect();
    gpu.memory_mut().write_bytes(VERTS, &verts).unwrap();
    gpu.memory_mut().write_words(LIST, &list_words()).unwrap();
    gpu
}

#[test]
fn test_resume_after_load_matches_original() {
    let stall = LIST + 7 * 4;

    let mut a = loaded_gpu();
    let id = a.enqueue_list(LIST, stall).unwrap();
    assert_eq!(a.lists().get(id).map(|l| l.state), Some(ListState::Stalled));
    let state = a.save_state();

    let mut b = loaded_gpu();
    b.load_state(&state).unwrap();
    assert_eq!(b.state().cmdmem, a.state().cmdmem);

    a.backend_mut().clear_calls();
    b.backend_mut().clear_calls();
    a.update_stall(id, 0).unwrap();
    b.update_stall(id, 0).unwrap();

    assert_eq!(a.list_sync(id).unwrap(), ListState::Completed);
    assert_eq!(b.list_sync(id).unwrap(), ListState::Completed);
    assert_eq!(b.state().cmdmem, a.state().cmdmem);
    // Bindings are rebuilt after a load; the draws themselves match.
    assert_eq!(draws(&b), draws(&a));
    assert_eq!(draws(&b).len(), 2);
    assert_eq!(b.stats().draw_calls, a.stats().draw_calls);
}

#[test]
fn test_resume_mid_batch_keeps_pending_draw() {
    // Stall right after the first PRIM, before anything forces a flush.
    let stall = LIST + 9 * 4;

    let mut a = loaded_gpu();
    let id = a.enqueue_list(LIST, stall).unwrap();
    assert_eq!(a.draw_engine().pending_draws(), 1);
    let state = a.save_state();

    let mut b = loaded_gpu();
    b.load_state(&state).unwrap();
    assert_eq!(b.draw_engine().pending_draws(), 1);

    a.backend_mut().clear_calls();
    b.backend_mut().clear_calls();
    a.update_stall(id, 0).unwrap();
    b.update_stall(id, 0).unwrap();

    assert_eq!(b.list_sync(id).unwrap(), ListState::Completed);
    assert_eq!(draws(&b), draws(&a));
    assert_eq!(draws(&b).len(), 2);
    assert_eq!(b.state().cmdmem, a.state().cmdmem);
}

#[test]
fn test_state_survives_json_text() {
    let mut a = loaded_gpu();
    a.enqueue_list(LIST, LIST + 4 * 4).unwrap();
    let text = serde_json::to_string(&a.save_state()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();

    let mut b = loaded_gpu();
    b.load_state(&value).unwrap();
    assert_eq!(b.lists().len(), 1);
    assert_eq!(b.save_state(), a.save_state());
}
