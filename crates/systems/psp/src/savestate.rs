//! JSON save states for the GE.
//!
//! A state covers the register file, the matrix banks, the derived context,
//! every display list and the batch of draws not yet submitted. Guest memory
//! and the presentation configuration are not part of it. The payload is
//! guarded by a CRC32 of its serialized bytes.

use crate::backend::DrawContext;
use crate::display_list::DisplayList;
use crate::draw_engine::{GePrimitive, PendingBatch};
use crate::gpu::PspGpu;
use crate::gstate::CLUT_BYTES;
use crate::GpuError;
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const STATE_VERSION: u64 = 1;
pub const STATE_SYSTEM: &str = "psp-ge";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GpuSnapshot {
    cmdmem: Vec<u32>,
    world_matrix: Vec<u32>,
    view_matrix: Vec<u32>,
    proj_matrix: Vec<u32>,
    tgen_matrix: Vec<u32>,
    bone_matrix: Vec<u32>,
    vertex_addr: u32,
    index_addr: u32,
    offset_addr: u32,
    texture_width: u32,
    texture_height: u32,
    clut: Vec<u8>,
    clut_loaded_bytes: u32,
    pc: u32,
    current_list: Option<usize>,
    prev_prim: u8,
    /// In queue order
    lists: Vec<DisplayList>,
    /// A list stalled mid-batch resumes onto these draws.
    batch: PendingBatch,
}

fn checksum(snapshot: &GpuSnapshot) -> Result<u32, GpuError> {
    let bytes = serde_json::to_vec(snapshot).map_err(|e| GpuError::State(e.to_string()))?;
    Ok(crc32fast::hash(&bytes))
}

fn snapshot<D: DrawContext>(gpu: &PspGpu<D>) -> GpuSnapshot {
    let g = &gpu.gstate;
    GpuSnapshot {
        cmdmem: g.cmdmem.to_vec(),
        world_matrix: g.world_matrix.to_vec(),
        view_matrix: g.view_matrix.to_vec(),
        proj_matrix: g.proj_matrix.to_vec(),
        tgen_matrix: g.tgen_matrix.to_vec(),
        bone_matrix: g.bone_matrix.to_vec(),
        vertex_addr: g.ctx.vertex_addr,
        index_addr: g.ctx.index_addr,
        offset_addr: g.ctx.offset_addr,
        texture_width: g.ctx.texture_width,
        texture_height: g.ctx.texture_height,
        clut: g.ctx.clut.clone(),
        clut_loaded_bytes: g.ctx.clut_loaded_bytes,
        pc: gpu.pc,
        current_list: gpu.current_list,
        prev_prim: gpu.prev_prim as u8,
        lists: gpu.lists.iter().cloned().collect(),
        batch: gpu.draw.pending_batch(),
    }
}

pub fn save<D: DrawContext>(gpu: &PspGpu<D>) -> Value {
    let snap = snapshot(gpu);
    let crc = match checksum(&snap) {
        Ok(crc) => crc,
        Err(e) => {
            log(LogCategory::GE, LogLevel::Error, || format!("Save state: {}", e));
            0
        }
    };
    json!({
        "version": STATE_VERSION,
        "system": STATE_SYSTEM,
        "crc32": crc,
        "gpu": snap,
    })
}

fn copy_into(dst: &mut [u32], src: &[u32], what: &str) -> Result<(), GpuError> {
    if dst.len() != src.len() {
        return Err(GpuError::StateLayout(format!(
            "{} has {} entries, expected {}",
            what,
            src.len(),
            dst.len()
        )));
    }
    dst.copy_from_slice(src);
    Ok(())
}

/// Restore a state produced by [`save`]. Nothing is changed unless the whole
/// state validates.
pub fn load<D: DrawContext>(gpu: &mut PspGpu<D>, v: &Value) -> Result<(), GpuError> {
    let version = v["version"].as_u64().unwrap_or(0);
    if version != STATE_VERSION {
        return Err(GpuError::State(format!("unsupported version {}", version)));
    }
    let system = v["system"].as_str().unwrap_or("");
    if system != STATE_SYSTEM {
        return Err(GpuError::State(format!("state is for '{}'", system)));
    }
    let stored = v["crc32"]
        .as_u64()
        .ok_or_else(|| GpuError::State("missing crc32".to_string()))? as u32;
    let snap: GpuSnapshot = serde_json::from_value(v["gpu"].clone())
        .map_err(|e| GpuError::State(e.to_string()))?;
    let computed = checksum(&snap)?;
    if stored != computed {
        return Err(GpuError::StateChecksum { stored, computed });
    }

    let prev_prim = GePrimitive::from_raw(snap.prev_prim).ok_or_else(|| {
        GpuError::StateLayout(format!("primitive type {}", snap.prev_prim))
    })?;
    if snap.clut.len() != CLUT_BYTES {
        return Err(GpuError::StateLayout(format!(
            "CLUT has {} bytes, expected {}",
            snap.clut.len(),
            CLUT_BYTES
        )));
    }
    snap.batch.decode()?;
    if let Some(id) = snap.current_list {
        if !snap.lists.iter().any(|l| l.id == id) {
            return Err(GpuError::StateLayout(format!("current list {} not saved", id)));
        }
    }

    // Validate every bank on a scratch copy before touching the GPU.
    let mut gstate = gpu.gstate.clone();
    copy_into(&mut gstate.cmdmem, &snap.cmdmem, "cmdmem")?;
    copy_into(&mut gstate.world_matrix, &snap.world_matrix, "world matrix")?;
    copy_into(&mut gstate.view_matrix, &snap.view_matrix, "view matrix")?;
    copy_into(&mut gstate.proj_matrix, &snap.proj_matrix, "projection matrix")?;
    copy_into(&mut gstate.tgen_matrix, &snap.tgen_matrix, "texgen matrix")?;
    copy_into(&mut gstate.bone_matrix, &snap.bone_matrix, "bone matrices")?;
    gstate.ctx.vertex_addr = snap.vertex_addr;
    gstate.ctx.index_addr = snap.index_addr;
    gstate.ctx.offset_addr = snap.offset_addr;
    gstate.ctx.texture_width = snap.texture_width;
    gstate.ctx.texture_height = snap.texture_height;
    gstate.ctx.clut = snap.clut;
    gstate.ctx.clut_loaded_bytes = snap.clut_loaded_bytes.min(CLUT_BYTES as u32);

    let mut lists = gpu.lists.clone();
    lists.restore(snap.lists)?;

    gpu.draw.discard();
    gpu.draw.invalidate_bindings();
    gpu.draw.restore_batch(snap.batch)?;
    gpu.gstate = gstate;
    gpu.gstate.mark_all_dirty();
    gpu.lists = lists;
    gpu.pc = snap.pc;
    gpu.current_list = snap.current_list;
    gpu.prev_prim = prev_prim;
    gpu.downcount = 0;
    log(LogCategory::GE, LogLevel::Info, || {
        format!("Loaded GE state with {} display lists", gpu.lists.len())
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessDrawContext;
    use crate::command::*;
    use crate::gstate::DirtyFlags;
    use crate::memory::RAM_BASE;
    use emu_core::System;

    fn gpu() -> PspGpu<HeadlessDrawContext> {
        PspGpu::with_backend(HeadlessDrawContext::new(480, 272))
    }

    #[test]
    fn test_save_load_restores_registers() {
        let mut a = gpu();
        a.execute_word(word(GE_CMD_FOGCOLOR, 0x123456));
        a.execute_word(word(GE_CMD_OFFSETADDR, 0x20));
        a.execute_word(word(GE_CMD_WORLDMATRIXNUMBER, 3));
        a.execute_word(word(GE_CMD_WORLDMATRIXDATA, to_float24(2.0)));
        let state = a.save_state();

        let mut b = gpu();
        b.load_state(&state).unwrap();
        assert_eq!(b.state().cmdmem, a.state().cmdmem);
        assert_eq!(b.state().world_matrix, a.state().world_matrix);
        assert_eq!(b.state().ctx.offset_addr, 0x2000);
        assert_eq!(b.state().dirty(), DirtyFlags::all());
    }

    #[test]
    fn test_stalled_list_survives() {
        let mut a = gpu();
        let list = RAM_BASE + 0x1000;
        a.memory_mut()
            .write_words(list, &[word(GE_CMD_FOGCOLOR, 1), word(GE_CMD_FINISH, 0), word(GE_CMD_END, 0)])
            .unwrap();
        let id = a.enqueue_list(list, list + 4).unwrap();
        let state = a.save_state();

        let mut b = gpu();
        b.load_state(&state).unwrap();
        let restored = b.lists().get(id).unwrap();
        assert_eq!(restored, a.lists().get(id).unwrap());
        assert_eq!(restored.pc, list + 4);
    }

    #[test]
    fn test_pending_draws_survive() {
        let mut a = gpu();
        let verts: Vec<u8> = [[0i16, 0, 0], [8, 0, 0], [0, 8, 0]]
            .iter()
            .flat_map(|v| v.iter().flat_map(|c| c.to_le_bytes()))
            .collect();
        let at = RAM_BASE + 0x2000;
        a.memory_mut().write_bytes(at, &verts).unwrap();
        a.execute_word(word(GE_CMD_BASE, 0x08_0000));
        a.execute_word(word(GE_CMD_VERTEXTYPE, (1 << 23) | (2 << 7)));
        a.execute_word(word(GE_CMD_VADDR, at & 0xFF_FFFF));
        a.execute_word(word(GE_CMD_PRIM, (3 << 16) | 3));
        assert_eq!(a.draw_engine().pending_draws(), 1);
        let state = a.save_state();

        let mut b = gpu();
        b.load_state(&state).unwrap();
        assert_eq!(b.draw_engine().pending_draws(), 1);
        assert_eq!(b.draw_engine().pending_batch(), a.draw_engine().pending_batch());
    }

    #[test]
    fn test_bad_pending_batch_rejected() {
        let a = gpu();
        let mut snap = snapshot(&a);
        snap.batch = PendingBatch {
            vertices: vec![0; 6],
            indices: vec![0, 1, 2],
            draws: 1,
            class: None,
        };
        let crc = checksum(&snap).unwrap();
        let state = json!({
            "version": STATE_VERSION,
            "system": STATE_SYSTEM,
            "crc32": crc,
            "gpu": snap,
        });

        let mut b = gpu();
        assert!(matches!(b.load_state(&state), Err(GpuError::StateLayout(_))));
        assert_eq!(b.draw_engine().pending_draws(), 0);
    }

    #[test]
    fn test_tampered_state_is_rejected() {
        let mut a = gpu();
        a.execute_word(word(GE_CMD_FOGCOLOR, 7));
        let mut state = a.save_state();
        state["gpu"]["vertex_addr"] = json!(0x1234);

        let mut b = gpu();
        let err = b.load_state(&state).unwrap_err();
        assert!(matches!(err, GpuError::StateChecksum { .. }));
        // Nothing was applied.
        assert_eq!(b.state().data(GE_CMD_FOGCOLOR), 0);
    }

    #[test]
    fn test_wrong_version_and_system() {
        let a = gpu();
        let mut b = gpu();

        let mut state = a.save_state();
        state["version"] = json!(99);
        assert!(matches!(b.load_state(&state), Err(GpuError::State(_))));

        let mut state = a.save_state();
        state["system"] = json!("nes");
        assert!(matches!(b.load_state(&state), Err(GpuError::State(_))));
    }

    #[test]
    fn test_layout_mismatch() {
        let a = gpu();
        let mut snap = snapshot(&a);
        snap.cmdmem.truncate(100);
        let crc = checksum(&snap).unwrap();
        let state = json!({
            "version": STATE_VERSION,
            "system": STATE_SYSTEM,
            "crc32": crc,
            "gpu": snap,
        });

        let mut b = gpu();
        assert!(matches!(b.load_state(&state), Err(GpuError::StateLayout(_))));
    }
}
