//! Command handlers.
//!
//! Each handler receives the full command word and its xor with the word
//! previously stored for the opcode. `cmdmem` already holds the new word when
//! a handler runs.

use crate::backend::DrawContext;
use crate::command::*;
use crate::display_list::{ListState, SignalBehavior, StackEntry, MAX_CALL_STACK};
use crate::draw_engine::GePrimitive;
use crate::gpu::PspGpu;
use crate::gstate::{DirtyFlags, CLUT_BYTES};
use crate::vertex::{
    read_index, DecodedVertex, VertexDecoder, VertexFormat, VTYPE_THROUGH,
    VTYPE_WEIGHTCOUNT_MASK,
};
use crate::GpuError;
use emu_core::logging::{log, LogCategory, LogLevel};

#[inline]
fn data(op: u32) -> u32 {
    op & 0x00FF_FFFF
}

// ----- Addresses -----

pub fn vaddr<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    gpu.gstate.ctx.vertex_addr = gpu.gstate.relative_address(data(op));
}

pub fn iaddr<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    gpu.gstate.ctx.index_addr = gpu.gstate.relative_address(data(op));
}

pub fn offset_addr<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    gpu.gstate.ctx.offset_addr = data(op) << 8;
}

pub fn origin<D: DrawContext>(gpu: &mut PspGpu<D>, _op: u32, _diff: u32) {
    gpu.gstate.ctx.offset_addr = gpu.pc;
}

// ----- Drawing -----

/// Vertices of one draw plus, for indexed draws, indices into them.
struct DrawData {
    vertices: Vec<DecodedVertex>,
    indices: Option<Vec<u16>>,
}

/// Read and decode `count` vertices (or indices) at the current addresses.
/// The whole source range is checked before anything is decoded.
fn read_draw<D: DrawContext>(gpu: &mut PspGpu<D>, count: usize) -> Result<DrawData, GpuError> {
    let fmt = VertexFormat::decode(gpu.gstate.vertex_type());
    let stride = fmt.stride() as usize;
    let bones: [[f32; 12]; 8] = std::array::from_fn(|n| gpu.gstate.bone_matrix_f32(n));
    let mut decoder = VertexDecoder::new(fmt, gpu.gstate.morph_weights());
    if gpu.config.software_skinning && fmt.has_weights() {
        decoder = decoder.with_skinning(&bones);
    }

    let vaddr = gpu.gstate.ctx.vertex_addr;
    if !fmt.is_indexed() {
        let bytes = gpu.mem.slice(vaddr, count * stride)?;
        let vertices = bytes
            .chunks_exact(stride)
            .map(|v| decoder.decode(v))
            .collect();
        gpu.gstate.ctx.vertex_addr = vaddr.wrapping_add((count * stride) as u32);
        return Ok(DrawData {
            vertices,
            indices: None,
        });
    }

    let index_size = fmt.index_size();
    let iaddr = gpu.gstate.ctx.index_addr;
    let ibytes = gpu.mem.slice(iaddr, count * index_size as usize)?;
    let raw: Vec<u32> = (0..count as u32)
        .map(|i| read_index(ibytes, index_size, i))
        .collect();
    let lower = raw.iter().copied().min().unwrap_or(0);
    let upper = raw.iter().copied().max().unwrap_or(0);
    let span = (upper - lower) as usize + 1;
    if span > u16::MAX as usize {
        return Err(GpuError::OutOfBoundsMemoryAccess {
            addr: vaddr,
            len: span * stride,
        });
    }
    let start = vaddr.wrapping_add(lower.wrapping_mul(stride as u32));
    let vbytes = gpu.mem.slice(start, span * stride)?;
    let vertices = vbytes
        .chunks_exact(stride)
        .map(|v| decoder.decode(v))
        .collect();
    gpu.gstate.ctx.index_addr = iaddr.wrapping_add(count as u32 * index_size);
    Ok(DrawData {
        vertices,
        indices: Some(raw.iter().map(|&i| (i - lower) as u16).collect()),
    })
}

fn queue_draw<D: DrawContext>(gpu: &mut PspGpu<D>, prim: GePrimitive, draw: DrawData) {
    let n = draw.vertices.len();
    if !gpu.draw.can_append(prim, n) {
        gpu.flush();
    }
    let dropped = gpu
        .draw
        .queue(prim, &draw.vertices, draw.indices.as_deref());
    gpu.stats.truncated_vertices += dropped as u64;
    gpu.stats.draw_calls += 1;
}

fn draw_failed<D: DrawContext>(gpu: &mut PspGpu<D>, what: &str, err: GpuError) {
    gpu.stats.memory_errors += 1;
    log(LogCategory::Draw, LogLevel::Warn, || {
        format!("{} at {:08x} skipped: {}", what, gpu.pc, err)
    });
}

pub fn prim<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    let d = data(op);
    let count = (d & 0xFFFF) as usize;
    let raw = ((d >> 16) & 7) as u8;
    let prim = if raw == GE_PRIM_KEEP_PREVIOUS {
        gpu.prev_prim
    } else {
        GePrimitive::from_raw(raw).unwrap_or(gpu.prev_prim)
    };
    gpu.prev_prim = prim;
    if count == 0 {
        return;
    }
    match read_draw(gpu, count) {
        Ok(draw) => queue_draw(gpu, prim, draw),
        Err(e) => draw_failed(gpu, "PRIM", e),
    }
}

/// Connect a `u` x `v` control grid as the patch primitive type asks.
fn patch_indices(u: usize, v: usize, prim: GePrimitive) -> Vec<u16> {
    let at = |x: usize, y: usize| (y * u + x) as u16;
    let mut out = Vec::new();
    match prim {
        GePrimitive::Points => out.extend((0..u * v).map(|i| i as u16)),
        GePrimitive::Lines => {
            for y in 0..v {
                for x in 0..u {
                    if x + 1 < u {
                        out.extend_from_slice(&[at(x, y), at(x + 1, y)]);
                    }
                    if y + 1 < v {
                        out.extend_from_slice(&[at(x, y), at(x, y + 1)]);
                    }
                }
            }
        }
        _ => {
            for y in 0..v.saturating_sub(1) {
                for x in 0..u.saturating_sub(1) {
                    out.extend_from_slice(&[
                        at(x, y),
                        at(x + 1, y),
                        at(x, y + 1),
                        at(x + 1, y),
                        at(x + 1, y + 1),
                        at(x, y + 1),
                    ]);
                }
            }
        }
    }
    out
}

/// Patches are drawn as their control mesh.
fn draw_patch<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, what: &str) {
    let d = data(op);
    let u = (d & 0xFF) as usize;
    let v = ((d >> 8) & 0xFF) as usize;
    if u < 2 || v < 2 {
        log(LogCategory::Draw, LogLevel::Debug, || {
            format!("{} with {}x{} control points ignored", what, u, v)
        });
        return;
    }
    let prim = GePrimitive::from_raw(gpu.gstate.patch_primitive()).unwrap_or(GePrimitive::Triangles);
    log(LogCategory::Stubs, LogLevel::Trace, || {
        format!("{} {}x{} drawn as control mesh", what, u, v)
    });
    match read_draw(gpu, u * v) {
        Ok(mut draw) => {
            let grid = patch_indices(u, v, prim);
            draw.indices = Some(match draw.indices {
                Some(lookup) => grid
                    .iter()
                    .filter_map(|&i| lookup.get(i as usize).copied())
                    .collect(),
                None => grid,
            });
            queue_draw(gpu, prim, draw);
        }
        Err(e) => draw_failed(gpu, what, e),
    }
}

pub fn bezier<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    draw_patch(gpu, op, "BEZIER");
}

pub fn spline<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    draw_patch(gpu, op, "SPLINE");
}

fn mul4(m: &[f32; 16], v: [f32; 4]) -> [f32; 4] {
    std::array::from_fn(|r| m[r] * v[0] + m[4 + r] * v[1] + m[8 + r] * v[2] + m[12 + r] * v[3])
}

fn mul4x3(m: &[f32; 12], p: [f32; 3]) -> [f32; 3] {
    std::array::from_fn(|r| m[r] * p[0] + m[3 + r] * p[1] + m[6 + r] * p[2] + m[9 + r])
}

/// Sets the list's bounding-box result: false when every vertex lies outside
/// the same clip plane.
pub fn bounding_box<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    let count = (data(op) & 0xFFFF) as usize;
    let saved = (gpu.gstate.ctx.vertex_addr, gpu.gstate.ctx.index_addr);
    let result = match read_draw(gpu, count) {
        Ok(draw) if !draw.vertices.is_empty() => {
            let world = gpu.gstate.world_matrix_f32();
            let view = gpu.gstate.view_matrix_f32();
            let proj = gpu.gstate.proj_matrix_f32();
            let mut outside = [true; 6];
            for v in &draw.vertices {
                let p = mul4x3(&view, mul4x3(&world, v.pos));
                let c = mul4(&proj, [p[0], p[1], p[2], 1.0]);
                let planes = [
                    c[0] < -c[3],
                    c[0] > c[3],
                    c[1] < -c[3],
                    c[1] > c[3],
                    c[2] < -c[3],
                    c[2] > c[3],
                ];
                for (o, p) in outside.iter_mut().zip(planes) {
                    *o &= p;
                }
            }
            !outside.iter().any(|&o| o)
        }
        Ok(_) => true,
        Err(e) => {
            draw_failed(gpu, "BOUNDINGBOX", e);
            true
        }
    };
    // The test reads vertices without consuming them.
    (gpu.gstate.ctx.vertex_addr, gpu.gstate.ctx.index_addr) = saved;
    if let Some(list) = gpu.current_list.and_then(|id| gpu.lists.get_mut(id)) {
        list.bbox_result = result;
    }
}

// ----- Flow control -----

fn jump_target<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, what: &str) -> Option<u32> {
    let target = gpu.gstate.relative_address(data(op)) & 0x0FFF_FFFC;
    if gpu.mem.is_valid_address(target) {
        Some(target)
    } else {
        gpu.stats.memory_errors += 1;
        log(LogCategory::DisplayList, LogLevel::Error, || {
            format!("{} to invalid address {:08x} ignored", what, target)
        });
        None
    }
}

pub fn jump<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    if let Some(target) = jump_target(gpu, op, "JUMP") {
        gpu.jump_to(target);
    }
}

pub fn bjump<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    let inside = gpu
        .current_list
        .and_then(|id| gpu.lists.get(id))
        .map(|l| l.bbox_result)
        .unwrap_or(true);
    if !inside {
        if let Some(target) = jump_target(gpu, op, "BJUMP") {
            gpu.jump_to(target);
        }
    }
}

fn push_call<D: DrawContext>(gpu: &mut PspGpu<D>, target: u32) {
    let entry = StackEntry {
        pc: gpu.pc.wrapping_add(4),
        offset_addr: gpu.gstate.ctx.offset_addr,
        base_addr: gpu.gstate.data(GE_CMD_BASE),
    };
    let Some(list) = gpu.current_list.and_then(|id| gpu.lists.get_mut(id)) else {
        return;
    };
    if list.stack.len() >= MAX_CALL_STACK {
        log(LogCategory::DisplayList, LogLevel::Error, || {
            format!("CALL stack overflow in list {}, ignored", list.id)
        });
        return;
    }
    list.stack.push(entry);
    gpu.jump_to(target);
}

fn pop_call<D: DrawContext>(gpu: &mut PspGpu<D>) {
    let Some(list) = gpu.current_list.and_then(|id| gpu.lists.get_mut(id)) else {
        return;
    };
    match list.stack.pop() {
        Some(entry) => {
            gpu.gstate.ctx.offset_addr = entry.offset_addr;
            gpu.gstate.cmdmem[GE_CMD_BASE as usize] = word(GE_CMD_BASE, entry.base_addr);
            gpu.jump_to(entry.pc);
        }
        None => log(LogCategory::DisplayList, LogLevel::Warn, || {
            "RET with empty call stack ignored".to_string()
        }),
    }
}

pub fn call<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    if let Some(target) = jump_target(gpu, op, "CALL") {
        push_call(gpu, target);
    }
}

pub fn ret<D: DrawContext>(gpu: &mut PspGpu<D>, _op: u32, _diff: u32) {
    pop_call(gpu);
}

pub fn signal<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    gpu.stats.signals += 1;
    if let Some(list) = gpu.current_list.and_then(|id| gpu.lists.get_mut(id)) {
        list.signal_data = data(op) & 0xFFFF;
    }
}

pub fn finish<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    if let Some(list) = gpu.current_list.and_then(|id| gpu.lists.get_mut(id)) {
        list.signal_data = data(op) & 0xFFFF;
    }
    log(LogCategory::DisplayList, LogLevel::Trace, || {
        format!("FINISH at {:08x}", gpu.pc)
    });
}

/// END completes the list, or carries out the SIGNAL just before it.
pub fn end<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    let prev = gpu.mem.read_u32(gpu.pc.wrapping_sub(4)).unwrap_or(0);
    match (prev >> 24) as u8 {
        GE_CMD_SIGNAL => apply_signal(gpu, data(prev), data(op)),
        GE_CMD_FINISH => gpu.complete_current_list(),
        _ => {
            log(LogCategory::DisplayList, LogLevel::Debug, || {
                format!("END at {:08x} without FINISH; completing list", gpu.pc)
            });
            gpu.complete_current_list();
        }
    }
}

fn apply_signal<D: DrawContext>(gpu: &mut PspGpu<D>, signal: u32, end: u32) {
    let behavior = SignalBehavior::from_signal(signal);
    // Jump and call signals split the target across the two words.
    let target = (((signal & 0xFFFF) << 16) | (end & 0xFFFF)) & 0x0FFF_FFFC;
    let signal_pc = gpu.pc.wrapping_sub(4);
    let origin = gpu.gstate.ctx.offset_addr;
    log(LogCategory::DisplayList, LogLevel::Debug, || {
        format!("Signal {:?} at {:08x}", behavior, signal_pc)
    });
    match behavior {
        SignalBehavior::Suspend | SignalBehavior::Continue => {
            if let Some(list) = gpu.current_list.and_then(|id| gpu.lists.get_mut(id)) {
                list.interrupt_pending = true;
            }
        }
        SignalBehavior::Pause => {
            if let Some(list) = gpu.current_list.and_then(|id| gpu.lists.get_mut(id)) {
                list.state = ListState::Paused;
            }
            gpu.break_run();
        }
        SignalBehavior::Sync => {
            gpu.flush();
        }
        SignalBehavior::Jump => signal_jump(gpu, target, false),
        SignalBehavior::RelativeJump => signal_jump(gpu, signal_pc.wrapping_add(target), false),
        SignalBehavior::OriginJump => signal_jump(gpu, origin.wrapping_add(target), false),
        SignalBehavior::Call => signal_jump(gpu, target, true),
        SignalBehavior::RelativeCall => signal_jump(gpu, signal_pc.wrapping_add(target), true),
        SignalBehavior::OriginCall => signal_jump(gpu, origin.wrapping_add(target), true),
        SignalBehavior::Ret => pop_call(gpu),
        SignalBehavior::Other(b) => log(LogCategory::Stubs, LogLevel::Warn, || {
            format!("Unhandled signal behavior {:#04x}", b)
        }),
    }
}

fn signal_jump<D: DrawContext>(gpu: &mut PspGpu<D>, target: u32, call: bool) {
    let target = target & 0x0FFF_FFFC;
    if !gpu.mem.is_valid_address(target) {
        gpu.stats.memory_errors += 1;
        log(LogCategory::DisplayList, LogLevel::Error, || {
            format!("Signal target {:08x} invalid, ignored", target)
        });
        return;
    }
    if call {
        push_call(gpu, target);
    } else {
        gpu.jump_to(target);
    }
}

// ----- Vertex type -----

fn vertex_type_dirty<D: DrawContext>(gpu: &mut PspGpu<D>, diff: u32) {
    let mut dirty = DirtyFlags::UVSCALEOFFSET;
    if diff & VTYPE_THROUGH != 0 {
        dirty |= DirtyFlags::VERTEXSHADER_STATE
            | DirtyFlags::RASTER_STATE
            | DirtyFlags::VIEWPORTSCISSOR_STATE
            | DirtyFlags::PROJTHROUGHMATRIX
            | DirtyFlags::PROJMATRIX
            | DirtyFlags::CULLRANGE;
    }
    gpu.gstate.mark_dirty(dirty);
}

pub fn vertex_type<D: DrawContext>(gpu: &mut PspGpu<D>, _op: u32, diff: u32) {
    vertex_type_dirty(gpu, diff);
}

/// With CPU skinning a weight count change alone leaves batching intact.
pub fn vertex_type_skinning<D: DrawContext>(gpu: &mut PspGpu<D>, _op: u32, diff: u32) {
    if diff & !VTYPE_WEIGHTCOUNT_MASK != 0 {
        // Pending draws flush under the old vertex type.
        let slot = GE_CMD_VERTEXTYPE as usize;
        gpu.gstate.cmdmem[slot] ^= diff;
        gpu.flush();
        gpu.gstate.cmdmem[slot] ^= diff;
    }
    vertex_type_dirty(gpu, diff);
}

// ----- Matrices -----

/// Write one matrix element at the cursor held in `num_cmd`, then advance it.
/// Returns the written index when the value changed.
fn matrix_data<D: DrawContext>(
    gpu: &mut PspGpu<D>,
    op: u32,
    num_cmd: u8,
    mask: u32,
    len: usize,
) -> Option<usize> {
    let num = gpu.gstate.data(num_cmd) & mask;
    gpu.gstate.cmdmem[num_cmd as usize] = word(num_cmd, (num + 1) & mask);
    let index = num as usize;
    if index >= len {
        return None;
    }
    let bits = data(op) << 8;
    let current = match num_cmd {
        GE_CMD_WORLDMATRIXNUMBER => gpu.gstate.world_matrix[index],
        GE_CMD_VIEWMATRIXNUMBER => gpu.gstate.view_matrix[index],
        GE_CMD_PROJMATRIXNUMBER => gpu.gstate.proj_matrix[index],
        GE_CMD_TGENMATRIXNUMBER => gpu.gstate.tgen_matrix[index],
        _ => gpu.gstate.bone_matrix[index],
    };
    if current == bits {
        return None;
    }
    // Bones are applied at decode time under CPU skinning, so queued
    // vertices are already final.
    if !(num_cmd == GE_CMD_BONEMATRIXNUMBER && gpu.config.software_skinning) {
        gpu.flush();
    }
    let slot = match num_cmd {
        GE_CMD_WORLDMATRIXNUMBER => &mut gpu.gstate.world_matrix[index],
        GE_CMD_VIEWMATRIXNUMBER => &mut gpu.gstate.view_matrix[index],
        GE_CMD_PROJMATRIXNUMBER => &mut gpu.gstate.proj_matrix[index],
        GE_CMD_TGENMATRIXNUMBER => &mut gpu.gstate.tgen_matrix[index],
        _ => &mut gpu.gstate.bone_matrix[index],
    };
    *slot = bits;
    Some(index)
}

fn matrix_num<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, num_cmd: u8, mask: u32) {
    gpu.gstate.cmdmem[num_cmd as usize] = word(num_cmd, data(op) & mask);
}

pub fn world_mtx_num<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    matrix_num(gpu, op, GE_CMD_WORLDMATRIXNUMBER, 0xF);
}

pub fn world_mtx_data<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    if matrix_data(gpu, op, GE_CMD_WORLDMATRIXNUMBER, 0xF, 12).is_some() {
        gpu.gstate.mark_dirty(DirtyFlags::WORLDMATRIX);
    }
}

pub fn view_mtx_num<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    matrix_num(gpu, op, GE_CMD_VIEWMATRIXNUMBER, 0xF);
}

pub fn view_mtx_data<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    if matrix_data(gpu, op, GE_CMD_VIEWMATRIXNUMBER, 0xF, 12).is_some() {
        gpu.gstate.mark_dirty(DirtyFlags::VIEWMATRIX | DirtyFlags::CULLRANGE);
    }
}

pub fn proj_mtx_num<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    matrix_num(gpu, op, GE_CMD_PROJMATRIXNUMBER, 0xF);
}

pub fn proj_mtx_data<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    if matrix_data(gpu, op, GE_CMD_PROJMATRIXNUMBER, 0xF, 16).is_some() {
        gpu.gstate.mark_dirty(DirtyFlags::PROJMATRIX | DirtyFlags::CULLRANGE);
    }
}

pub fn tgen_mtx_num<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    matrix_num(gpu, op, GE_CMD_TGENMATRIXNUMBER, 0xF);
}

pub fn tgen_mtx_data<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    if matrix_data(gpu, op, GE_CMD_TGENMATRIXNUMBER, 0xF, 12).is_some() {
        gpu.gstate.mark_dirty(DirtyFlags::TEXMATRIX);
    }
}

pub fn bone_mtx_num<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    matrix_num(gpu, op, GE_CMD_BONEMATRIXNUMBER, 0x7F);
}

pub fn bone_mtx_data<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    if let Some(index) = matrix_data(gpu, op, GE_CMD_BONEMATRIXNUMBER, 0x7F, 96) {
        gpu.gstate.mark_dirty(DirtyFlags::bone((index / 12) as u32));
    }
}

// ----- Textures and transfers -----

pub fn tex_size0<D: DrawContext>(gpu: &mut PspGpu<D>, _op: u32, diff: u32) {
    let (w, h) = gpu.gstate.texture_size(0);
    gpu.gstate.ctx.texture_width = w;
    gpu.gstate.ctx.texture_height = h;
    if diff != 0 {
        gpu.gstate
            .mark_dirty(DirtyFlags::TEXTURE_IMAGE | DirtyFlags::UVSCALEOFFSET);
    }
}

/// Copy `(data & 0x3F) * 32` bytes of palette from CLUTADDR.
pub fn load_clut<D: DrawContext>(gpu: &mut PspGpu<D>, op: u32, _diff: u32) {
    let bytes = (((data(op) & 0x3F) * 32) as usize).min(CLUT_BYTES);
    let addr = gpu.gstate.clut_address();
    match gpu.mem.slice(addr, bytes) {
        Ok(src) => {
            gpu.gstate.ctx.clut[..bytes].copy_from_slice(src);
            gpu.gstate.ctx.clut_loaded_bytes = bytes as u32;
        }
        Err(e) => {
            gpu.stats.memory_errors += 1;
            gpu.gstate.ctx.clut_loaded_bytes = 0;
            log(LogCategory::GE, LogLevel::Warn, || {
                format!("LOADCLUT failed: {}", e)
            });
        }
    }
    gpu.gstate
        .mark_dirty(DirtyFlags::TEXTURE_IMAGE | DirtyFlags::DEPAL);
}

pub fn tex_flush<D: DrawContext>(gpu: &mut PspGpu<D>, _op: u32, _diff: u32) {
    gpu.gstate.mark_dirty(DirtyFlags::TEXTURE_IMAGE);
}

/// Rectangle copy inside guest memory.
pub fn block_transfer_start<D: DrawContext>(gpu: &mut PspGpu<D>, _op: u32, _diff: u32) {
    let t = gpu.gstate.transfer();
    let row_bytes = (t.width * t.bpp) as usize;
    log(LogCategory::GE, LogLevel::Debug, || {
        format!(
            "Block transfer {:08x} -> {:08x}, {}x{} at {} bpp",
            t.src, t.dst, t.width, t.height, t.bpp
        )
    });
    for y in 0..t.height {
        let src = t.src.wrapping_add(((t.src_y + y) * t.src_stride + t.src_x) * t.bpp);
        let dst = t.dst.wrapping_add(((t.dst_y + y) * t.dst_stride + t.dst_x) * t.bpp);
        if let Err(e) = gpu.mem.copy(dst, src, row_bytes) {
            gpu.stats.memory_errors += 1;
            log(LogCategory::GE, LogLevel::Warn, || {
                format!("Block transfer row {} failed: {}", y, e)
            });
            break;
        }
    }
    gpu.stats.block_transfers += 1;
    // The destination may hold a texture.
    gpu.gstate.mark_dirty(DirtyFlags::TEXTURE_IMAGE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessDrawContext;
    use crate::memory::RAM_BASE;

    const LIST: u32 = RAM_BASE + 0x1000;
    const VERTS: u32 = RAM_BASE + 0x2000;
    const INDICES: u32 = RAM_BASE + 0x3000;

    fn gpu() -> PspGpu<HeadlessDrawContext> {
        let mut gpu = PspGpu::with_backend(HeadlessDrawContext::new(480, 272));
        for w in [
            word(GE_CMD_FRAMEBUFPTR, 0),
            word(GE_CMD_FRAMEBUFWIDTH, 512),
            word(GE_CMD_SCISSOR2, 479 | (271 << 10)),
            word(GE_CMD_REGION2, 479 | (271 << 10)),
            word(GE_CMD_BASE, 0x08_0000),
        ] {
            gpu.execute_word(w);
        }
        gpu
    }

    /// Through-mode vertices with 16-bit positions: 6 bytes each.
    fn through_vtype() -> u32 {
        VTYPE_THROUGH | (2 << 7)
    }

    fn write_through_verts(gpu: &mut PspGpu<HeadlessDrawContext>, verts: &[[i16; 3]]) {
        let bytes: Vec<u8> = verts
            .iter()
            .flat_map(|v| v.iter().flat_map(|c| c.to_le_bytes()))
            .collect();
        gpu.memory_mut().write_bytes(VERTS, &bytes).unwrap();
    }

    #[test]
    fn test_vaddr_uses_base_and_offset() {
        let mut gpu = gpu();
        gpu.execute_word(word(GE_CMD_VADDR, 0x00_2000));
        assert_eq!(gpu.state().ctx.vertex_addr, VERTS);
        gpu.execute_word(word(GE_CMD_OFFSETADDR, 0x10));
        gpu.execute_word(word(GE_CMD_IADDR, 0x00_2000));
        assert_eq!(gpu.state().ctx.index_addr, VERTS + 0x1000);
    }

    #[test]
    fn test_prim_queues_and_advances_vertex_address() {
        let mut gpu = gpu();
        write_through_verts(&mut gpu, &[[0, 0, 0], [10, 0, 0], [0, 10, 0]]);
        gpu.execute_word(word(GE_CMD_VERTEXTYPE, through_vtype()));
        gpu.execute_word(word(GE_CMD_VADDR, VERTS & 0xFF_FFFF));
        gpu.execute_word(word(GE_CMD_PRIM, (3 << 16) | 3));

        assert_eq!(gpu.draw_engine().pending_draws(), 1);
        assert_eq!(gpu.state().ctx.vertex_addr, VERTS + 18);
        assert!(gpu.flush().submitted);
        assert_eq!(gpu.backend().draw_count(), 1);
    }

    #[test]
    fn test_prim_keep_previous_type() {
        let mut gpu = gpu();
        write_through_verts(&mut gpu, &[[0, 0, 0]; 4]);
        gpu.execute_word(word(GE_CMD_VERTEXTYPE, through_vtype()));
        gpu.execute_word(word(GE_CMD_VADDR, VERTS & 0xFF_FFFF));
        gpu.execute_word(word(GE_CMD_PRIM, (1 << 16) | 2));
        gpu.execute_word(word(GE_CMD_VADDR, VERTS & 0xFF_FFFF));
        gpu.execute_word(word(GE_CMD_PRIM, (7 << 16) | 2));
        assert_eq!(gpu.prev_prim, GePrimitive::Lines);
        assert_eq!(gpu.draw_engine().pending_draws(), 2);
    }

    #[test]
    fn test_indexed_prim() {
        let mut gpu = gpu();
        write_through_verts(&mut gpu, &[[0, 0, 0], [10, 0, 0], [0, 10, 0], [10, 10, 0]]);
        gpu.memory_mut().write_bytes(INDICES, &[1, 2, 3]).unwrap();
        gpu.execute_word(word(GE_CMD_VERTEXTYPE, through_vtype() | (1 << 11)));
        gpu.execute_word(word(GE_CMD_VADDR, VERTS & 0xFF_FFFF));
        gpu.execute_word(word(GE_CMD_IADDR, INDICES & 0xFF_FFFF));
        gpu.execute_word(word(GE_CMD_PRIM, (3 << 16) | 3));

        // Only vertices 1..=3 are decoded.
        assert_eq!(gpu.draw_engine().pending_vertices(), 3);
        assert_eq!(gpu.state().ctx.index_addr, INDICES + 3);
        assert_eq!(gpu.state().ctx.vertex_addr, VERTS);
    }

    #[test]
    fn test_out_of_range_prim_is_skipped() {
        let mut gpu = gpu();
        gpu.execute_word(word(GE_CMD_VERTEXTYPE, through_vtype()));
        gpu.state_mut().ctx.vertex_addr = RAM_BASE + 0x01FF_FFF0;
        gpu.execute_word(word(GE_CMD_PRIM, (3 << 16) | 30));
        assert_eq!(gpu.draw_engine().pending_draws(), 0);
        assert_eq!(gpu.stats().memory_errors, 1);
    }

    #[test]
    fn test_class_change_flushes() {
        let mut gpu = gpu();
        write_through_verts(&mut gpu, &[[0, 0, 0]; 3]);
        gpu.execute_word(word(GE_CMD_VERTEXTYPE, through_vtype()));
        gpu.execute_word(word(GE_CMD_VADDR, VERTS & 0xFF_FFFF));
        gpu.execute_word(word(GE_CMD_PRIM, (3 << 16) | 3));
        gpu.execute_word(word(GE_CMD_VADDR, VERTS & 0xFF_FFFF));
        gpu.execute_word(word(GE_CMD_PRIM, (1 << 16) | 2));
        assert_eq!(gpu.backend().draw_count(), 1);
        assert_eq!(gpu.draw_engine().pending_draws(), 1);
    }

    #[test]
    fn test_state_change_flushes_before_write() {
        let mut gpu = gpu();
        write_through_verts(&mut gpu, &[[0, 0, 0]; 3]);
        gpu.execute_word(word(GE_CMD_VERTEXTYPE, through_vtype()));
        gpu.execute_word(word(GE_CMD_VADDR, VERTS & 0xFF_FFFF));
        gpu.execute_word(word(GE_CMD_PRIM, (3 << 16) | 3));
        // Same value: no flush.
        gpu.execute_word(word(GE_CMD_ZTEST, 0));
        assert_eq!(gpu.draw_engine().pending_draws(), 1);
        gpu.execute_word(word(GE_CMD_ZTEST, 4));
        assert_eq!(gpu.draw_engine().pending_draws(), 0);
        assert_eq!(gpu.backend().draw_count(), 1);
    }

    #[test]
    fn test_matrix_upload_advances_cursor() {
        let mut gpu = gpu();
        gpu.execute_word(word(GE_CMD_WORLDMATRIXNUMBER, 0));
        for i in 0..12 {
            gpu.execute_word(word(GE_CMD_WORLDMATRIXDATA, to_float24(i as f32)));
        }
        let m = gpu.state().world_matrix_f32();
        assert_eq!(m[0], 0.0);
        assert_eq!(m[11], 11.0);
        assert_eq!(gpu.state().data(GE_CMD_WORLDMATRIXNUMBER), 12);

        // Past the end is ignored.
        gpu.execute_word(word(GE_CMD_WORLDMATRIXDATA, to_float24(5.0)));
        assert_eq!(gpu.state().world_matrix_f32()[0], 0.0);
    }

    #[test]
    fn test_bone_upload_marks_bone() {
        let mut gpu = gpu();
        gpu.state_mut().clear_dirty(DirtyFlags::all());
        gpu.execute_word(word(GE_CMD_BONEMATRIXNUMBER, 24));
        gpu.execute_word(word(GE_CMD_BONEMATRIXDATA, to_float24(1.0)));
        assert_eq!(gpu.state().dirty(), DirtyFlags::BONEMATRIX2);
        assert_eq!(gpu.state().bone_matrix_f32(2)[0], 1.0);
    }

    #[test]
    fn test_load_clut() {
        let mut gpu = gpu();
        gpu.memory_mut()
            .write_words(RAM_BASE + 0x4000, &[0xFF00_00FF, 0xFF00_FF00])
            .unwrap();
        gpu.execute_word(word(GE_CMD_CLUTADDR, 0x00_4000));
        gpu.execute_word(word(GE_CMD_CLUTADDRUPPER, 0x08_0000));
        gpu.execute_word(word(GE_CMD_LOADCLUT, 1));
        assert_eq!(gpu.state().ctx.clut_loaded_bytes, 32);
        assert_eq!(&gpu.state().ctx.clut[..4], &0xFF00_00FFu32.to_le_bytes());
    }

    #[test]
    fn test_block_transfer() {
        let mut gpu = gpu();
        let src = RAM_BASE + 0x10_0000;
        let dst = RAM_BASE + 0x20_0000;
        let pixels: Vec<u32> = (1..=16).collect();
        gpu.memory_mut().write_words(src, &pixels).unwrap();
        for w in [
            word(GE_CMD_TRANSFERSRC, src & 0xFF_FFF0),
            word(GE_CMD_TRANSFERSRCW, ((src >> 8) & 0xFF_0000) | 8),
            word(GE_CMD_TRANSFERDST, dst & 0xFF_FFF0),
            word(GE_CMD_TRANSFERDSTW, ((dst >> 8) & 0xFF_0000) | 8),
            word(GE_CMD_TRANSFERSIZE, 1 | (1 << 10)),
            word(GE_CMD_TRANSFERSTART, 1),
        ] {
            gpu.execute_word(w);
        }
        assert_eq!(gpu.memory().read_u32(dst).unwrap(), 1);
        assert_eq!(gpu.memory().read_u32(dst + 4).unwrap(), 2);
        assert_eq!(gpu.memory().read_u32(dst + 32).unwrap(), 1 + 8);
        assert_eq!(gpu.stats().block_transfers, 1);
    }

    #[test]
    fn test_bounding_box_and_bjump() {
        let mut gpu = gpu();
        // Identity world/view, projection scaled so everything lands at x = 10w.
        for (num, dat, n, scale) in [
            (GE_CMD_WORLDMATRIXNUMBER, GE_CMD_WORLDMATRIXDATA, 12, 1.0),
            (GE_CMD_VIEWMATRIXNUMBER, GE_CMD_VIEWMATRIXDATA, 12, 1.0),
        ] {
            gpu.execute_word(word(num, 0));
            for i in 0..n {
                let v = if i % 4 == 0 && i < 9 { scale } else { 0.0 };
                gpu.execute_word(word(dat, to_float24(v)));
            }
        }
        gpu.execute_word(word(GE_CMD_PROJMATRIXNUMBER, 0));
        for i in 0..16 {
            let v = match i {
                5 | 10 | 15 => 1.0,
                12 => 10.0,
                _ => 0.0,
            };
            gpu.execute_word(word(GE_CMD_PROJMATRIXDATA, to_float24(v)));
        }
        // One float position vertex at the origin.
        gpu.memory_mut().write_bytes(VERTS, &[0; 12]).unwrap();
        let target = LIST + 0x40;
        let words = [
            word(GE_CMD_VERTEXTYPE, 3 << 7),
            word(GE_CMD_VADDR, VERTS & 0xFF_FFFF),
            word(GE_CMD_BOUNDINGBOX, 1),
            word(GE_CMD_BJUMP, target & 0xFF_FFFF),
            word(GE_CMD_FOGCOLOR, 1),
            word(GE_CMD_FINISH, 0),
            word(GE_CMD_END, 0),
        ];
        gpu.memory_mut().write_words(LIST, &words).unwrap();
        gpu.memory_mut()
            .write_words(target, &[word(GE_CMD_FOGCOLOR, 2), word(GE_CMD_FINISH, 0), word(GE_CMD_END, 0)])
            .unwrap();

        gpu.enqueue_list(LIST, 0).unwrap();
        assert_eq!(gpu.state().data(GE_CMD_FOGCOLOR), 2);
        assert_eq!(gpu.state().ctx.vertex_addr, VERTS);
    }

    #[test]
    fn test_skinning_weight_change_keeps_batch() {
        let mut gpu = gpu();
        write_through_verts(&mut gpu, &[[0, 0, 0]; 3]);
        gpu.execute_word(word(GE_CMD_VERTEXTYPE, through_vtype()));
        gpu.execute_word(word(GE_CMD_VADDR, VERTS & 0xFF_FFFF));
        gpu.execute_word(word(GE_CMD_PRIM, (3 << 16) | 3));

        gpu.execute_word(word(GE_CMD_VERTEXTYPE, through_vtype() | (2 << 14)));
        assert_eq!(gpu.draw_engine().pending_draws(), 1);
        gpu.execute_word(word(GE_CMD_VERTEXTYPE, (2 << 7) | (2 << 14)));
        assert_eq!(gpu.draw_engine().pending_draws(), 0);
    }

    #[test]
    fn test_patch_grid_indices() {
        let tris = patch_indices(3, 2, GePrimitive::Triangles);
        assert_eq!(tris.len(), 12);
        assert_eq!(&tris[..6], &[0, 1, 3, 1, 4, 3]);
        let lines = patch_indices(2, 2, GePrimitive::Lines);
        assert_eq!(lines.len(), 8);
    }
}
