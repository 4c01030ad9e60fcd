//! Draw batching and submission.
//!
//! PRIM commands decode their vertices straight into the pending batch.
//! Consecutive draws of the same primitive class share one backend
//! submission; anything that could change how they render flushes first.
//!
//! On flush only the dirty objects are rebuilt:
//!
//! | group | rebuilt from |
//! |---|---|
//! | `FRAMEBUF` | [`FramebufferManager::set_render_framebuffer`] |
//! | `PIPELINE` | blend, depth and cull registers, cached by [`PipelineKey`] |
//! | `TEXTURE` | texture registers and guest memory, only while texturing is on |
//! | `VIEWPORT` | viewport, screen offset, scissor and depth range |
//! | `UNIFORMS` | matrices, fog, texture environment |
//!
//! Exactly the rebuilt bits are cleared, and the cleared set is reported.

use crate::backend::{
    BlendFactor, BlendOp, BlendState, BufferHandle, BufferUsage, CompareFunc, CullMode,
    DepthStencilState, DrawContext, FramebufferHandle, PipelineDesc, PipelineHandle,
    RenderPassLoad, SamplerDesc, SamplerHandle, ScissorRect, ShaderHandle, ShaderLanguage,
    ShaderStage, TextureHandle, Topology, VertexAttrFormat, VertexAttribute, VertexLayout,
    Viewport,
};
use crate::command::*;
use crate::framebuffer::FramebufferManager;
use crate::gstate::{DirtyFlags, GpuStateStore};
use crate::memory::GuestMemory;
use crate::texture::decode_texture;
use crate::vertex::{DecodedVertex, DECODED_VERTEX_SIZE};
use crate::{GpuError, GpuStats};
use bytemuck::{Pod, Zeroable};
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Draw calls a batch holds before it is flushed.
pub const MAX_DEFERRED_DRAWS: usize = 128;
/// Vertices a batch holds before it is flushed.
pub const VERTEX_BUFFER_MAX: usize = 65536;
/// Strips and fans produce at most three indices per vertex.
const INDEX_BUFFER_MAX: usize = VERTEX_BUFFER_MAX * 3;

const DRAW_VERTEX: &str = include_str!("../shaders/ge_draw.vert");
const DRAW_FRAGMENT: &str = include_str!("../shaders/ge_draw.frag");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GePrimitive {
    Points = 0,
    Lines = 1,
    LineStrip = 2,
    Triangles = 3,
    TriangleStrip = 4,
    TriangleFan = 5,
    Rectangles = 6,
}

impl GePrimitive {
    /// `None` for 7, which means "keep the previous type".
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => GePrimitive::Points,
            1 => GePrimitive::Lines,
            2 => GePrimitive::LineStrip,
            3 => GePrimitive::Triangles,
            4 => GePrimitive::TriangleStrip,
            5 => GePrimitive::TriangleFan,
            6 => GePrimitive::Rectangles,
            _ => return None,
        })
    }

    pub fn class(self) -> PrimClass {
        match self {
            GePrimitive::Points => PrimClass::Points,
            GePrimitive::Lines | GePrimitive::LineStrip => PrimClass::Lines,
            GePrimitive::Triangles | GePrimitive::TriangleStrip | GePrimitive::TriangleFan => {
                PrimClass::Triangles
            }
            GePrimitive::Rectangles => PrimClass::Rectangles,
        }
    }
}

/// Draws of one class can share a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimClass {
    Points,
    Lines,
    Triangles,
    Rectangles,
}

impl PrimClass {
    pub fn topology(self) -> Topology {
        match self {
            PrimClass::Points => Topology::Points,
            PrimClass::Lines => Topology::Lines,
            PrimClass::Triangles | PrimClass::Rectangles => Topology::Triangles,
        }
    }
}

/// Converts primitive vertex sequences into list indices.
#[derive(Debug, Default)]
pub struct IndexGenerator {
    indices: Vec<u16>,
}

impl IndexGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.indices.clear();
    }

    pub fn indices(&self) -> &[u16] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// `count` consecutive vertices starting at `base`.
    pub fn add_prim(&mut self, prim: GePrimitive, base: u16, count: usize) {
        let seq: Vec<u16> = (0..count).map(|i| base.wrapping_add(i as u16)).collect();
        self.add_sequence(prim, &seq);
    }

    /// Vertices `base + local[i]`, in `local` order.
    pub fn translate_prim(&mut self, prim: GePrimitive, base: u16, local: &[u16]) {
        let seq: Vec<u16> = local.iter().map(|&i| base.wrapping_add(i)).collect();
        self.add_sequence(prim, &seq);
    }

    /// Two triangles for each group of four vertices from `base`.
    pub fn add_quads(&mut self, base: u16, quads: usize) {
        for q in 0..quads {
            let b = base.wrapping_add((q * 4) as u16);
            self.indices.extend_from_slice(&[
                b,
                b.wrapping_add(1),
                b.wrapping_add(2),
                b,
                b.wrapping_add(2),
                b.wrapping_add(3),
            ]);
        }
    }

    fn add_sequence(&mut self, prim: GePrimitive, v: &[u16]) {
        let n = v.len();
        match prim {
            GePrimitive::Points => self.indices.extend_from_slice(v),
            GePrimitive::Lines => {
                for pair in v.chunks_exact(2) {
                    self.indices.extend_from_slice(pair);
                }
            }
            GePrimitive::LineStrip => {
                for w in v.windows(2) {
                    self.indices.extend_from_slice(w);
                }
            }
            GePrimitive::Triangles => {
                for tri in v.chunks_exact(3) {
                    self.indices.extend_from_slice(tri);
                }
            }
            GePrimitive::TriangleStrip => {
                for i in 0..n.saturating_sub(2) {
                    // Odd triangles swap their first two vertices to keep winding.
                    if i & 1 == 0 {
                        self.indices.extend_from_slice(&[v[i], v[i + 1], v[i + 2]]);
                    } else {
                        self.indices.extend_from_slice(&[v[i + 1], v[i], v[i + 2]]);
                    }
                }
            }
            GePrimitive::TriangleFan => {
                for i in 1..n.saturating_sub(1) {
                    self.indices.extend_from_slice(&[v[0], v[i], v[i + 1]]);
                }
            }
            GePrimitive::Rectangles => {
                // Expanded to quads by the caller.
                self.add_quads(v.first().copied().unwrap_or(0), n / 4);
            }
        }
    }
}

/// Corner pairs to quads. The second vertex of each pair supplies color and
/// depth, as on hardware.
pub fn expand_rectangles(pairs: &[DecodedVertex]) -> Vec<DecodedVertex> {
    let mut out = Vec::with_capacity(pairs.len() * 2);
    for pair in pairs.chunks_exact(2) {
        let (a, b) = (pair[0], pair[1]);
        let z = b.pos[2];
        let corner = |x: f32, y: f32, u: f32, v: f32| DecodedVertex {
            pos: [x, y, z],
            uv: [u, v],
            color: b.color,
        };
        out.push(corner(a.pos[0], a.pos[1], a.uv[0], a.uv[1]));
        out.push(corner(b.pos[0], a.pos[1], b.uv[0], a.uv[1]));
        out.push(corner(b.pos[0], b.pos[1], b.uv[0], b.uv[1]));
        out.push(corner(a.pos[0], b.pos[1], a.uv[0], b.uv[1]));
    }
    out
}

/// Uniform block of the draw shaders; matches `Data` in `ge_draw.vert`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DrawUniforms {
    pub proj: [f32; 16],
    pub world: [f32; 16],
    pub view: [f32; 16],
    pub uv_scale_offset: [f32; 4],
    pub fog_color: [f32; 4],
    pub fog_coef: [f32; 4],
    pub texenv: [f32; 4],
    /// x: through mode, y: texturing, z: fog
    pub flags: [f32; 4],
}

/// A 4x3 GE matrix as a column-major 4x4.
pub fn expand_4x3(m: &[f32; 12]) -> [f32; 16] {
    [
        m[0], m[1], m[2], 0.0, m[3], m[4], m[5], 0.0, m[6], m[7], m[8], 0.0, m[9], m[10], m[11],
        1.0,
    ]
}

/// Pixel-space projection for through-mode vertices on a `w` x `h` target.
pub fn through_projection(w: f32, h: f32) -> [f32; 16] {
    [
        2.0 / w,
        0.0,
        0.0,
        0.0,
        0.0,
        -2.0 / h,
        0.0,
        0.0,
        0.0,
        0.0,
        1.0,
        0.0,
        -1.0,
        1.0,
        0.0,
        1.0,
    ]
}

fn unpack_rgb(color: u32) -> [f32; 4] {
    [
        (color & 0xFF) as f32 / 255.0,
        ((color >> 8) & 0xFF) as f32 / 255.0,
        ((color >> 16) & 0xFF) as f32 / 255.0,
        1.0,
    ]
}

fn draw_vertex_layout() -> VertexLayout {
    VertexLayout {
        stride: DECODED_VERTEX_SIZE,
        attributes: vec![
            VertexAttribute {
                location: 0,
                format: VertexAttrFormat::Float3,
                offset: 0,
            },
            VertexAttribute {
                location: 1,
                format: VertexAttrFormat::Float2,
                offset: 12,
            },
            VertexAttribute {
                location: 2,
                format: VertexAttrFormat::UNorm8x4,
                offset: 20,
            },
        ],
    }
}

/// Everything a draw pipeline depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub topology: Topology,
    pub blend: BlendState,
    pub depth: DepthStencilState,
    pub cull: CullMode,
}

fn blend_factor(raw: u32, is_src: bool, fixed: u32) -> BlendFactor {
    match raw {
        0 if is_src => BlendFactor::DstColor,
        0 => BlendFactor::SrcColor,
        1 if is_src => BlendFactor::OneMinusDstColor,
        1 => BlendFactor::OneMinusSrcColor,
        2 | 6 => BlendFactor::SrcAlpha,
        3 | 7 => BlendFactor::OneMinusSrcAlpha,
        4 | 8 => BlendFactor::DstAlpha,
        5 | 9 => BlendFactor::OneMinusDstAlpha,
        _ => match fixed & 0xFF_FFFF {
            0 => BlendFactor::Zero,
            0xFF_FFFF => BlendFactor::One,
            _ => BlendFactor::Constant,
        },
    }
}

fn compare_func(raw: u32) -> CompareFunc {
    match raw & 7 {
        0 => CompareFunc::Never,
        1 => CompareFunc::Always,
        2 => CompareFunc::Equal,
        3 => CompareFunc::NotEqual,
        4 => CompareFunc::Less,
        5 => CompareFunc::LessEqual,
        6 => CompareFunc::Greater,
        _ => CompareFunc::GreaterEqual,
    }
}

/// Derive the pipeline key from the registers.
pub fn pipeline_key(gstate: &GpuStateStore, class: PrimClass) -> PipelineKey {
    let clear = gstate.is_clear_mode();
    let through = gstate.vertex_type() & crate::vertex::VTYPE_THROUGH != 0;

    let blend = if clear {
        let mode = gstate.data(GE_CMD_CLEARMODE);
        let mut mask = 0;
        if mode & (1 << 8) != 0 {
            mask |= 0x7;
        }
        if mode & (1 << 9) != 0 {
            mask |= 0x8;
        }
        BlendState {
            color_mask: mask,
            ..BlendState::default()
        }
    } else {
        let mode = gstate.data(GE_CMD_BLENDMODE);
        let rgb_mask = gstate.data(GE_CMD_MASKRGB);
        let mut mask = 0;
        for ch in 0..3 {
            if (rgb_mask >> (ch * 8)) & 0xFF != 0xFF {
                mask |= 1 << ch;
            }
        }
        if gstate.data(GE_CMD_MASKALPHA) & 0xFF != 0xFF {
            mask |= 0x8;
        }
        BlendState {
            enabled: gstate.data(GE_CMD_ALPHABLENDENABLE) & 1 != 0,
            src: blend_factor(mode & 0xF, true, gstate.data(GE_CMD_BLENDFIXEDA)),
            dst: blend_factor((mode >> 4) & 0xF, false, gstate.data(GE_CMD_BLENDFIXEDB)),
            op: match (mode >> 8) & 0xF {
                0 => BlendOp::Add,
                1 => BlendOp::Subtract,
                2 => BlendOp::ReverseSubtract,
                3 => BlendOp::Min,
                _ => BlendOp::Max,
            },
            color_mask: mask,
        }
    };

    let depth = if clear {
        DepthStencilState {
            depth_test: true,
            depth_write: gstate.data(GE_CMD_CLEARMODE) & (1 << 10) != 0,
            depth_func: CompareFunc::Always,
            stencil_test: false,
        }
    } else {
        let test = gstate.data(GE_CMD_ZTESTENABLE) & 1 != 0;
        DepthStencilState {
            depth_test: test,
            depth_write: test && gstate.data(GE_CMD_ZWRITEDISABLE) & 1 == 0,
            depth_func: if test {
                compare_func(gstate.data(GE_CMD_ZTEST))
            } else {
                CompareFunc::Always
            },
            stencil_test: gstate.data(GE_CMD_STENCILTESTENABLE) & 1 != 0,
        }
    };

    let cull = if clear
        || through
        || class != PrimClass::Triangles
        || gstate.data(GE_CMD_CULLFACEENABLE) & 1 == 0
    {
        CullMode::None
    } else if gstate.data(GE_CMD_CULL) & 1 != 0 {
        CullMode::Back
    } else {
        CullMode::Front
    };

    PipelineKey {
        topology: class.topology(),
        blend,
        depth,
        cull,
    }
}

/// What a flush did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub cleared: DirtyFlags,
    pub draws: usize,
    pub vertices: usize,
    pub submitted: bool,
}

/// The unsubmitted batch in save-state form. Vertices are stored as the raw
/// words of [`DecodedVertex`] so positions survive JSON bit-exact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingBatch {
    pub vertices: Vec<u32>,
    pub indices: Vec<u16>,
    pub draws: usize,
    pub class: Option<PrimClass>,
}

impl PendingBatch {
    /// Check the batch against the engine's limits and unpack its vertices.
    pub fn decode(&self) -> Result<Vec<DecodedVertex>, GpuError> {
        let layout = |msg: String| GpuError::StateLayout(msg);
        let vertices: &[DecodedVertex] = bytemuck::try_cast_slice(&self.vertices)
            .map_err(|e| layout(format!("pending vertices: {:?}", e)))?;
        if vertices.len() > VERTEX_BUFFER_MAX || self.indices.len() > INDEX_BUFFER_MAX {
            return Err(layout(format!(
                "pending batch of {} vertices, {} indices is too large",
                vertices.len(),
                self.indices.len()
            )));
        }
        if self.draws > MAX_DEFERRED_DRAWS || (self.draws == 0) != vertices.is_empty() {
            return Err(layout(format!(
                "pending batch of {} draws with {} vertices",
                self.draws,
                vertices.len()
            )));
        }
        if self.indices.iter().any(|&i| i as usize >= vertices.len()) {
            return Err(layout("pending index out of range".to_string()));
        }
        Ok(vertices.to_vec())
    }
}

pub struct DrawEngine {
    vertices: Vec<DecodedVertex>,
    indices: IndexGenerator,
    draws: usize,
    class: Option<PrimClass>,
    last_rebuilt: DirtyFlags,

    vertex_buffer: Option<BufferHandle>,
    index_buffer: Option<BufferHandle>,
    vertex_shader: Option<ShaderHandle>,
    fragment_shader: Option<ShaderHandle>,
    pipelines: HashMap<PipelineKey, PipelineHandle>,
    samplers: HashMap<SamplerDesc, SamplerHandle>,
    texture: Option<(TextureHandle, u32, u32)>,
    bound_pipeline: Option<(PipelineKey, PipelineHandle)>,
    render_target: Option<FramebufferHandle>,
    target_size: (u32, u32),
}

impl DrawEngine {
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            indices: IndexGenerator::new(),
            draws: 0,
            class: None,
            last_rebuilt: DirtyFlags::empty(),
            vertex_buffer: None,
            index_buffer: None,
            vertex_shader: None,
            fragment_shader: None,
            pipelines: HashMap::new(),
            samplers: HashMap::new(),
            texture: None,
            bound_pipeline: None,
            render_target: None,
            target_size: (480, 272),
        }
    }

    pub fn pending_draws(&self) -> usize {
        self.draws
    }

    pub fn pending_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn has_pending(&self) -> bool {
        self.draws > 0
    }

    /// Dirty bits cleared by the most recent flush that submitted.
    pub fn last_rebuilt(&self) -> DirtyFlags {
        self.last_rebuilt
    }

    pub fn cached_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    /// Whether a draw of `prim` with `vertex_count` vertices fits the batch
    /// without flushing first.
    pub fn can_append(&self, prim: GePrimitive, vertex_count: usize) -> bool {
        if self.draws == 0 {
            return true;
        }
        let expanded = if prim == GePrimitive::Rectangles {
            vertex_count * 2
        } else {
            vertex_count
        };
        self.class == Some(prim.class())
            && self.draws < MAX_DEFERRED_DRAWS
            && self.vertices.len() + expanded <= VERTEX_BUFFER_MAX
            && self.indices.len() + expanded * 3 <= INDEX_BUFFER_MAX
    }

    /// Append a decoded draw. `local_indices` index into `vertices`.
    ///
    /// Callers check [`can_append`](Self::can_append) and flush first when
    /// it fails. Returns how many vertices did not fit an empty batch and
    /// were dropped.
    pub fn queue(
        &mut self,
        prim: GePrimitive,
        vertices: &[DecodedVertex],
        local_indices: Option<&[u16]>,
    ) -> usize {
        let ordered: Vec<DecodedVertex>;
        let (vertices, local_indices) = if prim == GePrimitive::Rectangles {
            ordered = match local_indices {
                Some(idx) => {
                    let resolved: Vec<DecodedVertex> = idx
                        .iter()
                        .filter_map(|&i| vertices.get(i as usize).copied())
                        .collect();
                    expand_rectangles(&resolved)
                }
                None => expand_rectangles(vertices),
            };
            (ordered.as_slice(), None)
        } else {
            (vertices, local_indices)
        };

        let mut room = VERTEX_BUFFER_MAX.saturating_sub(self.vertices.len());
        if prim == GePrimitive::Rectangles {
            room -= room % 4;
        }
        let dropped = vertices.len().saturating_sub(room);
        if dropped > 0 {
            log(LogCategory::Draw, LogLevel::Warn, || {
                format!(
                    "Draw of {} vertices exceeds the batch limit; {} dropped",
                    vertices.len(),
                    dropped
                )
            });
        }
        let vertices = &vertices[..vertices.len().min(room)];
        if vertices.is_empty() {
            return dropped;
        }

        let base = self.vertices.len() as u16;
        self.vertices.extend_from_slice(vertices);
        match (prim, local_indices) {
            (GePrimitive::Rectangles, _) => self.indices.add_quads(base, vertices.len() / 4),
            (_, Some(local)) => {
                let limit = vertices.len() as u16;
                let local: Vec<u16> = local.iter().copied().filter(|&i| i < limit).collect();
                self.indices.translate_prim(prim, base, &local);
            }
            (_, None) => self.indices.add_prim(prim, base, vertices.len()),
        }
        self.draws += 1;
        self.class = Some(prim.class());
        dropped
    }

    pub fn pending_batch(&self) -> PendingBatch {
        PendingBatch {
            vertices: bytemuck::cast_slice(&self.vertices).to_vec(),
            indices: self.indices.indices().to_vec(),
            draws: self.draws,
            class: if self.draws > 0 { self.class } else { None },
        }
    }

    /// Replace the pending batch with a saved one.
    pub fn restore_batch(&mut self, batch: PendingBatch) -> Result<(), GpuError> {
        let vertices = batch.decode()?;
        self.vertices = vertices;
        self.indices.indices = batch.indices;
        self.draws = batch.draws;
        self.class = batch.class;
        Ok(())
    }

    /// Drop the pending batch.
    pub fn discard(&mut self) {
        self.vertices.clear();
        self.indices.reset();
        self.draws = 0;
        self.class = None;
    }

    /// Submit the pending batch, rebuilding dirty objects first.
    pub fn flush<D: DrawContext>(
        &mut self,
        gstate: &mut GpuStateStore,
        mem: &GuestMemory,
        fbm: &mut FramebufferManager,
        ctx: &mut D,
        stats: &mut GpuStats,
    ) -> FlushReport {
        if self.draws == 0 {
            return FlushReport::default();
        }
        let mut report = FlushReport {
            cleared: DirtyFlags::empty(),
            draws: self.draws,
            vertices: self.vertices.len(),
            submitted: false,
        };
        stats.flushes += 1;

        if ctx.is_device_lost() {
            log(LogCategory::Draw, LogLevel::Debug, || {
                format!("Device lost, dropping {} draws", self.draws)
            });
            stats.dropped_batches += 1;
            self.discard();
            return report;
        }

        match self.submit(gstate, mem, fbm, ctx, stats) {
            Ok(Some(cleared)) => {
                gstate.clear_dirty(cleared);
                self.last_rebuilt = cleared;
                report.cleared = cleared;
                report.submitted = true;
                stats.submissions += 1;
                stats.vertices_submitted += report.vertices as u64;
            }
            Ok(None) => {
                stats.dropped_batches += 1;
            }
            Err(e) => {
                match &e {
                    GpuError::Backend(crate::backend::BackendError::Submission(_)) => {
                        stats.submission_errors += 1
                    }
                    _ => stats.backend_errors += 1,
                }
                stats.dropped_batches += 1;
                log(LogCategory::Draw, LogLevel::Error, || {
                    format!("Dropping batch of {} draws: {}", self.draws, e)
                });
            }
        }
        self.discard();
        report
    }

    /// Rebuild and draw. `Ok(None)` means there was nothing to draw into.
    fn submit<D: DrawContext>(
        &mut self,
        gstate: &mut GpuStateStore,
        mem: &GuestMemory,
        fbm: &mut FramebufferManager,
        ctx: &mut D,
        stats: &mut GpuStats,
    ) -> Result<Option<DirtyFlags>, GpuError> {
        let dirty = gstate.dirty();
        let mut rebuilt = DirtyFlags::empty();
        let class = self.class.unwrap_or(PrimClass::Triangles);

        self.ensure_device_objects(ctx)?;

        let prev_size = self.target_size;
        if dirty.intersects(DirtyFlags::FRAMEBUF) || self.render_target.is_none() {
            self.render_target = fbm.set_render_framebuffer(gstate, ctx, stats);
            let Some(target) = self.render_target else {
                return Ok(None);
            };
            ctx.bind_render_target(Some(target), RenderPassLoad::Keep);
            if let Some(vfb) = fbm.current() {
                self.target_size = (vfb.width, vfb.height);
            }
            rebuilt |= DirtyFlags::FRAMEBUF;
        }

        let key = pipeline_key(gstate, class);
        let pipeline_stale = match self.bound_pipeline {
            Some((bound, _)) => bound != key,
            None => true,
        };
        if dirty.intersects(DirtyFlags::PIPELINE) || pipeline_stale {
            let handle = match self.pipelines.get(&key) {
                Some(&h) => h,
                None => {
                    let (Some(vs), Some(fs)) = (self.vertex_shader, self.fragment_shader) else {
                        return Err(GpuError::DeviceLost);
                    };
                    let h = ctx.create_pipeline(&PipelineDesc {
                        vertex_shader: vs,
                        fragment_shader: fs,
                        topology: key.topology,
                        layout: draw_vertex_layout(),
                        blend: key.blend,
                        depth: key.depth,
                        cull: key.cull,
                    })?;
                    stats.pipelines_created += 1;
                    log(LogCategory::Draw, LogLevel::Debug, || {
                        format!("New pipeline {:?}", key)
                    });
                    self.pipelines.insert(key, h);
                    h
                }
            };
            ctx.bind_pipeline(Some(handle));
            self.bound_pipeline = Some((key, handle));
            rebuilt |= DirtyFlags::PIPELINE;
        }

        let texturing = gstate.is_texture_enabled() && !gstate.is_clear_mode();
        if texturing && (dirty.intersects(DirtyFlags::TEXTURE) || self.texture.is_none()) {
            if self.rebuild_texture(gstate, mem, ctx, stats)? {
                rebuilt |= DirtyFlags::TEXTURE;
            }
        }

        // Through-mode viewport and projection follow the target size.
        let resized = self.target_size != prev_size;
        if dirty.intersects(DirtyFlags::VIEWPORT) || resized {
            self.apply_viewport(gstate, fbm.render_scale(), ctx);
            rebuilt |= DirtyFlags::VIEWPORT;
        }

        if dirty.intersects(DirtyFlags::UNIFORMS) || resized {
            let uniforms = self.uniforms(gstate);
            ctx.update_uniforms(bytemuck::bytes_of(&uniforms));
            rebuilt |= DirtyFlags::UNIFORMS;
        }

        let (Some(vbuf), Some(ibuf)) = (self.vertex_buffer, self.index_buffer) else {
            return Err(GpuError::DeviceLost);
        };
        ctx.update_buffer(vbuf, 0, bytemuck::cast_slice(&self.vertices))?;
        ctx.update_buffer(ibuf, 0, bytemuck::cast_slice(self.indices.indices()))?;
        ctx.bind_vertex_buffer(Some(vbuf), 0);
        ctx.bind_index_buffer(Some(ibuf), 0);
        ctx.draw_indexed(self.indices.len() as u32, 0)?;

        log(LogCategory::Draw, LogLevel::Trace, || {
            format!(
                "Flushed {} draws, {} vertices, {} indices",
                self.draws,
                self.vertices.len(),
                self.indices.len()
            )
        });
        Ok(Some(dirty & rebuilt))
    }

    fn ensure_device_objects<D: DrawContext>(&mut self, ctx: &mut D) -> Result<(), GpuError> {
        if self.vertex_buffer.is_none() {
            self.vertex_buffer = Some(ctx.create_buffer(
                VERTEX_BUFFER_MAX * DECODED_VERTEX_SIZE as usize,
                BufferUsage::Vertex,
            )?);
        }
        if self.index_buffer.is_none() {
            self.index_buffer = Some(ctx.create_buffer(INDEX_BUFFER_MAX * 2, BufferUsage::Index)?);
        }
        if self.vertex_shader.is_none() {
            self.vertex_shader =
                Some(ctx.compile_shader(ShaderStage::Vertex, ShaderLanguage::Glsl, DRAW_VERTEX)?);
        }
        if self.fragment_shader.is_none() {
            self.fragment_shader = Some(ctx.compile_shader(
                ShaderStage::Fragment,
                ShaderLanguage::Glsl,
                DRAW_FRAGMENT,
            )?);
        }
        Ok(())
    }

    fn rebuild_texture<D: DrawContext>(
        &mut self,
        gstate: &GpuStateStore,
        mem: &GuestMemory,
        ctx: &mut D,
        stats: &mut GpuStats,
    ) -> Result<bool, GpuError> {
        let decoded = match decode_texture(gstate, mem) {
            Ok(t) => t,
            Err(e) => {
                stats.memory_errors += 1;
                log(LogCategory::Draw, LogLevel::Warn, || {
                    format!("Texture at {:08x} unreadable: {}", gstate.texture_address(0), e)
                });
                // Keep drawing with whatever is bound; the bits stay dirty.
                return Ok(false);
            }
        };
        stats.textures_decoded += 1;

        let current = self.texture;
        let tex = match current {
            Some((tex, w, h)) if w == decoded.width && h == decoded.height => {
                ctx.update_texture(tex, w, h, &decoded.pixels)?;
                tex
            }
            old => {
                if let Some((tex, _, _)) = old {
                    ctx.destroy_texture(tex);
                    self.texture = None;
                }
                let tex = ctx.create_texture(decoded.width, decoded.height, &decoded.pixels)?;
                self.texture = Some((tex, decoded.width, decoded.height));
                tex
            }
        };
        ctx.bind_texture(0, Some(tex));

        let (min, mag) = gstate.texture_filter();
        let (clamp_u, clamp_v) = gstate.texture_clamp();
        let desc = SamplerDesc {
            min_linear: min & 1 != 0,
            mag_linear: mag != 0,
            clamp_u,
            clamp_v,
        };
        let sampler = match self.samplers.get(&desc) {
            Some(&s) => s,
            None => {
                let s = ctx.create_sampler(&desc)?;
                self.samplers.insert(desc, s);
                s
            }
        };
        ctx.bind_sampler(0, Some(sampler));
        Ok(true)
    }

    fn apply_viewport<D: DrawContext>(&self, gstate: &GpuStateStore, scale: u32, ctx: &mut D) {
        let s = scale.max(1) as f32;
        let through = gstate.vertex_type() & crate::vertex::VTYPE_THROUGH != 0;
        let (tw, th) = self.target_size;

        let mut vp = if through {
            Viewport::new(0.0, 0.0, tw as f32 * s, th as f32 * s)
        } else {
            let ([sx, sy, _], [cx, cy, _]) = gstate.viewport();
            let (ox, oy) = gstate.screen_offset();
            let (w, h) = (sx.abs() * 2.0, sy.abs() * 2.0);
            Viewport::new(
                (cx - ox - sx.abs()) * s,
                (cy - oy - sy.abs()) * s,
                w * s,
                h * s,
            )
        };
        let (min_z, max_z) = gstate.depth_range();
        vp.min_depth = min_z as f32 / 65535.0;
        vp.max_depth = (max_z as f32 / 65535.0).max(vp.min_depth);
        ctx.set_viewport(vp);

        let sc = gstate.scissor();
        ctx.set_scissor(ScissorRect {
            x: (sc.x1 as f32 * s) as i32,
            y: (sc.y1 as f32 * s) as i32,
            width: ((sc.x2 + 1).saturating_sub(sc.x1) as f32 * s) as i32,
            height: ((sc.y2 + 1).saturating_sub(sc.y1) as f32 * s) as i32,
        });
    }

    fn uniforms(&self, gstate: &GpuStateStore) -> DrawUniforms {
        let through = gstate.vertex_type() & crate::vertex::VTYPE_THROUGH != 0;
        let clear = gstate.is_clear_mode();
        let texturing = gstate.is_texture_enabled() && !clear;
        let (tw, th) = self.target_size;

        let proj = if through {
            through_projection(tw.max(1) as f32, th.max(1) as f32)
        } else {
            gstate.proj_matrix_f32()
        };
        let uv_scale_offset = if through {
            let (w, h) = gstate.texture_size(0);
            [1.0 / w as f32, 1.0 / h as f32, 0.0, 0.0]
        } else {
            gstate.uv_scale_offset()
        };
        let fog = gstate.data(GE_CMD_FOGENABLE) & 1 != 0 && !through && !clear;
        let flag = |b: bool| if b { 1.0 } else { 0.0 };

        DrawUniforms {
            proj,
            world: expand_4x3(&gstate.world_matrix_f32()),
            view: expand_4x3(&gstate.view_matrix_f32()),
            uv_scale_offset,
            fog_color: unpack_rgb(gstate.data(GE_CMD_FOGCOLOR)),
            fog_coef: [
                float24(gstate.data(GE_CMD_FOG1)),
                float24(gstate.data(GE_CMD_FOG2)),
                0.0,
                0.0,
            ],
            texenv: unpack_rgb(gstate.data(GE_CMD_TEXENVCOLOR)),
            flags: [flag(through), flag(texturing), flag(fog), 0.0],
        }
    }

    /// Forget every backend handle and the pending batch.
    pub fn device_lost(&mut self) {
        self.discard();
        self.vertex_buffer = None;
        self.index_buffer = None;
        self.vertex_shader = None;
        self.fragment_shader = None;
        self.pipelines.clear();
        self.samplers.clear();
        self.texture = None;
        self.bound_pipeline = None;
        self.render_target = None;
    }

    /// Forget cached bindings after something else drew; objects stay alive.
    pub fn invalidate_bindings(&mut self) {
        self.bound_pipeline = None;
        self.render_target = None;
    }

    pub fn destroy<D: DrawContext>(&mut self, ctx: &mut D) {
        for (_, p) in self.pipelines.drain() {
            ctx.destroy_pipeline(p);
        }
        for (_, s) in self.samplers.drain() {
            ctx.destroy_sampler(s);
        }
        if let Some((t, _, _)) = self.texture.take() {
            ctx.destroy_texture(t);
        }
        for b in [self.vertex_buffer.take(), self.index_buffer.take()]
            .into_iter()
            .flatten()
        {
            ctx.destroy_buffer(b);
        }
        for s in [self.vertex_shader.take(), self.fragment_shader.take()]
            .into_iter()
            .flatten()
        {
            ctx.destroy_shader(s);
        }
        self.device_lost();
    }
}

impl Default for DrawEngine {
    fn default() -> Self {
        Self::new()
    }
}
