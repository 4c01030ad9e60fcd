//! Graphics backend capability interface.
//!
//! The GE core and the presentation layer only talk to the GPU through
//! [`DrawContext`]. Handles are plain ids; a backend that loses its device
//! invalidates every handle it has issued, and the owners recreate them from
//! their logical descriptors on restore.
//!
//! Implementations:
//! - [`headless::HeadlessDrawContext`]: records calls, simulates device loss
//!   and resource exhaustion. Used by tests and the replay tool.
//! - `opengl::GlDrawContext` (feature `opengl`): glow-based renderer.

pub mod headless;
#[cfg(feature = "opengl")]
pub mod opengl;

use thiserror::Error;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);
    };
}

handle!(ShaderHandle);
handle!(PipelineHandle);
handle!(SamplerHandle);
handle!(BufferHandle);
handle!(
    /// An offscreen render target. The backbuffer has no handle.
    FramebufferHandle
);
handle!(TextureHandle);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("{0}")]
    ShaderCompile(String),
    #[error("pipeline link failed: {0}")]
    PipelineLink(String),
    #[error("out of backend resources: {0}")]
    OutOfResources(String),
    #[error("device lost")]
    DeviceLost,
    #[error("invalid handle {0}")]
    InvalidHandle(u32),
    #[error("submission failed: {0}")]
    Submission(String),
    #[error("backend error: {0}")]
    Api(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderLanguage {
    /// GLSL 3.30 / ES 3.00 body; the backend supplies the `#version` line.
    Glsl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    Points,
    Lines,
    Triangles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexAttrFormat {
    Float2,
    Float3,
    /// Four normalized bytes
    UNorm8x4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexAttrFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    Constant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub enabled: bool,
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub op: BlendOp,
    /// RGBA write mask, bit 0 = red
    pub color_mask: u8,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            enabled: false,
            src: BlendFactor::One,
            dst: BlendFactor::Zero,
            op: BlendOp::Add,
            color_mask: 0xF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunc {
    Never,
    Always,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: CompareFunc,
    pub stencil_test: bool,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            depth_func: CompareFunc::Always,
            stencil_test: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineDesc {
    pub vertex_shader: ShaderHandle,
    pub fragment_shader: ShaderHandle,
    pub topology: Topology,
    pub layout: VertexLayout,
    pub blend: BlendState,
    pub depth: DepthStencilState,
    pub cull: CullMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub min_linear: bool,
    pub mag_linear: bool,
    pub clamp_u: bool,
    pub clamp_v: bool,
}

impl SamplerDesc {
    pub const NEAREST_CLAMP: Self = Self {
        min_linear: false,
        mag_linear: false,
        clamp_u: true,
        clamp_v: true,
    };

    pub const LINEAR_CLAMP: Self = Self {
        min_linear: true,
        mag_linear: true,
        clamp_u: true,
        clamp_v: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex,
    Index,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramebufferDesc {
    pub width: u32,
    pub height: u32,
    pub depth: bool,
    pub label: String,
}

/// What happens to a render target's contents when it is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPassLoad {
    Keep,
    DontCare,
    /// Clear to an ARGB color (and depth 0, stencil 0)
    Clear(u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FbChannel {
    Color,
    Depth,
    Stencil,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub name: String,
    pub shader_language: ShaderLanguage,
    pub max_texture_size: u32,
    pub depth_readback: bool,
    pub stencil_readback: bool,
}

/// Everything the GE core needs from a graphics API.
///
/// Creation calls may fail at any time (device loss, exhaustion); callers
/// degrade instead of panicking. Destroying an unknown handle is a no-op.
pub trait DrawContext {
    fn capabilities(&self) -> Capabilities;

    /// Size of the presentation surface in pixels.
    fn backbuffer_size(&self) -> (u32, u32);

    fn is_device_lost(&self) -> bool {
        false
    }

    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        language: ShaderLanguage,
        source: &str,
    ) -> Result<ShaderHandle, BackendError>;
    fn destroy_shader(&mut self, shader: ShaderHandle);

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle, BackendError>;
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle, BackendError>;
    fn destroy_sampler(&mut self, sampler: SamplerHandle);

    fn create_buffer(&mut self, size: usize, usage: BufferUsage)
        -> Result<BufferHandle, BackendError>;
    fn update_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), BackendError>;
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDesc,
    ) -> Result<FramebufferHandle, BackendError>;
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);
    /// `None` is the backbuffer.
    fn framebuffer_dimensions(&self, framebuffer: Option<FramebufferHandle>) -> (u32, u32);

    /// Pixels are ARGB8888, row-major.
    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        pixels: &[u32],
    ) -> Result<TextureHandle, BackendError>;
    fn update_texture(
        &mut self,
        texture: TextureHandle,
        width: u32,
        height: u32,
        pixels: &[u32],
    ) -> Result<(), BackendError>;
    fn destroy_texture(&mut self, texture: TextureHandle);

    fn bind_render_target(&mut self, framebuffer: Option<FramebufferHandle>, load: RenderPassLoad);
    fn bind_framebuffer_as_texture(&mut self, framebuffer: FramebufferHandle, slot: u32);
    fn bind_texture(&mut self, slot: u32, texture: Option<TextureHandle>);
    fn bind_sampler(&mut self, slot: u32, sampler: Option<SamplerHandle>);
    fn bind_pipeline(&mut self, pipeline: Option<PipelineHandle>);
    fn bind_vertex_buffer(&mut self, buffer: Option<BufferHandle>, offset: usize);
    fn bind_index_buffer(&mut self, buffer: Option<BufferHandle>, offset: usize);
    fn update_uniforms(&mut self, data: &[u8]);
    fn set_viewport(&mut self, viewport: Viewport);
    fn set_scissor(&mut self, rect: ScissorRect);

    /// Draw `index_count` 16-bit indices from the bound index buffer.
    fn draw_indexed(&mut self, index_count: u32, first_index: u32) -> Result<(), BackendError>;

    /// Read back a rectangle of a render target. Color is ARGB8888; depth and
    /// stencil come back as raw integer values.
    fn read_framebuffer(
        &self,
        framebuffer: Option<FramebufferHandle>,
        channel: FbChannel,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<u32>, BackendError>;

    /// Forget any state the backend caches between calls.
    fn invalidate_cached_state(&mut self) {}
}
