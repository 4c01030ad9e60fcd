//! OpenGL [`DrawContext`] on top of glow.
//!
//! **Architecture**:
//! - OpenGL 3.3 Core Profile; shader bodies get a `#version 330 core` line
//! - One shared VAO; attribute pointers are set per draw from the bound
//!   pipeline's vertex layout
//! - Uniforms go through a single std140 block named `Data` at binding 0
//! - Offscreen targets are an RGBA8 texture plus a depth/stencil renderbuffer
//! - ARGB8888 host pixels are uploaded and read back as BGRA bytes
//!
//! The frontend owns the window and the context; it hands the `glow::Context`
//! in and keeps calling [`GlDrawContext::resize`] with the surface size.

use super::*;
use emu_core::logging::{log, LogCategory, LogLevel};
use glow::HasContext;
use std::collections::HashMap;

const GLSL_VERSION: &str = "#version 330 core\n";
const UNIFORM_BLOCK: &str = "Data";
const SAMPLER_NAMES: [&str; 2] = ["sampler0", "sampler1"];

/// Wrapper for glow::Context that implements Send.
/// The GE runs on one thread; the context is never used from two at once.
struct SendContext(glow::Context);

unsafe impl Send for SendContext {}

impl std::ops::Deref for SendContext {
    type Target = glow::Context;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

struct GlPipeline {
    program: glow::Program,
    desc: PipelineDesc,
}

struct GlFramebuffer {
    fbo: glow::Framebuffer,
    color: glow::Texture,
    depth: Option<glow::Renderbuffer>,
    width: u32,
    height: u32,
}

struct GlTexture {
    texture: glow::Texture,
    width: u32,
    height: u32,
}

pub struct GlDrawContext {
    gl: SendContext,
    width: u32,
    height: u32,
    next_id: u32,
    shaders: HashMap<u32, glow::Shader>,
    pipelines: HashMap<u32, GlPipeline>,
    samplers: HashMap<u32, glow::Sampler>,
    buffers: HashMap<u32, glow::Buffer>,
    framebuffers: HashMap<u32, GlFramebuffer>,
    textures: HashMap<u32, GlTexture>,
    vao: glow::VertexArray,
    ubo: glow::Buffer,
    pipeline: Option<PipelineHandle>,
    vertex_buffer: Option<(BufferHandle, usize)>,
    index_buffer: Option<(BufferHandle, usize)>,
    lost: bool,
}

fn gl_err(what: &str) -> impl FnOnce(String) -> BackendError + '_ {
    move |e| BackendError::OutOfResources(format!("{}: {}", what, e))
}

fn blend_factor(f: BlendFactor) -> u32 {
    match f {
        BlendFactor::Zero => glow::ZERO,
        BlendFactor::One => glow::ONE,
        BlendFactor::SrcColor => glow::SRC_COLOR,
        BlendFactor::OneMinusSrcColor => glow::ONE_MINUS_SRC_COLOR,
        BlendFactor::DstColor => glow::DST_COLOR,
        BlendFactor::OneMinusDstColor => glow::ONE_MINUS_DST_COLOR,
        BlendFactor::SrcAlpha => glow::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => glow::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstAlpha => glow::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => glow::ONE_MINUS_DST_ALPHA,
        BlendFactor::Constant => glow::CONSTANT_COLOR,
    }
}

fn blend_op(op: BlendOp) -> u32 {
    match op {
        BlendOp::Add => glow::FUNC_ADD,
        BlendOp::Subtract => glow::FUNC_SUBTRACT,
        BlendOp::ReverseSubtract => glow::FUNC_REVERSE_SUBTRACT,
        BlendOp::Min => glow::MIN,
        BlendOp::Max => glow::MAX,
    }
}

fn compare_func(f: CompareFunc) -> u32 {
    match f {
        CompareFunc::Never => glow::NEVER,
        CompareFunc::Always => glow::ALWAYS,
        CompareFunc::Equal => glow::EQUAL,
        CompareFunc::NotEqual => glow::NOTEQUAL,
        CompareFunc::Less => glow::LESS,
        CompareFunc::LessEqual => glow::LEQUAL,
        CompareFunc::Greater => glow::GREATER,
        CompareFunc::GreaterEqual => glow::GEQUAL,
    }
}

fn topology(t: Topology) -> u32 {
    match t {
        Topology::Points => glow::POINTS,
        Topology::Lines => glow::LINES,
        Topology::Triangles => glow::TRIANGLES,
    }
}

fn argb_to_rgba_f32(c: u32) -> [f32; 4] {
    let ch = |shift: u32| ((c >> shift) & 0xFF) as f32 / 255.0;
    [ch(16), ch(8), ch(0), ch(24)]
}

/// GL rows run bottom-up.
fn flip_rows(pixels: &mut [u32], width: usize) {
    let rows = pixels.len() / width.max(1);
    for y in 0..rows / 2 {
        let (top, bottom) = pixels.split_at_mut((rows - 1 - y) * width);
        top[y * width..(y + 1) * width].swap_with_slice(&mut bottom[..width]);
    }
}

impl GlDrawContext {
    /// Wrap a current GL 3.3 context whose default framebuffer is
    /// `width` x `height`.
    pub fn new(gl: glow::Context, width: u32, height: u32) -> Result<Self, BackendError> {
        let gl = SendContext(gl);
        unsafe {
            let vao = gl.create_vertex_array().map_err(gl_err("vertex array"))?;
            let ubo = gl.create_buffer().map_err(gl_err("uniform buffer"))?;
            gl.bind_vertex_array(Some(vao));
            log(LogCategory::Present, LogLevel::Info, || {
                format!(
                    "OpenGL backend: {} ({})",
                    gl.get_parameter_string(glow::RENDERER),
                    gl.get_parameter_string(glow::VERSION)
                )
            });
            Ok(Self {
                gl,
                width,
                height,
                next_id: 1,
                shaders: HashMap::new(),
                pipelines: HashMap::new(),
                samplers: HashMap::new(),
                buffers: HashMap::new(),
                framebuffers: HashMap::new(),
                textures: HashMap::new(),
                vao,
                ubo,
                pipeline: None,
                vertex_buffer: None,
                index_buffer: None,
                lost: false,
            })
        }
    }

    pub fn gl_context(&self) -> &glow::Context {
        &self.gl
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    /// Called by the frontend when the context was recreated. Every handle
    /// issued so far is dropped without touching GL.
    pub fn context_lost(&mut self) {
        self.lost = true;
        self.shaders.clear();
        self.pipelines.clear();
        self.samplers.clear();
        self.buffers.clear();
        self.framebuffers.clear();
        self.textures.clear();
        self.invalidate_cached_state();
    }

    /// Adopt a fresh context after [`context_lost`](Self::context_lost).
    pub fn context_restored(&mut self, gl: glow::Context) -> Result<(), BackendError> {
        let gl = SendContext(gl);
        unsafe {
            self.vao = gl.create_vertex_array().map_err(gl_err("vertex array"))?;
            self.ubo = gl.create_buffer().map_err(gl_err("uniform buffer"))?;
            gl.bind_vertex_array(Some(self.vao));
        }
        self.gl = gl;
        self.lost = false;
        Ok(())
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    fn check_lost(&self) -> Result<(), BackendError> {
        if self.lost {
            Err(BackendError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn fbo(&self, framebuffer: Option<FramebufferHandle>) -> Option<glow::Framebuffer> {
        framebuffer.and_then(|h| self.framebuffers.get(&h.0)).map(|f| f.fbo)
    }

    unsafe fn apply_pipeline_state(&self, desc: &PipelineDesc) {
        let gl = &self.gl;
        let b = &desc.blend;
        if b.enabled {
            gl.enable(glow::BLEND);
            gl.blend_func(blend_factor(b.src), blend_factor(b.dst));
            gl.blend_equation(blend_op(b.op));
        } else {
            gl.disable(glow::BLEND);
        }
        gl.color_mask(
            b.color_mask & 1 != 0,
            b.color_mask & 2 != 0,
            b.color_mask & 4 != 0,
            b.color_mask & 8 != 0,
        );

        let d = &desc.depth;
        if d.depth_test {
            gl.enable(glow::DEPTH_TEST);
            gl.depth_func(compare_func(d.depth_func));
        } else {
            gl.disable(glow::DEPTH_TEST);
        }
        gl.depth_mask(d.depth_write);
        if d.stencil_test {
            gl.enable(glow::STENCIL_TEST);
        } else {
            gl.disable(glow::STENCIL_TEST);
        }

        match desc.cull {
            CullMode::None => gl.disable(glow::CULL_FACE),
            CullMode::Front => {
                gl.enable(glow::CULL_FACE);
                gl.cull_face(glow::FRONT);
            }
            CullMode::Back => {
                gl.enable(glow::CULL_FACE);
                gl.cull_face(glow::BACK);
            }
        }
    }

    unsafe fn apply_layout(&self, layout: &VertexLayout, base: usize) {
        let gl = &self.gl;
        for attr in &layout.attributes {
            let offset = (base + attr.offset as usize) as i32;
            let stride = layout.stride as i32;
            match attr.format {
                VertexAttrFormat::Float2 => {
                    gl.vertex_attrib_pointer_f32(attr.location, 2, glow::FLOAT, false, stride, offset)
                }
                VertexAttrFormat::Float3 => {
                    gl.vertex_attrib_pointer_f32(attr.location, 3, glow::FLOAT, false, stride, offset)
                }
                // Little-endian ARGB words are B, G, R, A in memory.
                VertexAttrFormat::UNorm8x4 => gl.vertex_attrib_pointer_f32(
                    attr.location,
                    glow::BGRA as i32,
                    glow::UNSIGNED_BYTE,
                    true,
                    stride,
                    offset,
                ),
            }
            gl.enable_vertex_attrib_array(attr.location);
        }
    }
}

impl DrawContext for GlDrawContext {
    fn capabilities(&self) -> Capabilities {
        unsafe {
            Capabilities {
                name: format!("OpenGL {}", self.gl.get_parameter_string(glow::RENDERER)),
                shader_language: ShaderLanguage::Glsl,
                max_texture_size: self.gl.get_parameter_i32(glow::MAX_TEXTURE_SIZE).max(0) as u32,
                depth_readback: true,
                stencil_readback: true,
            }
        }
    }

    fn backbuffer_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn is_device_lost(&self) -> bool {
        self.lost
    }

    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        _language: ShaderLanguage,
        source: &str,
    ) -> Result<ShaderHandle, BackendError> {
        self.check_lost()?;
        let kind = match stage {
            ShaderStage::Vertex => glow::VERTEX_SHADER,
            ShaderStage::Fragment => glow::FRAGMENT_SHADER,
        };
        let shader = unsafe {
            let shader = self.gl.create_shader(kind).map_err(gl_err("shader"))?;
            self.gl.shader_source(shader, &format!("{}{}", GLSL_VERSION, source));
            self.gl.compile_shader(shader);
            if !self.gl.get_shader_compile_status(shader) {
                let info = self.gl.get_shader_info_log(shader);
                self.gl.delete_shader(shader);
                return Err(BackendError::ShaderCompile(info));
            }
            shader
        };
        let id = self.alloc_id();
        self.shaders.insert(id, shader);
        Ok(ShaderHandle(id))
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        if let Some(s) = self.shaders.remove(&shader.0) {
            unsafe { self.gl.delete_shader(s) };
        }
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle, BackendError> {
        self.check_lost()?;
        let vs = *self
            .shaders
            .get(&desc.vertex_shader.0)
            .ok_or(BackendError::InvalidHandle(desc.vertex_shader.0))?;
        let fs = *self
            .shaders
            .get(&desc.fragment_shader.0)
            .ok_or(BackendError::InvalidHandle(desc.fragment_shader.0))?;
        let program = unsafe {
            let gl = &self.gl;
            let program = gl.create_program().map_err(gl_err("program"))?;
            gl.attach_shader(program, vs);
            gl.attach_shader(program, fs);
            gl.link_program(program);
            gl.detach_shader(program, vs);
            gl.detach_shader(program, fs);
            if !gl.get_program_link_status(program) {
                let info = gl.get_program_info_log(program);
                gl.delete_program(program);
                return Err(BackendError::PipelineLink(info));
            }
            if let Some(block) = gl.get_uniform_block_index(program, UNIFORM_BLOCK) {
                gl.uniform_block_binding(program, block, 0);
            }
            gl.use_program(Some(program));
            for (slot, name) in SAMPLER_NAMES.iter().enumerate() {
                if let Some(loc) = gl.get_uniform_location(program, name) {
                    gl.uniform_1_i32(Some(&loc), slot as i32);
                }
            }
            gl.use_program(None);
            program
        };
        let id = self.alloc_id();
        self.pipelines.insert(
            id,
            GlPipeline {
                program,
                desc: desc.clone(),
            },
        );
        Ok(PipelineHandle(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if let Some(p) = self.pipelines.remove(&pipeline.0) {
            unsafe { self.gl.delete_program(p.program) };
        }
        if self.pipeline == Some(pipeline) {
            self.pipeline = None;
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle, BackendError> {
        self.check_lost()?;
        let sampler = unsafe {
            let gl = &self.gl;
            let s = gl.create_sampler().map_err(gl_err("sampler"))?;
            let filter = |linear: bool| (if linear { glow::LINEAR } else { glow::NEAREST }) as i32;
            let wrap = |clamp: bool| (if clamp { glow::CLAMP_TO_EDGE } else { glow::REPEAT }) as i32;
            gl.sampler_parameter_i32(s, glow::TEXTURE_MIN_FILTER, filter(desc.min_linear));
            gl.sampler_parameter_i32(s, glow::TEXTURE_MAG_FILTER, filter(desc.mag_linear));
            gl.sampler_parameter_i32(s, glow::TEXTURE_WRAP_S, wrap(desc.clamp_u));
            gl.sampler_parameter_i32(s, glow::TEXTURE_WRAP_T, wrap(desc.clamp_v));
            s
        };
        let id = self.alloc_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(s) = self.samplers.remove(&sampler.0) {
            unsafe { self.gl.delete_sampler(s) };
        }
    }

    fn create_buffer(&mut self, size: usize, usage: BufferUsage) -> Result<BufferHandle, BackendError> {
        self.check_lost()?;
        let target = match usage {
            BufferUsage::Vertex => glow::ARRAY_BUFFER,
            BufferUsage::Index => glow::ELEMENT_ARRAY_BUFFER,
        };
        let buffer = unsafe {
            let b = self.gl.create_buffer().map_err(gl_err("buffer"))?;
            self.gl.bind_buffer(target, Some(b));
            self.gl.buffer_data_size(target, size as i32, glow::DYNAMIC_DRAW);
            self.gl.bind_buffer(target, None);
            b
        };
        let id = self.alloc_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn update_buffer(&mut self, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<(), BackendError> {
        self.check_lost()?;
        let b = *self
            .buffers
            .get(&buffer.0)
            .ok_or(BackendError::InvalidHandle(buffer.0))?;
        unsafe {
            // COPY_WRITE_BUFFER leaves the VAO's element binding alone.
            self.gl.bind_buffer(glow::COPY_WRITE_BUFFER, Some(b));
            self.gl
                .buffer_sub_data_u8_slice(glow::COPY_WRITE_BUFFER, offset as i32, data);
            self.gl.bind_buffer(glow::COPY_WRITE_BUFFER, None);
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(b) = self.buffers.remove(&buffer.0) {
            unsafe { self.gl.delete_buffer(b) };
        }
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> Result<FramebufferHandle, BackendError> {
        self.check_lost()?;
        let (w, h) = (desc.width as i32, desc.height as i32);
        let fb = unsafe {
            let gl = &self.gl;
            let fbo = gl.create_framebuffer().map_err(gl_err("framebuffer"))?;
            let color = gl.create_texture().map_err(gl_err("framebuffer texture"))?;
            gl.bind_texture(glow::TEXTURE_2D, Some(color));
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA8 as i32,
                w,
                h,
                0,
                glow::BGRA,
                glow::UNSIGNED_BYTE,
                None,
            );
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fbo));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(color),
                0,
            );
            let depth = if desc.depth {
                let rb = gl.create_renderbuffer().map_err(gl_err("depth buffer"))?;
                gl.bind_renderbuffer(glow::RENDERBUFFER, Some(rb));
                gl.renderbuffer_storage(glow::RENDERBUFFER, glow::DEPTH24_STENCIL8, w, h);
                gl.framebuffer_renderbuffer(
                    glow::FRAMEBUFFER,
                    glow::DEPTH_STENCIL_ATTACHMENT,
                    glow::RENDERBUFFER,
                    Some(rb),
                );
                Some(rb)
            } else {
                None
            };
            let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            if status != glow::FRAMEBUFFER_COMPLETE {
                gl.delete_framebuffer(fbo);
                gl.delete_texture(color);
                if let Some(rb) = depth {
                    gl.delete_renderbuffer(rb);
                }
                return Err(BackendError::OutOfResources(format!(
                    "framebuffer {} incomplete: {:#x}",
                    desc.label, status
                )));
            }
            GlFramebuffer {
                fbo,
                color,
                depth,
                width: desc.width,
                height: desc.height,
            }
        };
        let id = self.alloc_id();
        self.framebuffers.insert(id, fb);
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if let Some(fb) = self.framebuffers.remove(&framebuffer.0) {
            unsafe {
                self.gl.delete_framebuffer(fb.fbo);
                self.gl.delete_texture(fb.color);
                if let Some(rb) = fb.depth {
                    self.gl.delete_renderbuffer(rb);
                }
            }
        }
    }

    fn framebuffer_dimensions(&self, framebuffer: Option<FramebufferHandle>) -> (u32, u32) {
        match framebuffer {
            None => (self.width, self.height),
            Some(h) => self
                .framebuffers
                .get(&h.0)
                .map(|f| (f.width, f.height))
                .unwrap_or((0, 0)),
        }
    }

    fn create_texture(&mut self, width: u32, height: u32, pixels: &[u32]) -> Result<TextureHandle, BackendError> {
        self.check_lost()?;
        let texture = unsafe { self.gl.create_texture().map_err(gl_err("texture"))? };
        let id = self.alloc_id();
        self.textures.insert(
            id,
            GlTexture {
                texture,
                width: 0,
                height: 0,
            },
        );
        let handle = TextureHandle(id);
        if let Err(e) = self.update_texture(handle, width, height, pixels) {
            self.destroy_texture(handle);
            return Err(e);
        }
        Ok(handle)
    }

    fn update_texture(
        &mut self,
        texture: TextureHandle,
        width: u32,
        height: u32,
        pixels: &[u32],
    ) -> Result<(), BackendError> {
        self.check_lost()?;
        let expected = (width * height) as usize;
        if pixels.len() < expected {
            return Err(BackendError::Api(format!(
                "texture upload has {} pixels, {}x{} needs {}",
                pixels.len(),
                width,
                height,
                expected
            )));
        }
        let tex = self
            .textures
            .get_mut(&texture.0)
            .ok_or(BackendError::InvalidHandle(texture.0))?;
        let bytes: &[u8] = bytemuck::cast_slice(&pixels[..expected]);
        unsafe {
            let gl = &self.gl;
            gl.bind_texture(glow::TEXTURE_2D, Some(tex.texture));
            if tex.width == width && tex.height == height {
                gl.tex_sub_image_2d(
                    glow::TEXTURE_2D,
                    0,
                    0,
                    0,
                    width as i32,
                    height as i32,
                    glow::BGRA,
                    glow::UNSIGNED_BYTE,
                    glow::PixelUnpackData::Slice(bytes),
                );
            } else {
                gl.tex_image_2d(
                    glow::TEXTURE_2D,
                    0,
                    glow::RGBA8 as i32,
                    width as i32,
                    height as i32,
                    0,
                    glow::BGRA,
                    glow::UNSIGNED_BYTE,
                    Some(bytes),
                );
                tex.width = width;
                tex.height = height;
            }
        }
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(t) = self.textures.remove(&texture.0) {
            unsafe { self.gl.delete_texture(t.texture) };
        }
    }

    fn bind_render_target(&mut self, framebuffer: Option<FramebufferHandle>, load: RenderPassLoad) {
        let fbo = self.fbo(framebuffer);
        if framebuffer.is_some() && fbo.is_none() {
            log(LogCategory::Present, LogLevel::Warn, || {
                format!("Binding unknown framebuffer {:?}", framebuffer)
            });
        }
        let (w, h) = self.framebuffer_dimensions(framebuffer);
        unsafe {
            let gl = &self.gl;
            gl.bind_framebuffer(glow::FRAMEBUFFER, fbo);
            gl.viewport(0, 0, w as i32, h as i32);
            gl.disable(glow::SCISSOR_TEST);
            if let RenderPassLoad::Clear(color) = load {
                let [r, g, b, a] = argb_to_rgba_f32(color);
                gl.color_mask(true, true, true, true);
                gl.depth_mask(true);
                gl.clear_color(r, g, b, a);
                gl.clear_depth_f32(0.0);
                gl.clear_stencil(0);
                gl.clear(glow::COLOR_BUFFER_BIT | glow::DEPTH_BUFFER_BIT | glow::STENCIL_BUFFER_BIT);
            }
        }
    }

    fn bind_framebuffer_as_texture(&mut self, framebuffer: FramebufferHandle, slot: u32) {
        if let Some(fb) = self.framebuffers.get(&framebuffer.0) {
            unsafe {
                self.gl.active_texture(glow::TEXTURE0 + slot);
                self.gl.bind_texture(glow::TEXTURE_2D, Some(fb.color));
            }
        }
    }

    fn bind_texture(&mut self, slot: u32, texture: Option<TextureHandle>) {
        let tex = texture.and_then(|t| self.textures.get(&t.0)).map(|t| t.texture);
        unsafe {
            self.gl.active_texture(glow::TEXTURE0 + slot);
            self.gl.bind_texture(glow::TEXTURE_2D, tex);
        }
    }

    fn bind_sampler(&mut self, slot: u32, sampler: Option<SamplerHandle>) {
        let s = sampler.and_then(|s| self.samplers.get(&s.0)).copied();
        unsafe { self.gl.bind_sampler(slot, s) };
    }

    fn bind_pipeline(&mut self, pipeline: Option<PipelineHandle>) {
        self.pipeline = pipeline;
        let program = pipeline.and_then(|p| self.pipelines.get(&p.0)).map(|p| p.program);
        unsafe { self.gl.use_program(program) };
    }

    fn bind_vertex_buffer(&mut self, buffer: Option<BufferHandle>, offset: usize) {
        self.vertex_buffer = buffer.map(|b| (b, offset));
    }

    fn bind_index_buffer(&mut self, buffer: Option<BufferHandle>, offset: usize) {
        self.index_buffer = buffer.map(|b| (b, offset));
    }

    fn update_uniforms(&mut self, data: &[u8]) {
        unsafe {
            self.gl.bind_buffer(glow::UNIFORM_BUFFER, Some(self.ubo));
            self.gl
                .buffer_data_u8_slice(glow::UNIFORM_BUFFER, data, glow::DYNAMIC_DRAW);
            self.gl.bind_buffer_base(glow::UNIFORM_BUFFER, 0, Some(self.ubo));
        }
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        unsafe {
            self.gl.viewport(
                viewport.x as i32,
                viewport.y as i32,
                viewport.width as i32,
                viewport.height as i32,
            );
            self.gl.depth_range_f32(viewport.min_depth, viewport.max_depth);
        }
    }

    fn set_scissor(&mut self, rect: ScissorRect) {
        unsafe {
            self.gl.enable(glow::SCISSOR_TEST);
            self.gl.scissor(rect.x, rect.y, rect.width, rect.height);
        }
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32) -> Result<(), BackendError> {
        self.check_lost()?;
        let pipeline = self
            .pipeline
            .and_then(|p| self.pipelines.get(&p.0))
            .ok_or_else(|| BackendError::Submission("no pipeline bound".to_string()))?;
        let (vb, voffset) = self
            .vertex_buffer
            .ok_or_else(|| BackendError::Submission("no vertex buffer bound".to_string()))?;
        let (ib, ioffset) = self
            .index_buffer
            .ok_or_else(|| BackendError::Submission("no index buffer bound".to_string()))?;
        let vbo = *self.buffers.get(&vb.0).ok_or(BackendError::InvalidHandle(vb.0))?;
        let ibo = *self.buffers.get(&ib.0).ok_or(BackendError::InvalidHandle(ib.0))?;
        unsafe {
            let gl = &self.gl;
            gl.bind_vertex_array(Some(self.vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
            self.apply_layout(&pipeline.desc.layout, voffset);
            gl.bind_buffer(glow::ELEMENT_ARRAY_BUFFER, Some(ibo));
            self.apply_pipeline_state(&pipeline.desc);
            gl.draw_elements(
                topology(pipeline.desc.topology),
                index_count as i32,
                glow::UNSIGNED_SHORT,
                (ioffset + first_index as usize * 2) as i32,
            );
            match gl.get_error() {
                glow::NO_ERROR => Ok(()),
                glow::OUT_OF_MEMORY => Err(BackendError::OutOfResources("draw".to_string())),
                code => Err(BackendError::Submission(format!("GL error {:#x}", code))),
            }
        }
    }

    fn read_framebuffer(
        &self,
        framebuffer: Option<FramebufferHandle>,
        channel: FbChannel,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<u32>, BackendError> {
        self.check_lost()?;
        if framebuffer.is_some() && self.fbo(framebuffer).is_none() {
            return Err(BackendError::InvalidHandle(framebuffer.map(|h| h.0).unwrap_or(0)));
        }
        let (_, fb_height) = self.framebuffer_dimensions(framebuffer);
        let gl_y = fb_height.saturating_sub(y + height) as i32;
        let count = (width * height) as usize;
        let mut pixels = vec![0u32; count];
        unsafe {
            let gl = &self.gl;
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, self.fbo(framebuffer));
            match channel {
                FbChannel::Color => gl.read_pixels(
                    x as i32,
                    gl_y,
                    width as i32,
                    height as i32,
                    glow::BGRA,
                    glow::UNSIGNED_BYTE,
                    glow::PixelPackData::Slice(bytemuck::cast_slice_mut(&mut pixels)),
                ),
                FbChannel::Depth => gl.read_pixels(
                    x as i32,
                    gl_y,
                    width as i32,
                    height as i32,
                    glow::DEPTH_COMPONENT,
                    glow::UNSIGNED_INT,
                    glow::PixelPackData::Slice(bytemuck::cast_slice_mut(&mut pixels)),
                ),
                FbChannel::Stencil => {
                    let mut bytes = vec![0u8; count];
                    gl.read_pixels(
                        x as i32,
                        gl_y,
                        width as i32,
                        height as i32,
                        glow::STENCIL_INDEX,
                        glow::UNSIGNED_BYTE,
                        glow::PixelPackData::Slice(&mut bytes),
                    );
                    pixels = bytes.into_iter().map(u32::from).collect();
                }
            }
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, None);
            if gl.get_error() != glow::NO_ERROR {
                return Err(BackendError::Api(format!("{:?} readback failed", channel)));
            }
        }
        flip_rows(&mut pixels, width as usize);
        Ok(pixels)
    }

    fn invalidate_cached_state(&mut self) {
        self.pipeline = None;
        self.vertex_buffer = None;
        self.index_buffer = None;
    }
}

impl Drop for GlDrawContext {
    fn drop(&mut self) {
        if self.lost {
            return;
        }
        unsafe {
            let gl = &self.gl;
            for (_, p) in self.pipelines.drain() {
                gl.delete_program(p.program);
            }
            for (_, s) in self.shaders.drain() {
                gl.delete_shader(s);
            }
            for (_, s) in self.samplers.drain() {
                gl.delete_sampler(s);
            }
            for (_, b) in self.buffers.drain() {
                gl.delete_buffer(b);
            }
            for (_, t) in self.textures.drain() {
                gl.delete_texture(t.texture);
            }
            for (_, fb) in self.framebuffers.drain() {
                gl.delete_framebuffer(fb.fbo);
                gl.delete_texture(fb.color);
                if let Some(rb) = fb.depth {
                    gl.delete_renderbuffer(rb);
                }
            }
            gl.delete_buffer(self.ubo);
            gl.delete_vertex_array(self.vao);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flip_rows() {
        let mut px = vec![1, 2, 3, 4, 5, 6];
        flip_rows(&mut px, 2);
        assert_eq!(px, vec![5, 6, 3, 4, 1, 2]);
    }

    #[test]
    fn test_clear_color_channels() {
        assert_eq!(argb_to_rgba_f32(0xFF00_00FF), [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(argb_to_rgba_f32(0x00FF_0000), [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_blend_mapping() {
        assert_eq!(blend_factor(BlendFactor::Constant), glow::CONSTANT_COLOR);
        assert_eq!(blend_op(BlendOp::ReverseSubtract), glow::FUNC_REVERSE_SUBTRACT);
        assert_eq!(compare_func(CompareFunc::GreaterEqual), glow::GEQUAL);
    }
}
