//! Final compositing of the emulated display onto the presentation surface.
//!
//! # Architecture
//!
//! ```text
//! source (guest texture or virtual framebuffer)
//!    -> pass 0 -> intermediate 0 -> ... -> pass N-1 -> backbuffer
//! ```
//!
//! Every pass but the last renders into an intermediate target owned by
//! [`PostShaderTargets`]. With no configured chain the source is blitted with
//! the built-in `tex_color` pipeline (or its red/blue swapping twin).
//!
//! All vertices of a frame live in one 12-vertex buffer:
//! - `0..4`: the final quad, placed at the output rectangle
//! - `4..8`: a full-target quad for intermediate passes
//! - `8..12`: a full-target quad carrying the source crop, used by pass 0
//!
//! # Device loss
//!
//! Backend handles sit next to the descriptors they were built from.
//! [`PresentationCommon::device_lost`] forgets them without touching the
//! backend, [`PresentationCommon::device_restore`] recreates them and rebuilds
//! the configured chain. A reconfiguration requested while the device is lost
//! is deferred until restore.

use crate::backend::{
    BackendError, BufferHandle, BufferUsage, DrawContext, FramebufferHandle, PipelineDesc,
    PipelineHandle, RenderPassLoad, SamplerDesc, SamplerHandle, ScissorRect, ShaderHandle, ShaderLanguage,
    ShaderStage, TextureHandle, Topology, VertexAttrFormat, VertexAttribute, VertexLayout,
    Viewport,
};
use crate::config::PresentationConfig;
use crate::framebuffer::PostShaderTargets;
use crate::geometry::{
    cardboard_settings, center_display_output_rect, get_screen_frame, output_quad, pass_quad,
    DisplayLayout, FRect, QuadVertex, ScreenRotation, UvRect, PSP_HEIGHT, PSP_WIDTH,
    QUAD_INDICES, QUAD_VERTEX_SIZE,
};
use crate::post_shader::{
    post_shader_error_message, PostShaderUniforms, ShaderInfo, ShaderRegistry,
    DEFAULT_POST_VERTEX,
};
use crate::GpuError;
use bitflags::bitflags;
use emu_core::logging::{log, LogCategory, LogLevel};
use std::time::Instant;

const TEX_COLOR_FRAGMENT: &str = include_str!("../shaders/tex_color.frag");
const TEX_COLOR_RB_SWIZZLE_FRAGMENT: &str = include_str!("../shaders/tex_color_rb_swizzle.frag");

/// Opaque black, ARGB.
const CLEAR_COLOR: u32 = 0xFF00_0000;

const QUAD_VERTEX_COUNT: usize = 12;
const FINAL_QUAD: usize = 0;
const PASS_QUAD: usize = 4;
const CROPPED_PASS_QUAD: usize = 8;

bitflags! {
    /// How [`PresentationCommon::copy_to_output`] places and samples the source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OutputFlags: u32 {
        const NEAREST = 1 << 0;
        /// Swap red and blue; bypasses the post-shader chain
        const RB_SWIZZLE = 1 << 1;
        const BACKBUFFER_FLIPPED = 1 << 2;
        const POSITION_FLIPPED = 1 << 3;
        /// Squeeze horizontally to 3/4
        const PILLARBOX = 1 << 4;
    }
}

impl OutputFlags {
    /// Bilinear sampling is the absence of [`OutputFlags::NEAREST`].
    pub const LINEAR: Self = Self::empty();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationState {
    /// Plain blit
    NoShader,
    /// Chain compiled, intermediates not built for the current resolution
    ShaderConfigured,
    ShaderActive,
    DeviceLost,
}

/// Internal rendering resolution derived from config and output size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderResolution {
    pub scale: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for RenderResolution {
    fn default() -> Self {
        Self {
            scale: 1,
            width: PSP_WIDTH as u32,
            height: PSP_HEIGHT as u32,
        }
    }
}

/// Pick the render resolution for `chain` on a `pixel_w` x `pixel_h` output.
///
/// Scale 0 means automatic: enough to cover the longer output side. A
/// supersampling first pass multiplies the automatic scale; an upscaling
/// first pass forces 1x.
pub fn calculate_render_resolution(
    config: &PresentationConfig,
    chain: &[ShaderInfo],
    pixel_w: u32,
    pixel_h: u32,
) -> RenderResolution {
    let first_upscaling = chain.first().map(|s| s.upscaling).unwrap_or(false);
    let first_ssaa = chain.first().map(|s| s.ssaa_level).unwrap_or(0);
    let portrait = config.is_portrait();

    let mut zoom = config.render_scale;
    if zoom == 0 || first_ssaa >= 2 {
        let longest = if portrait { pixel_h } else { pixel_w };
        zoom = (longest + 479) / 480;
        if first_ssaa >= 2 {
            zoom *= first_ssaa;
        }
    }
    if zoom <= 1 || first_upscaling {
        zoom = 1;
    }

    let (w, h) = if portrait { (272, 480) } else { (480, 272) };
    RenderResolution {
        scale: zoom,
        width: w * zoom,
        height: h * zoom,
    }
}

/// Sizes of the intermediate targets for `chain`, one per non-final pass.
///
/// Each target starts from the previous one (or the render resolution). A
/// following upscaler wants native size, a following supersampler wants the
/// input scaled up, and an output-resolution pass renders at `output` size.
pub fn intermediate_sizes(
    chain: &[ShaderInfo],
    render: RenderResolution,
    output: (u32, u32),
    portrait: bool,
) -> Vec<(u32, u32)> {
    let mut sizes: Vec<(u32, u32)> = Vec::new();
    for pair in chain.windows(2) {
        let (current, next) = (&pair[0], &pair[1]);
        let (mut w, mut h) = sizes.last().copied().unwrap_or((render.width, render.height));
        if next.upscaling {
            (w, h) = if portrait { (272, 480) } else { (480, 272) };
        } else if next.ssaa_level >= 2 {
            w *= next.ssaa_level;
            h *= next.ssaa_level;
        } else if current.output_resolution {
            (w, h) = output;
        }
        sizes.push((w.max(1), h.max(1)));
    }
    sizes
}

/// Per-pass uniforms for a `buffer_w` x `buffer_h` input drawn into a
/// `target_w` x `target_h` output.
#[allow(clippy::too_many_arguments)]
pub fn post_shader_uniforms(
    buffer_w: u32,
    buffer_h: u32,
    target_w: u32,
    target_h: u32,
    settings: [f32; 4],
    time_seconds: f32,
    vblank_count: u32,
    flip_count: u32,
    has_video: bool,
) -> PostShaderUniforms {
    let u_delta = 1.0 / buffer_w.max(1) as f32;
    let v_delta = 1.0 / buffer_h.max(1) as f32;
    let u_pixel_delta = 1.0 / target_w.max(1) as f32;
    let v_pixel_delta = 1.0 / target_h.max(1) as f32;

    PostShaderUniforms {
        texel_delta: [u_delta, v_delta],
        pixel_delta: [u_pixel_delta, v_pixel_delta],
        time: [
            time_seconds,
            (vblank_count % 60) as f32 / 60.0,
            vblank_count as f32,
            (flip_count % 60) as f32,
        ],
        setting: settings,
        video: if has_video { 1.0 } else { 0.0 },
        pad: [0.0; 3],
        gl_half_pixel: [u_pixel_delta * 0.5, v_pixel_delta * 0.5, 0.0, 0.0],
    }
}

/// Vertex layout of [`QuadVertex`].
pub fn quad_layout() -> VertexLayout {
    VertexLayout {
        stride: QUAD_VERTEX_SIZE as u32,
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
        ],
    }
}

fn quad_pipeline_desc(vs: ShaderHandle, fs: ShaderHandle) -> PipelineDesc {
    PipelineDesc {
        vertex_shader: vs,
        fragment_shader: fs,
        topology: Topology::Triangles,
        layout: quad_layout(),
        blend: Default::default(),
        depth: Default::default(),
        cull: Default::default(),
    }
}

/// One compiled pass of the post-shader chain.
#[derive(Debug, Clone)]
pub struct PostShaderPass {
    pub info: ShaderInfo,
    vertex: Option<ShaderHandle>,
    fragment: Option<ShaderHandle>,
    pipeline: Option<PipelineHandle>,
}

impl PostShaderPass {
    pub fn is_compiled(&self) -> bool {
        self.pipeline.is_some()
    }

    fn destroy<D: DrawContext>(&mut self, ctx: &mut D) {
        if let Some(p) = self.pipeline.take() {
            ctx.destroy_pipeline(p);
        }
        if let Some(s) = self.vertex.take() {
            ctx.destroy_shader(s);
        }
        if let Some(s) = self.fragment.take() {
            ctx.destroy_shader(s);
        }
    }

    fn forget_handles(&mut self) {
        self.pipeline = None;
        self.vertex = None;
        self.fragment = None;
    }
}

#[derive(Debug)]
enum PresentSource {
    Pixels {
        pixels: Vec<u32>,
        width: u32,
        height: u32,
    },
    Framebuffer {
        handle: FramebufferHandle,
        width: u32,
        height: u32,
    },
}

#[derive(Debug, Clone, Copy)]
enum BoundInput {
    Texture(TextureHandle),
    Framebuffer(FramebufferHandle),
}

/// Backend objects shared by every frame.
#[derive(Debug, Default)]
struct DeviceObjects {
    vertex_shader: Option<ShaderHandle>,
    tex_color_fs: Option<ShaderHandle>,
    rb_swizzle_fs: Option<ShaderHandle>,
    tex_color: Option<PipelineHandle>,
    tex_color_rb_swizzle: Option<PipelineHandle>,
    sampler_nearest: Option<SamplerHandle>,
    sampler_linear: Option<SamplerHandle>,
    vdata: Option<BufferHandle>,
    idata: Option<BufferHandle>,
    src_texture: Option<(TextureHandle, u32, u32)>,
}

pub struct PresentationCommon {
    config: PresentationConfig,
    registry: ShaderRegistry,
    state: PresentationState,
    passes: Vec<PostShaderPass>,
    targets: PostShaderTargets,
    device: DeviceObjects,
    source: Option<PresentSource>,
    render: RenderResolution,
    /// Resolution the intermediates were built for
    built_for: Option<RenderResolution>,
    pending_reconfigure: bool,
    last_error: Option<String>,
    has_video: bool,
    vblank_count: u32,
    flip_count: u32,
    started: Instant,
}

impl PresentationCommon {
    pub fn new(config: PresentationConfig, registry: ShaderRegistry) -> Self {
        Self {
            config,
            registry,
            state: PresentationState::NoShader,
            passes: Vec::new(),
            targets: PostShaderTargets::new(),
            device: DeviceObjects::default(),
            source: None,
            render: RenderResolution::default(),
            built_for: None,
            pending_reconfigure: true,
            last_error: None,
            has_video: false,
            vblank_count: 0,
            flip_count: 0,
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &PresentationConfig {
        &self.config
    }

    pub fn registry(&self) -> &ShaderRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ShaderRegistry {
        &mut self.registry
    }

    pub fn state(&self) -> PresentationState {
        self.state
    }

    pub fn passes(&self) -> &[PostShaderPass] {
        &self.passes
    }

    pub fn targets(&self) -> &PostShaderTargets {
        &self.targets
    }

    pub fn render_resolution(&self) -> RenderResolution {
        self.render
    }

    /// Last user-visible post-shader error, if the chain failed to build.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn set_has_video(&mut self, has_video: bool) {
        self.has_video = has_video;
    }

    pub fn notify_vblank(&mut self) {
        self.vblank_count = self.vblank_count.wrapping_add(1);
    }

    pub fn flip_count(&self) -> u32 {
        self.flip_count
    }

    /// Replace the configuration and rebuild the chain. While the device is
    /// lost the rebuild waits for [`device_restore`](Self::device_restore).
    pub fn set_config<D: DrawContext>(&mut self, ctx: &mut D, config: PresentationConfig) -> bool {
        self.config = config;
        self.update_post_shader(ctx)
    }

    /// Create the shared objects that do not exist yet.
    pub fn init_device_objects<D: DrawContext>(&mut self, ctx: &mut D) -> Result<(), GpuError> {
        let dev = &mut self.device;
        if dev.vdata.is_none() {
            dev.vdata =
                Some(ctx.create_buffer(QUAD_VERTEX_COUNT * QUAD_VERTEX_SIZE, BufferUsage::Vertex)?);
        }
        if dev.idata.is_none() {
            let idata = ctx.create_buffer(
                std::mem::size_of_val(&QUAD_INDICES),
                BufferUsage::Index,
            )?;
            ctx.update_buffer(idata, 0, bytemuck::cast_slice(&QUAD_INDICES))?;
            dev.idata = Some(idata);
        }
        if dev.sampler_nearest.is_none() {
            dev.sampler_nearest = Some(ctx.create_sampler(&SamplerDesc::NEAREST_CLAMP)?);
        }
        if dev.sampler_linear.is_none() {
            dev.sampler_linear = Some(ctx.create_sampler(&SamplerDesc::LINEAR_CLAMP)?);
        }
        let vs = match dev.vertex_shader {
            Some(vs) => vs,
            None => {
                let vs = ctx.compile_shader(
                    ShaderStage::Vertex,
                    ShaderLanguage::Glsl,
                    DEFAULT_POST_VERTEX,
                )?;
                dev.vertex_shader = Some(vs);
                vs
            }
        };
        if dev.tex_color.is_none() {
            let fs = match dev.tex_color_fs {
                Some(fs) => fs,
                None => {
                    let fs = ctx.compile_shader(
                        ShaderStage::Fragment,
                        ShaderLanguage::Glsl,
                        TEX_COLOR_FRAGMENT,
                    )?;
                    dev.tex_color_fs = Some(fs);
                    fs
                }
            };
            dev.tex_color = Some(ctx.create_pipeline(&quad_pipeline_desc(vs, fs))?);
        }
        if dev.tex_color_rb_swizzle.is_none() {
            let fs = match dev.rb_swizzle_fs {
                Some(fs) => fs,
                None => {
                    let fs = ctx.compile_shader(
                        ShaderStage::Fragment,
                        ShaderLanguage::Glsl,
                        TEX_COLOR_RB_SWIZZLE_FRAGMENT,
                    )?;
                    dev.rb_swizzle_fs = Some(fs);
                    fs
                }
            };
            dev.tex_color_rb_swizzle = Some(ctx.create_pipeline(&quad_pipeline_desc(vs, fs))?);
        }
        Ok(())
    }

    /// Destroy every backend object, including the chain.
    pub fn destroy_device_objects<D: DrawContext>(&mut self, ctx: &mut D) {
        self.destroy_post_shader(ctx);
        self.targets.destroy_all(ctx);
        self.built_for = None;

        let dev = std::mem::take(&mut self.device);
        for p in [dev.tex_color, dev.tex_color_rb_swizzle].into_iter().flatten() {
            ctx.destroy_pipeline(p);
        }
        for s in [dev.vertex_shader, dev.tex_color_fs, dev.rb_swizzle_fs]
            .into_iter()
            .flatten()
        {
            ctx.destroy_shader(s);
        }
        for s in [dev.sampler_nearest, dev.sampler_linear].into_iter().flatten() {
            ctx.destroy_sampler(s);
        }
        for b in [dev.vdata, dev.idata].into_iter().flatten() {
            ctx.destroy_buffer(b);
        }
        if let Some((tex, _, _)) = dev.src_texture {
            ctx.destroy_texture(tex);
        }
    }

    fn destroy_post_shader<D: DrawContext>(&mut self, ctx: &mut D) {
        for pass in &mut self.passes {
            pass.destroy(ctx);
        }
        self.passes.clear();
    }

    /// Drop everything the chain built and fall back to a plain blit.
    fn fall_back<D: DrawContext>(&mut self, ctx: &mut D, message: String) {
        log(LogCategory::Present, LogLevel::Error, || message.clone());
        self.last_error = Some(message);
        self.destroy_post_shader(ctx);
        self.targets.begin_chain();
        self.targets.finish_chain(ctx);
        self.built_for = None;
        self.state = PresentationState::NoShader;
    }

    /// Resolve the configured chain and compile every pass.
    ///
    /// Returns `false` when the chain could not be built; the pipeline then
    /// presents without post-processing.
    pub fn update_post_shader<D: DrawContext>(&mut self, ctx: &mut D) -> bool {
        if self.state == PresentationState::DeviceLost || ctx.is_device_lost() {
            log(LogCategory::Present, LogLevel::Debug, || {
                "Post-shader reconfiguration deferred until device restore".to_string()
            });
            self.pending_reconfigure = true;
            return false;
        }
        self.pending_reconfigure = false;
        self.destroy_post_shader(ctx);
        self.last_error = None;

        let chain = self.registry.configured_chain(&self.config.post_shaders);
        self.update_render_resolution(ctx, &chain);

        if chain.is_empty() {
            self.targets.begin_chain();
            self.targets.finish_chain(ctx);
            self.built_for = None;
            self.state = PresentationState::NoShader;
            return true;
        }

        for info in chain {
            let name = info.name.clone();
            match Self::compile_pass(ctx, info) {
                Ok(pass) => self.passes.push(pass),
                Err(e) => {
                    let message = match &e {
                        BackendError::ShaderCompile(log) => post_shader_error_message(log),
                        other => post_shader_error_message(&other.to_string()),
                    };
                    log(LogCategory::Present, LogLevel::Warn, || {
                        format!("Post-shader {} failed: {}", name, e)
                    });
                    self.fall_back(ctx, message);
                    return false;
                }
            }
        }
        log(LogCategory::Present, LogLevel::Info, || {
            format!(
                "Post-shader chain: {}",
                self.passes
                    .iter()
                    .map(|p| p.info.name.as_str())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            )
        });

        self.state = PresentationState::ShaderConfigured;
        self.build_intermediates(ctx)
    }

    fn compile_pass<D: DrawContext>(
        ctx: &mut D,
        info: ShaderInfo,
    ) -> Result<PostShaderPass, BackendError> {
        let mut pass = PostShaderPass {
            info,
            vertex: None,
            fragment: None,
            pipeline: None,
        };
        match Self::build_pass_objects(ctx, &mut pass) {
            Ok(()) => Ok(pass),
            Err(e) => {
                pass.destroy(ctx);
                Err(e)
            }
        }
    }

    fn build_pass_objects<D: DrawContext>(
        ctx: &mut D,
        pass: &mut PostShaderPass,
    ) -> Result<(), BackendError> {
        let vs = ctx.compile_shader(
            ShaderStage::Vertex,
            ShaderLanguage::Glsl,
            &pass.info.vertex_source,
        )?;
        pass.vertex = Some(vs);
        let fs = ctx.compile_shader(
            ShaderStage::Fragment,
            ShaderLanguage::Glsl,
            &pass.info.full_fragment_source(),
        )?;
        pass.fragment = Some(fs);
        pass.pipeline = Some(ctx.create_pipeline(&quad_pipeline_desc(vs, fs))?);
        Ok(())
    }

    /// Recompute the render resolution for `chain` and the current output.
    pub fn update_render_resolution<D: DrawContext>(
        &mut self,
        ctx: &D,
        chain: &[ShaderInfo],
    ) -> RenderResolution {
        let (pw, ph) = ctx.backbuffer_size();
        self.render = calculate_render_resolution(&self.config, chain, pw, ph);
        self.render
    }

    fn output_rect(&self, pixel_w: u32, pixel_h: u32) -> FRect {
        let frame = get_screen_frame(pixel_w as f32, pixel_h as f32, &self.config);
        center_display_output_rect(
            PSP_WIDTH,
            PSP_HEIGHT,
            frame,
            self.config.internal_rotation,
            &DisplayLayout::from(&self.config),
        )
    }

    /// Allocate one intermediate target per non-final pass.
    fn build_intermediates<D: DrawContext>(&mut self, ctx: &mut D) -> bool {
        let (pw, ph) = ctx.backbuffer_size();
        let rc = self.output_rect(pw, ph);
        let infos: Vec<ShaderInfo> = self.passes.iter().map(|p| p.info.clone()).collect();
        let sizes = intermediate_sizes(
            &infos,
            self.render,
            (rc.w.max(1.0) as u32, rc.h.max(1.0) as u32),
            self.config.is_portrait(),
        );

        self.targets.begin_chain();
        for (w, h) in sizes {
            if !self.targets.allocate_framebuffer(ctx, w, h) {
                self.fall_back(
                    ctx,
                    "Post-shader error: could not allocate intermediate framebuffers".to_string(),
                );
                return false;
            }
        }
        self.targets.finish_chain(ctx);
        self.built_for = Some(self.render);
        self.state = PresentationState::ShaderActive;
        true
    }

    /// Forget every backend handle. Configuration and the chain's
    /// descriptors are kept for [`device_restore`](Self::device_restore).
    pub fn device_lost(&mut self) {
        if self.state == PresentationState::DeviceLost {
            return;
        }
        log(LogCategory::Present, LogLevel::Info, || {
            "Presentation device lost".to_string()
        });
        self.device = DeviceObjects::default();
        for pass in &mut self.passes {
            pass.forget_handles();
        }
        if !self.passes.is_empty() {
            self.pending_reconfigure = true;
        }
        self.targets.device_lost();
        self.source = None;
        self.built_for = None;
        self.state = PresentationState::DeviceLost;
    }

    /// Recreate the shared objects and rebuild the chain. Safe to call again
    /// without an intervening loss.
    pub fn device_restore<D: DrawContext>(&mut self, ctx: &mut D) -> bool {
        if ctx.is_device_lost() {
            return false;
        }
        let mut ok = match self.init_device_objects(ctx) {
            Ok(()) => true,
            Err(e) => {
                log(LogCategory::Present, LogLevel::Error, || {
                    format!("Failed to restore presentation objects: {}", e)
                });
                false
            }
        };
        if self.state != PresentationState::DeviceLost {
            return ok;
        }

        ok &= self.targets.device_restore(ctx);
        self.state = PresentationState::NoShader;
        if self.pending_reconfigure {
            ok &= self.update_post_shader(ctx);
        }
        ok
    }

    /// Present the guest-memory image `pixels` on the next copy.
    pub fn source_texture(&mut self, pixels: Vec<u32>, width: u32, height: u32) {
        self.source = Some(PresentSource::Pixels {
            pixels,
            width,
            height,
        });
    }

    /// Present a rendered framebuffer on the next copy.
    pub fn source_framebuffer(&mut self, handle: FramebufferHandle, width: u32, height: u32) {
        self.source = Some(PresentSource::Framebuffer {
            handle,
            width,
            height,
        });
    }

    /// Fill the backbuffer with black and drop any pending source.
    pub fn clear_output<D: DrawContext>(&mut self, ctx: &mut D) {
        self.source = None;
        if !ctx.is_device_lost() {
            ctx.bind_render_target(None, RenderPassLoad::Clear(CLEAR_COLOR));
        }
    }

    fn upload_source<D: DrawContext>(
        &mut self,
        ctx: &mut D,
        source: PresentSource,
    ) -> Result<(BoundInput, u32, u32), GpuError> {
        match source {
            PresentSource::Framebuffer {
                handle,
                width,
                height,
            } => Ok((BoundInput::Framebuffer(handle), width, height)),
            PresentSource::Pixels {
                pixels,
                width,
                height,
            } => {
                let tex = match self.device.src_texture {
                    Some((tex, w, h)) if w == width && h == height => {
                        ctx.update_texture(tex, width, height, &pixels)?;
                        tex
                    }
                    existing => {
                        if let Some((old, _, _)) = existing {
                            ctx.destroy_texture(old);
                            self.device.src_texture = None;
                        }
                        let tex = ctx.create_texture(width, height, &pixels)?;
                        self.device.src_texture = Some((tex, width, height));
                        tex
                    }
                };
                Ok((BoundInput::Texture(tex), width, height))
            }
        }
    }

    fn bind_input<D: DrawContext>(ctx: &mut D, input: BoundInput) {
        match input {
            BoundInput::Texture(tex) => ctx.bind_texture(0, Some(tex)),
            BoundInput::Framebuffer(fb) => ctx.bind_framebuffer_as_texture(fb, 0),
        }
    }

    fn uniforms_for(&self, info: &ShaderInfo, input: (u32, u32), target: (u32, u32)) -> PostShaderUniforms {
        let overrides = self.config.shader_settings.get(&info.name);
        post_shader_uniforms(
            input.0,
            input.1,
            target.0,
            target.1,
            info.setting_values(overrides),
            self.started.elapsed().as_secs_f32(),
            self.vblank_count,
            self.flip_count,
            self.has_video,
        )
    }

    /// Draw the pending source to the backbuffer through the chain.
    ///
    /// `u0..u1` and `v0..v1` crop the source; `uv_rotation` turns the image.
    /// The source is consumed whether or not the copy succeeds.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_to_output<D: DrawContext>(
        &mut self,
        ctx: &mut D,
        flags: OutputFlags,
        uv_rotation: ScreenRotation,
        u0: f32,
        v0: f32,
        u1: f32,
        v1: f32,
    ) -> Result<(), GpuError> {
        let Some(source) = self.source.take() else {
            self.clear_output(ctx);
            return Ok(());
        };
        if self.state == PresentationState::DeviceLost || ctx.is_device_lost() {
            return Err(GpuError::DeviceLost);
        }
        self.init_device_objects(ctx)?;

        // Resolution follows the output size; rebuild intermediates on change.
        let chain: Vec<ShaderInfo> = self.passes.iter().map(|p| p.info.clone()).collect();
        let render = self.update_render_resolution(ctx, &chain);
        if !self.passes.is_empty() && self.built_for != Some(render) {
            self.state = PresentationState::ShaderConfigured;
            self.build_intermediates(ctx);
        }

        let mut flags = flags;
        if self.config.nearest_filtering {
            flags |= OutputFlags::NEAREST;
        }
        let use_post = self.state == PresentationState::ShaderActive
            && !self.passes.is_empty()
            && !flags.contains(OutputFlags::RB_SWIZZLE);

        let (input, src_w, src_h) = self.upload_source(ctx, source)?;

        let (pw, ph) = ctx.backbuffer_size();
        let rc = self.output_rect(pw, ph);
        let crop = UvRect { u0, v0, u1, v1 };
        let final_uv = if use_post && self.passes.len() > 1 {
            UvRect::FULL
        } else {
            crop
        };

        let mut verts = [QuadVertex {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            u: 0.0,
            v: 0.0,
        }; QUAD_VERTEX_COUNT];
        verts[FINAL_QUAD..FINAL_QUAD + 4].copy_from_slice(&output_quad(
            rc,
            pw as f32,
            ph as f32,
            flags,
            uv_rotation,
            final_uv,
        ));
        verts[PASS_QUAD..PASS_QUAD + 4].copy_from_slice(&pass_quad(UvRect::FULL));
        verts[CROPPED_PASS_QUAD..CROPPED_PASS_QUAD + 4].copy_from_slice(&pass_quad(crop));

        let (Some(vdata), Some(idata)) = (self.device.vdata, self.device.idata) else {
            return Err(GpuError::DeviceLost);
        };
        ctx.update_buffer(vdata, 0, bytemuck::cast_slice(&verts))?;
        ctx.bind_index_buffer(Some(idata), 0);

        let nearest = self.device.sampler_nearest;
        let linear = self.device.sampler_linear;
        let mut input = input;
        let mut input_size = (src_w, src_h);

        if use_post {
            for i in 0..self.passes.len() - 1 {
                let Some(target) = self.targets.get(i) else {
                    return Err(GpuError::BackendResourceExhaustion(format!(
                        "missing intermediate for pass {}",
                        i
                    )));
                };
                let Some(fb) = target.handle else {
                    return Err(GpuError::DeviceLost);
                };
                let pass = &self.passes[i];
                ctx.bind_render_target(Some(fb), RenderPassLoad::DontCare);
                Self::bind_input(ctx, input);
                let sampler = if flags.contains(OutputFlags::NEAREST) || pass.info.upscaling {
                    nearest
                } else {
                    linear
                };
                ctx.bind_sampler(0, sampler);
                ctx.bind_pipeline(pass.pipeline);
                ctx.set_viewport(Viewport::new(0.0, 0.0, target.width as f32, target.height as f32));
                ctx.set_scissor(ScissorRect {
                    x: 0,
                    y: 0,
                    width: target.width as i32,
                    height: target.height as i32,
                });
                let uniforms = self.uniforms_for(&pass.info, input_size, (target.width, target.height));
                ctx.update_uniforms(bytemuck::bytes_of(&uniforms));
                let quad = if i == 0 { CROPPED_PASS_QUAD } else { PASS_QUAD };
                ctx.bind_vertex_buffer(Some(vdata), quad * QUAD_VERTEX_SIZE);
                ctx.draw_indexed(6, 0)?;

                input = BoundInput::Framebuffer(fb);
                input_size = (target.width, target.height);
            }
        }

        ctx.bind_render_target(None, RenderPassLoad::Clear(CLEAR_COLOR));
        Self::bind_input(ctx, input);
        let final_pass = if use_post { self.passes.last() } else { None };
        let sampler = match final_pass {
            Some(pass) if pass.info.upscaling => nearest,
            _ if flags.contains(OutputFlags::NEAREST) => nearest,
            _ => linear,
        };
        ctx.bind_sampler(0, sampler);
        let pipeline = match final_pass {
            Some(pass) => pass.pipeline,
            None if flags.contains(OutputFlags::RB_SWIZZLE) => self.device.tex_color_rb_swizzle,
            None => self.device.tex_color,
        };
        ctx.bind_pipeline(pipeline);
        if let Some(pass) = final_pass {
            let uniforms = self.uniforms_for(
                &pass.info,
                input_size,
                (rc.w.max(1.0) as u32, rc.h.max(1.0) as u32),
            );
            ctx.update_uniforms(bytemuck::bytes_of(&uniforms));
        }
        ctx.bind_vertex_buffer(Some(vdata), FINAL_QUAD * QUAD_VERTEX_SIZE);
        ctx.set_scissor(ScissorRect {
            x: 0,
            y: 0,
            width: pw as i32,
            height: ph as i32,
        });

        let cardboard = cardboard_settings(pw as f32, ph as f32, &self.config.cardboard);
        if cardboard.enabled {
            for eye_x in [cardboard.left_eye_x, cardboard.right_eye_x] {
                ctx.set_viewport(Viewport::new(
                    eye_x,
                    cardboard.screen_y,
                    cardboard.screen_width,
                    cardboard.screen_height,
                ));
                ctx.draw_indexed(6, 0)?;
            }
        } else {
            ctx.set_viewport(Viewport::new(0.0, 0.0, pw as f32, ph as f32));
            ctx.draw_indexed(6, 0)?;
        }

        self.flip_count = self.flip_count.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{DrawCall, HeadlessDrawContext};
    use crate::config::CardboardConfig;

    fn chain(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn presenter(names: &[&str]) -> PresentationCommon {
        let config = PresentationConfig {
            post_shaders: chain(names),
            ..Default::default()
        };
        PresentationCommon::new(config, ShaderRegistry::with_builtins())
    }

    fn draws(ctx: &HeadlessDrawContext) -> Vec<&DrawCall> {
        ctx.calls()
            .iter()
            .filter(|c| matches!(c, DrawCall::DrawIndexed { .. }))
            .collect()
    }

    fn vertices(ctx: &HeadlessDrawContext, p: &PresentationCommon) -> Vec<QuadVertex> {
        let bytes = ctx.buffer(p.device.vdata.unwrap()).unwrap();
        bytes
            .chunks_exact(QUAD_VERTEX_SIZE)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    #[test]
    fn test_render_resolution_auto_and_fixed() {
        let mut config = PresentationConfig::default();
        let r = calculate_render_resolution(&config, &[], 1280, 720);
        assert_eq!(r, RenderResolution { scale: 3, width: 1440, height: 816 });

        config.render_scale = 2;
        assert_eq!(calculate_render_resolution(&config, &[], 1280, 720).width, 960);

        config.render_scale = 1;
        assert_eq!(calculate_render_resolution(&config, &[], 1280, 720).scale, 1);
    }

    #[test]
    fn test_render_resolution_first_pass_rules() {
        let reg = ShaderRegistry::with_builtins();
        let config = PresentationConfig {
            render_scale: 4,
            ..Default::default()
        };
        let upscale = vec![reg.get("SharpBilinear").unwrap().clone()];
        assert_eq!(calculate_render_resolution(&config, &upscale, 1280, 720).scale, 1);

        let ssaa = vec![reg.get("SSAAGauss").unwrap().clone()];
        // Automatic scale 3, doubled by the supersampler.
        assert_eq!(calculate_render_resolution(&config, &ssaa, 1280, 720).scale, 6);
    }

    #[test]
    fn test_intermediate_sizes() {
        let reg = ShaderRegistry::with_builtins();
        let render = RenderResolution { scale: 2, width: 960, height: 544 };
        let get = |n: &str| reg.get(n).unwrap().clone();

        let two = vec![get("Natural"), get("Vignette")];
        assert_eq!(intermediate_sizes(&two, render, (1270, 720), false), vec![(960, 544)]);

        let upscaled = vec![get("Natural"), get("SharpBilinear")];
        assert_eq!(intermediate_sizes(&upscaled, render, (1270, 720), false), vec![(480, 272)]);

        let out_res = vec![get("Scanlines"), get("Natural")];
        assert_eq!(intermediate_sizes(&out_res, render, (1270, 720), false), vec![(1270, 720)]);

        assert!(intermediate_sizes(&[get("Natural")], render, (1270, 720), false).is_empty());
    }

    #[test]
    fn test_uniforms() {
        let u = post_shader_uniforms(480, 272, 1280, 720, [0.5, 0.0, 0.0, 0.0], 2.0, 61, 125, true);
        assert_eq!(u.texel_delta, [1.0 / 480.0, 1.0 / 272.0]);
        assert_eq!(u.pixel_delta, [1.0 / 1280.0, 1.0 / 720.0]);
        assert_eq!(u.time, [2.0, 1.0 / 60.0, 61.0, 5.0]);
        assert_eq!(u.video, 1.0);
        assert_eq!(u.gl_half_pixel[0], 0.5 / 1280.0);
        assert_eq!(u.setting[0], 0.5);
    }

    #[test]
    fn test_passthrough_blit() {
        let mut ctx = HeadlessDrawContext::new(1280, 720);
        let mut p = presenter(&[]);
        assert!(p.update_post_shader(&mut ctx));
        assert_eq!(p.state(), PresentationState::NoShader);

        p.source_texture(vec![0xFFFF_FFFF; 480 * 272], 480, 272);
        p.copy_to_output(&mut ctx, OutputFlags::LINEAR, ScreenRotation::Horizontal, 0.0, 0.0, 1.0, 1.0)
            .unwrap();

        assert_eq!(draws(&ctx).len(), 1);
        assert!(ctx
            .calls()
            .contains(&DrawCall::BindPipeline(p.device.tex_color)));
        assert!(ctx.calls().contains(&DrawCall::BindSampler {
            slot: 0,
            sampler: p.device.sampler_linear
        }));
        assert_eq!(p.flip_count(), 1);
    }

    #[test]
    fn test_two_pass_chain_uses_one_intermediate() {
        let mut ctx = HeadlessDrawContext::new(1280, 720);
        let mut p = presenter(&["Natural", "Vignette"]);
        assert!(p.update_post_shader(&mut ctx));
        assert_eq!(p.state(), PresentationState::ShaderActive);
        assert_eq!(p.targets().len(), 1);

        let target = p.targets().get(0).unwrap();
        assert_eq!((target.width, target.height), (1440, 816));

        p.source_texture(vec![0; 480 * 272], 480, 272);
        p.copy_to_output(&mut ctx, OutputFlags::empty(), ScreenRotation::Horizontal, 0.0, 0.0, 1.0, 1.0)
            .unwrap();

        let binds: Vec<Option<FramebufferHandle>> = ctx
            .calls()
            .iter()
            .filter_map(|c| match c {
                DrawCall::BindRenderTarget { target, .. } => Some(*target),
                _ => None,
            })
            .collect();
        assert_eq!(binds, vec![target.handle, None]);
        assert_eq!(draws(&ctx).len(), 2);
        // The final pass samples the intermediate.
        assert!(ctx.calls().contains(&DrawCall::BindFramebufferAsTexture {
            framebuffer: target.handle.unwrap(),
            slot: 0
        }));
    }

    #[test]
    fn test_rb_swizzle_bypasses_chain() {
        let mut ctx = HeadlessDrawContext::new(1280, 720);
        let mut p = presenter(&["Natural", "Vignette"]);
        p.update_post_shader(&mut ctx);
        ctx.clear_calls();

        p.source_texture(vec![0; 480 * 272], 480, 272);
        p.copy_to_output(&mut ctx, OutputFlags::RB_SWIZZLE, ScreenRotation::Horizontal, 0.0, 0.0, 1.0, 1.0)
            .unwrap();
        assert_eq!(draws(&ctx).len(), 1);
        assert!(ctx
            .calls()
            .contains(&DrawCall::BindPipeline(p.device.tex_color_rb_swizzle)));
    }

    #[test]
    fn test_pillarbox_and_nearest_together() {
        let mut ctx = HeadlessDrawContext::new(1280, 720);
        let mut p = presenter(&[]);
        p.update_post_shader(&mut ctx);
        p.source_texture(vec![0; 480 * 272], 480, 272);
        p.copy_to_output(
            &mut ctx,
            OutputFlags::PILLARBOX | OutputFlags::NEAREST,
            ScreenRotation::Horizontal,
            0.0,
            0.0,
            1.0,
            1.0,
        )
        .unwrap();

        assert!(ctx.calls().contains(&DrawCall::BindSampler {
            slot: 0,
            sampler: p.device.sampler_nearest
        }));
        let verts = vertices(&ctx, &p);
        let rc = FRect::new(4.0, 0.0, 1270.0, 720.0);
        let expected_left = (rc.x * 2.0 / 1280.0 - 1.0) * 0.75;
        assert!((verts[0].x - expected_left).abs() < 1e-6);
    }

    #[test]
    fn test_compile_failure_falls_back() {
        let mut ctx = HeadlessDrawContext::new(1280, 720);
        let mut reg = ShaderRegistry::with_builtins();
        reg.register(ShaderInfo::new("Broken", "#error missing semicolon\nvoid main() {}"));
        let config = PresentationConfig {
            post_shaders: chain(&["Natural", "Broken"]),
            ..Default::default()
        };
        let mut p = PresentationCommon::new(config, reg);

        assert!(!p.update_post_shader(&mut ctx));
        assert_eq!(p.state(), PresentationState::NoShader);
        assert!(p.passes().is_empty());
        assert_eq!(p.targets().live_targets(), 0);
        let err = p.last_error().unwrap();
        assert!(err.starts_with("Post-shader error: ERROR: "));
        assert!(err.contains("missing semicolon"));
        // Only the pass that compiled was created, and it is gone again.
        assert_eq!(ctx.live_pipelines(), 0);

        p.source_texture(vec![0; 480 * 272], 480, 272);
        p.copy_to_output(&mut ctx, OutputFlags::empty(), ScreenRotation::Horizontal, 0.0, 0.0, 1.0, 1.0)
            .unwrap();
        assert_eq!(draws(&ctx).len(), 1);
    }

    #[test]
    fn test_intermediate_exhaustion_falls_back() {
        let mut ctx = HeadlessDrawContext::new(1280, 720);
        ctx.set_framebuffer_budget(Some(0));
        let mut p = presenter(&["Natural", "Vignette"]);
        assert!(!p.update_post_shader(&mut ctx));
        assert_eq!(p.state(), PresentationState::NoShader);
        assert!(p.last_error().is_some());
    }

    #[test]
    fn test_cardboard_draws_twice() {
        let mut ctx = HeadlessDrawContext::new(1280, 720);
        let config = PresentationConfig {
            cardboard: CardboardConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut p = PresentationCommon::new(config, ShaderRegistry::with_builtins());
        p.update_post_shader(&mut ctx);
        p.source_texture(vec![0; 480 * 272], 480, 272);
        p.copy_to_output(&mut ctx, OutputFlags::empty(), ScreenRotation::Horizontal, 0.0, 0.0, 1.0, 1.0)
            .unwrap();

        let viewports: Vec<Viewport> = ctx
            .calls()
            .iter()
            .filter_map(|c| match c {
                DrawCall::SetViewport(v) => Some(*v),
                _ => None,
            })
            .collect();
        assert_eq!(draws(&ctx).len(), 2);
        assert_eq!(viewports[0].x, 160.0);
        assert_eq!(viewports[1].x, 800.0);
    }

    #[test]
    fn test_no_source_clears() {
        let mut ctx = HeadlessDrawContext::new(64, 64);
        let mut p = presenter(&[]);
        p.copy_to_output(&mut ctx, OutputFlags::empty(), ScreenRotation::Horizontal, 0.0, 0.0, 1.0, 1.0)
            .unwrap();
        assert!(draws(&ctx).is_empty());
        assert_eq!(
            ctx.calls().last(),
            Some(&DrawCall::BindRenderTarget {
                target: None,
                load: RenderPassLoad::Clear(CLEAR_COLOR)
            })
        );
    }

    #[test]
    fn test_device_lost_and_restore() {
        let mut ctx = HeadlessDrawContext::new(1280, 720);
        let mut p = presenter(&["Natural", "Vignette"]);
        p.update_post_shader(&mut ctx);
        p.init_device_objects(&mut ctx).unwrap();

        ctx.lose_device();
        p.device_lost();
        assert_eq!(p.state(), PresentationState::DeviceLost);

        p.source_texture(vec![0; 480 * 272], 480, 272);
        assert!(matches!(
            p.copy_to_output(&mut ctx, OutputFlags::empty(), ScreenRotation::Horizontal, 0.0, 0.0, 1.0, 1.0),
            Err(GpuError::DeviceLost)
        ));

        ctx.restore_device();
        assert!(p.device_restore(&mut ctx));
        assert_eq!(p.state(), PresentationState::ShaderActive);
        assert_eq!(p.passes().len(), 2);
        assert!(p.passes().iter().all(PostShaderPass::is_compiled));
        let live = ctx.live_resources();

        assert!(p.device_restore(&mut ctx));
        assert_eq!(ctx.live_resources(), live);
        assert_eq!(p.targets().live_targets(), 1);
    }

    #[test]
    fn test_reconfigure_while_lost_is_deferred() {
        let mut ctx = HeadlessDrawContext::new(1280, 720);
        let mut p = presenter(&[]);
        p.update_post_shader(&mut ctx);

        ctx.lose_device();
        p.device_lost();
        let config = PresentationConfig {
            post_shaders: chain(&["Natural"]),
            ..Default::default()
        };
        assert!(!p.set_config(&mut ctx, config));
        assert!(p.passes().is_empty());

        ctx.restore_device();
        assert!(p.device_restore(&mut ctx));
        assert_eq!(p.passes().len(), 1);
        assert_eq!(p.state(), PresentationState::ShaderActive);
    }

    #[test]
    fn test_resize_rebuilds_intermediates() {
        let mut ctx = HeadlessDrawContext::new(1280, 720);
        let mut p = presenter(&["Natural", "Vignette"]);
        p.update_post_shader(&mut ctx);
        assert_eq!(p.targets().get(0).unwrap().width, 1440);

        ctx.resize(1920, 1080);
        p.source_texture(vec![0; 480 * 272], 480, 272);
        p.copy_to_output(&mut ctx, OutputFlags::empty(), ScreenRotation::Horizontal, 0.0, 0.0, 1.0, 1.0)
            .unwrap();
        assert_eq!(p.render_resolution().scale, 4);
        assert_eq!(p.targets().get(0).unwrap().width, 1920);
        assert_eq!(p.targets().live_targets(), 1);
    }

    #[test]
    fn test_later_source_replaces_earlier() {
        let mut ctx = HeadlessDrawContext::new(1280, 720);
        let mut p = presenter(&[]);
        p.update_post_shader(&mut ctx);
        let fb = ctx
            .create_framebuffer(&crate::backend::FramebufferDesc {
                width: 480,
                height: 272,
                depth: false,
                label: "test".to_string(),
            })
            .unwrap();
        p.source_texture(vec![0; 480 * 272], 480, 272);
        p.source_framebuffer(fb, 480, 272);
        p.copy_to_output(&mut ctx, OutputFlags::empty(), ScreenRotation::Horizontal, 0.0, 0.0, 1.0, 1.0)
            .unwrap();
        assert!(ctx.calls().contains(&DrawCall::BindFramebufferAsTexture {
            framebuffer: fb,
            slot: 0
        }));
        assert!(p.device.src_texture.is_none());
    }
}
