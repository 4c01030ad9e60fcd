//! Recording backend with no GPU behind it.
//!
//! Every bind, state change and draw is appended to a call log. Render
//! targets keep a CPU-side color plane that clears write into, so readback
//! returns something meaningful. Device loss and resource exhaustion can be
//! simulated.

use super::*;
use std::collections::HashMap;

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCall {
    BindRenderTarget {
        target: Option<FramebufferHandle>,
        load: RenderPassLoad,
    },
    BindFramebufferAsTexture {
        framebuffer: FramebufferHandle,
        slot: u32,
    },
    BindTexture {
        slot: u32,
        texture: Option<TextureHandle>,
    },
    BindSampler {
        slot: u32,
        sampler: Option<SamplerHandle>,
    },
    BindPipeline(Option<PipelineHandle>),
    BindVertexBuffer(Option<BufferHandle>, usize),
    BindIndexBuffer(Option<BufferHandle>, usize),
    UpdateUniforms {
        size: usize,
    },
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    DrawIndexed {
        index_count: u32,
        first_index: u32,
    },
}

#[derive(Debug, Clone)]
enum Resource {
    Shader,
    Pipeline(Box<PipelineDesc>),
    Sampler(SamplerDesc),
    Buffer { data: Vec<u8> },
    Framebuffer { desc: FramebufferDesc, color: Vec<u32> },
    Texture { width: u32, height: u32, pixels: Vec<u32> },
}

pub struct HeadlessDrawContext {
    width: u32,
    height: u32,
    next_id: u32,
    resources: HashMap<u32, Resource>,
    backbuffer: Vec<u32>,
    current_target: Option<FramebufferHandle>,
    calls: Vec<DrawCall>,
    device_lost: bool,
    framebuffer_budget: Option<usize>,
    fail_submissions: bool,
    shaders_compiled: usize,
}

impl HeadlessDrawContext {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            next_id: 1,
            resources: HashMap::new(),
            backbuffer: vec![0; (width * height) as usize],
            current_target: None,
            calls: Vec::new(),
            device_lost: false,
            framebuffer_budget: None,
            fail_submissions: false,
            shaders_compiled: 0,
        }
    }

    pub fn calls(&self) -> &[DrawCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<DrawCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Number of `DrawIndexed` calls recorded so far.
    pub fn draw_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, DrawCall::DrawIndexed { .. }))
            .count()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.resources
            .values()
            .filter(|r| matches!(r, Resource::Framebuffer { .. }))
            .count()
    }

    pub fn live_pipelines(&self) -> usize {
        self.resources
            .values()
            .filter(|r| matches!(r, Resource::Pipeline(_)))
            .count()
    }

    pub fn live_resources(&self) -> usize {
        self.resources.len()
    }

    pub fn shaders_compiled(&self) -> usize {
        self.shaders_compiled
    }

    /// Size of a live framebuffer.
    pub fn framebuffer_size(&self, fb: FramebufferHandle) -> Option<(u32, u32)> {
        match self.resources.get(&fb.0) {
            Some(Resource::Framebuffer { desc, .. }) => Some((desc.width, desc.height)),
            _ => None,
        }
    }

    /// Size and contents of a live texture.
    pub fn texture(&self, tex: TextureHandle) -> Option<(u32, u32, &[u32])> {
        match self.resources.get(&tex.0) {
            Some(Resource::Texture {
                width,
                height,
                pixels,
            }) => Some((*width, *height, pixels.as_slice())),
            _ => None,
        }
    }

    pub fn buffer(&self, buffer: BufferHandle) -> Option<&[u8]> {
        match self.resources.get(&buffer.0) {
            Some(Resource::Buffer { data }) => Some(data.as_slice()),
            _ => None,
        }
    }

    pub fn sampler(&self, sampler: SamplerHandle) -> Option<SamplerDesc> {
        match self.resources.get(&sampler.0) {
            Some(Resource::Sampler(desc)) => Some(*desc),
            _ => None,
        }
    }

    pub fn pipeline(&self, pipeline: PipelineHandle) -> Option<&PipelineDesc> {
        match self.resources.get(&pipeline.0) {
            Some(Resource::Pipeline(desc)) => Some(desc),
            _ => None,
        }
    }

    /// Allow at most `budget` live framebuffers; `None` removes the limit.
    pub fn set_framebuffer_budget(&mut self, budget: Option<usize>) {
        self.framebuffer_budget = budget;
    }

    /// Make every draw fail with a submission error.
    pub fn set_fail_submissions(&mut self, fail: bool) {
        self.fail_submissions = fail;
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.backbuffer = vec![0; (width * height) as usize];
    }

    /// Simulate device loss: every handle becomes invalid.
    pub fn lose_device(&mut self) {
        self.device_lost = true;
        self.resources.clear();
        self.current_target = None;
    }

    pub fn restore_device(&mut self) {
        self.device_lost = false;
    }

    fn alloc(&mut self, resource: Resource) -> Result<u32, BackendError> {
        if self.device_lost {
            return Err(BackendError::DeviceLost);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.resources.insert(id, resource);
        Ok(id)
    }

    fn release(&mut self, id: u32) {
        self.resources.remove(&id);
    }

    /// Produce a GLSL-style compiler log for sources carrying `#error`.
    fn check_source(stage: ShaderStage, source: &str) -> Result<(), BackendError> {
        let Some((line_no, line)) = source
            .lines()
            .enumerate()
            .find(|(_, l)| l.trim_start().starts_with("#error"))
        else {
            return Ok(());
        };
        let header = match stage {
            ShaderStage::Vertex => "Vertex shader failed to compile with the following errors:",
            ShaderStage::Fragment => "Fragment shader failed to compile with the following errors:",
        };
        let message = line.trim_start().trim_start_matches("#error").trim();
        Err(BackendError::ShaderCompile(format!(
            "{}\nERROR: 0:{}: '#error' : {}\nERROR: 1 compilation errors.  No code generated.\n",
            header,
            line_no + 1,
            message
        )))
    }
}

impl DrawContext for HeadlessDrawContext {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "Headless".to_string(),
            shader_language: ShaderLanguage::Glsl,
            max_texture_size: 4096,
            depth_readback: false,
            stencil_readback: false,
        }
    }

    fn backbuffer_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn is_device_lost(&self) -> bool {
        self.device_lost
    }

    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        _language: ShaderLanguage,
        source: &str,
    ) -> Result<ShaderHandle, BackendError> {
        if self.device_lost {
            return Err(BackendError::DeviceLost);
        }
        Self::check_source(stage, source)?;
        self.shaders_compiled += 1;
        self.alloc(Resource::Shader).map(ShaderHandle)
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        self.release(shader.0);
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle, BackendError> {
        for shader in [desc.vertex_shader, desc.fragment_shader] {
            if !matches!(self.resources.get(&shader.0), Some(Resource::Shader)) && !self.device_lost
            {
                return Err(BackendError::InvalidHandle(shader.0));
            }
        }
        self.alloc(Resource::Pipeline(Box::new(desc.clone())))
            .map(PipelineHandle)
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.release(pipeline.0);
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle, BackendError> {
        self.alloc(Resource::Sampler(*desc)).map(SamplerHandle)
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.release(sampler.0);
    }

    fn create_buffer(
        &mut self,
        size: usize,
        _usage: BufferUsage,
    ) -> Result<BufferHandle, BackendError> {
        self.alloc(Resource::Buffer {
            data: vec![0; size],
        })
        .map(BufferHandle)
    }

    fn update_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), BackendError> {
        if self.device_lost {
            return Err(BackendError::DeviceLost);
        }
        match self.resources.get_mut(&buffer.0) {
            Some(Resource::Buffer { data: storage }) => {
                let end = offset + data.len();
                if end > storage.len() {
                    return Err(BackendError::Api(format!(
                        "buffer update {}..{} exceeds size {}",
                        offset,
                        end,
                        storage.len()
                    )));
                }
                storage[offset..end].copy_from_slice(data);
                Ok(())
            }
            _ => Err(BackendError::InvalidHandle(buffer.0)),
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.release(buffer.0);
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDesc,
    ) -> Result<FramebufferHandle, BackendError> {
        if let Some(budget) = self.framebuffer_budget {
            if self.live_framebuffers() >= budget {
                return Err(BackendError::OutOfResources(format!(
                    "framebuffer budget of {} exhausted",
                    budget
                )));
            }
        }
        if desc.width == 0 || desc.height == 0 || desc.width > 4096 || desc.height > 4096 {
            return Err(BackendError::OutOfResources(format!(
                "unsupported framebuffer size {}x{}",
                desc.width, desc.height
            )));
        }
        let color = vec![0; (desc.width * desc.height) as usize];
        self.alloc(Resource::Framebuffer {
            desc: desc.clone(),
            color,
        })
        .map(FramebufferHandle)
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if self.current_target == Some(framebuffer) {
            self.current_target = None;
        }
        self.release(framebuffer.0);
    }

    fn framebuffer_dimensions(&self, framebuffer: Option<FramebufferHandle>) -> (u32, u32) {
        match framebuffer {
            None => (self.width, self.height),
            Some(fb) => self.framebuffer_size(fb).unwrap_or((0, 0)),
        }
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        pixels: &[u32],
    ) -> Result<TextureHandle, BackendError> {
        self.alloc(Resource::Texture {
            width,
            height,
            pixels: pixels.to_vec(),
        })
        .map(TextureHandle)
    }

    fn update_texture(
        &mut self,
        texture: TextureHandle,
        width: u32,
        height: u32,
        pixels: &[u32],
    ) -> Result<(), BackendError> {
        if self.device_lost {
            return Err(BackendError::DeviceLost);
        }
        match self.resources.get_mut(&texture.0) {
            Some(Resource::Texture {
                width: w,
                height: h,
                pixels: p,
            }) => {
                *w = width;
                *h = height;
                *p = pixels.to_vec();
                Ok(())
            }
            _ => Err(BackendError::InvalidHandle(texture.0)),
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.release(texture.0);
    }

    fn bind_render_target(&mut self, framebuffer: Option<FramebufferHandle>, load: RenderPassLoad) {
        self.current_target = framebuffer;
        if let RenderPassLoad::Clear(color) = load {
            match framebuffer {
                None => self.backbuffer.fill(color),
                Some(fb) => {
                    if let Some(Resource::Framebuffer { color: plane, .. }) =
                        self.resources.get_mut(&fb.0)
                    {
                        plane.fill(color);
                    }
                }
            }
        }
        self.calls.push(DrawCall::BindRenderTarget {
            target: framebuffer,
            load,
        });
    }

    fn bind_framebuffer_as_texture(&mut self, framebuffer: FramebufferHandle, slot: u32) {
        self.calls
            .push(DrawCall::BindFramebufferAsTexture { framebuffer, slot });
    }

    fn bind_texture(&mut self, slot: u32, texture: Option<TextureHandle>) {
        self.calls.push(DrawCall::BindTexture { slot, texture });
    }

    fn bind_sampler(&mut self, slot: u32, sampler: Option<SamplerHandle>) {
        self.calls.push(DrawCall::BindSampler { slot, sampler });
    }

    fn bind_pipeline(&mut self, pipeline: Option<PipelineHandle>) {
        self.calls.push(DrawCall::BindPipeline(pipeline));
    }

    fn bind_vertex_buffer(&mut self, buffer: Option<BufferHandle>, offset: usize) {
        self.calls.push(DrawCall::BindVertexBuffer(buffer, offset));
    }

    fn bind_index_buffer(&mut self, buffer: Option<BufferHandle>, offset: usize) {
        self.calls.push(DrawCall::BindIndexBuffer(buffer, offset));
    }

    fn update_uniforms(&mut self, data: &[u8]) {
        self.calls.push(DrawCall::UpdateUniforms { size: data.len() });
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.calls.push(DrawCall::SetViewport(viewport));
    }

    fn set_scissor(&mut self, rect: ScissorRect) {
        self.calls.push(DrawCall::SetScissor(rect));
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32) -> Result<(), BackendError> {
        if self.device_lost {
            return Err(BackendError::DeviceLost);
        }
        if self.fail_submissions {
            return Err(BackendError::Submission(
                "injected submission failure".to_string(),
            ));
        }
        self.calls.push(DrawCall::DrawIndexed {
            index_count,
            first_index,
        });
        Ok(())
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
        if self.device_lost {
            return Err(BackendError::DeviceLost);
        }
        if channel != FbChannel::Color {
            return Err(BackendError::Api(format!(
                "{:?} readback not supported",
                channel
            )));
        }
        let (plane, pw, ph) = match framebuffer {
            None => (&self.backbuffer, self.width, self.height),
            Some(fb) => match self.resources.get(&fb.0) {
                Some(Resource::Framebuffer { desc, color }) => (color, desc.width, desc.height),
                _ => return Err(BackendError::InvalidHandle(fb.0)),
            },
        };
        if x + width > pw || y + height > ph {
            return Err(BackendError::Api(format!(
                "readback {}x{}+{}+{} outside {}x{}",
                width, height, x, y, pw, ph
            )));
        }
        let mut out = Vec::with_capacity((width * height) as usize);
        for row in y..y + height {
            let start = (row * pw + x) as usize;
            out.extend_from_slice(&plane[start..start + width as usize]);
        }
        Ok(out)
    }
}
