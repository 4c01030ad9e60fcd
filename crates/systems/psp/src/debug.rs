//! Read-only introspection for debuggers and frontends.

use crate::backend::{DrawContext, FbChannel};
use crate::framebuffer::{read_display_pixels, DisplayFramebuffer, DISPLAY_HEIGHT, DISPLAY_WIDTH};
use crate::gpu::PspGpu;
use crate::texture::{clut_colors, decode_texture};
use crate::GpuError;
use emu_core::types::Frame;

/// Snapshot of interpreter state for debug overlays.
#[derive(Debug, Clone)]
pub struct DebugInfo {
    /// Program counter of the interpreter
    pub pc: u32,
    /// Display list being executed, if any
    pub current_list: Option<usize>,
    pub queued_lists: usize,
    pub pending_draws: usize,
    pub framebuffer_count: usize,
    /// Guest address and size of the current render target
    pub render_target: Option<(u32, u32, u32)>,
    pub post_shaders: Vec<String>,
    pub backend: String,
    pub device_lost: bool,
}

/// One virtual framebuffer as listed by [`PspGpu::framebuffer_list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferSummary {
    pub address: u32,
    pub stride: u32,
    pub width: u32,
    pub height: u32,
    pub render_scale: u32,
    pub has_backend_object: bool,
}

impl<D: DrawContext> PspGpu<D> {
    pub fn get_debug_info(&self) -> DebugInfo {
        DebugInfo {
            pc: self.pc,
            current_list: self.current_list,
            queued_lists: self.lists.len(),
            pending_draws: self.draw.pending_draws(),
            framebuffer_count: self.framebuffers.framebuffers().len(),
            render_target: self
                .framebuffers
                .current()
                .map(|fb| (fb.fb_address, fb.width, fb.height)),
            post_shaders: self.shader_ids(),
            backend: self.ctx.capabilities().name,
            device_lost: self.is_device_lost(),
        }
    }

    /// Current render target contents.
    ///
    /// Color falls back to guest memory when the backend has no object for
    /// the target or cannot read it back. Depth and stencil come from the
    /// backend only.
    pub fn current_framebuffer(&self, channel: FbChannel) -> Result<Frame, GpuError> {
        let fb = self.framebuffers.current().ok_or_else(|| {
            GpuError::State("no render target is bound".to_string())
        })?;
        if let Some(handle) = fb.handle {
            let (width, height) = fb.render_size();
            match self.ctx.read_framebuffer(Some(handle), channel, 0, 0, width, height) {
                Ok(pixels) => {
                    return Ok(Frame {
                        width,
                        height,
                        pixels,
                    })
                }
                Err(e) if channel != FbChannel::Color => return Err(e.into()),
                Err(_) => {}
            }
        }
        if channel != FbChannel::Color {
            return Err(GpuError::State(format!("{:?} readback unavailable", channel)));
        }
        let display = DisplayFramebuffer {
            address: fb.fb_address,
            stride: fb.fb_stride,
            format: fb.format,
        };
        Ok(Frame {
            width: DISPLAY_WIDTH,
            height: DISPLAY_HEIGHT,
            pixels: read_display_pixels(&self.mem, display)?,
        })
    }

    /// Level 0 of the bound texture, decoded from guest memory.
    pub fn current_texture(&self) -> Result<Frame, GpuError> {
        let tex = decode_texture(&self.gstate, &self.mem)?;
        Ok(Frame {
            width: tex.width,
            height: tex.height,
            pixels: tex.pixels,
        })
    }

    /// The loaded palette as a one-row image.
    pub fn current_clut(&self) -> Frame {
        let pixels = clut_colors(&self.gstate);
        Frame {
            width: pixels.len() as u32,
            height: 1,
            pixels,
        }
    }

    pub fn framebuffer_list(&self) -> Vec<FramebufferSummary> {
        self.framebuffers
            .framebuffers()
            .iter()
            .map(|fb| FramebufferSummary {
                address: fb.fb_address,
                stride: fb.fb_stride,
                width: fb.width,
                height: fb.height,
                render_scale: fb.render_scale,
                has_backend_object: fb.handle.is_some(),
            })
            .collect()
    }

    /// Names of the compiled post-shader passes, in order.
    pub fn shader_ids(&self) -> Vec<String> {
        self.presentation
            .passes()
            .iter()
            .map(|p| p.info.name.clone())
            .collect()
    }

    pub fn shader_description(&self, id: &str) -> Option<String> {
        let info = self.presentation.registry().get(id)?;
        let mut desc = format!("{} (parent: {})", info.name, info.parent.as_deref().unwrap_or("-"));
        if info.output_resolution {
            desc.push_str(", output resolution");
        }
        if info.upscaling {
            desc.push_str(", upscaling");
        }
        if info.ssaa_level > 1 {
            desc.push_str(&format!(", {}x SSAA", info.ssaa_level));
        }
        for s in &info.settings {
            desc.push_str(&format!(", {}={}", s.name, s.value));
        }
        Some(desc)
    }

    pub fn stats_string(&self) -> String {
        let s = &self.stats;
        format!(
            "frames {} | commands {} (unknown {}) | draws {} | flushes {} | submissions {} \
             ({} vertices) | dropped {} (truncated vertices {}) | errors: memory {} submission {} backend {} | \
             pipelines {} | textures {} | transfers {} | lists {}",
            s.frames,
            s.commands,
            s.unknown_opcodes,
            s.draw_calls,
            s.flushes,
            s.submissions,
            s.vertices_submitted,
            s.dropped_batches,
            s.truncated_vertices,
            s.memory_errors,
            s.submission_errors,
            s.backend_errors,
            s.pipelines_created,
            s.textures_decoded,
            s.block_transfers,
            s.lists_completed,
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::headless::HeadlessDrawContext;
    use crate::backend::FbChannel;
    use crate::command::*;
    use crate::memory::VRAM_BASE;
    use crate::PspGpu;

    fn gpu() -> PspGpu<HeadlessDrawContext> {
        PspGpu::with_backend(HeadlessDrawContext::new(480, 272))
    }

    #[test]
    fn test_no_render_target() {
        let gpu = gpu();
        assert!(gpu.current_framebuffer(FbChannel::Color).is_err());
        let info = gpu.get_debug_info();
        assert_eq!(info.framebuffer_count, 0);
        assert_eq!(info.render_target, None);
    }

    #[test]
    fn test_clut_as_row() {
        let mut gpu = gpu();
        gpu.memory_mut()
            .write_words(VRAM_BASE, &[0xFF11_2233; 16])
            .unwrap();
        gpu.execute_word(word(GE_CMD_CLUTFORMAT, 3));
        gpu.execute_word(word(GE_CMD_CLUTADDR, VRAM_BASE & 0xFF_FFF0));
        gpu.execute_word(word(GE_CMD_CLUTADDRUPPER, (VRAM_BASE >> 8) & 0x0F_0000));
        gpu.execute_word(word(GE_CMD_LOADCLUT, 2));
        let clut = gpu.current_clut();
        assert_eq!((clut.width, clut.height), (16, 1));
    }

    #[test]
    fn test_stats_string_mentions_counters() {
        let mut gpu = gpu();
        gpu.execute_word(0x0300_0000);
        let s = gpu.stats_string();
        assert!(s.contains("unknown 1"));
    }

    #[test]
    fn test_builtin_shader_description() {
        let gpu = gpu();
        let name = gpu.presentation().registry().names().next().map(str::to_string);
        if let Some(name) = name {
            assert!(gpu.shader_description(&name).unwrap().starts_with(&name));
        }
        assert!(gpu.shader_description("no-such-shader").is_none());
    }
}
