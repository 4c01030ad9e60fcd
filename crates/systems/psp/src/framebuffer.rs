//! Render target bookkeeping.
//!
//! Guest framebuffers are tracked as [`VirtualFramebuffer`]s keyed by their
//! VRAM address. Each one owns an optional backend framebuffer created at the
//! current render scale; the logical description survives device loss and the
//! backend object is recreated from it on restore.
//!
//! [`PostShaderTargets`] holds the intermediate targets of the post-processing
//! chain, reusing same-sized targets between rebuilds.

use crate::backend::{DrawContext, FramebufferDesc, FramebufferHandle};
use crate::gstate::GpuStateStore;
use crate::memory::GuestMemory;
use crate::presentation::{OutputFlags, PresentationCommon};
use crate::GpuStats;
use emu_core::graphics::{ColorOps, PixelFormat};
use emu_core::logging::{log, LogCategory, LogLevel};

/// Frames a framebuffer may go unused before it is destroyed.
pub const FBO_OLD_AGE: u64 = 6;
/// Largest guest framebuffer dimension.
pub const MAX_FB_DIMENSION: u32 = 512;

pub const DISPLAY_WIDTH: u32 = 480;
pub const DISPLAY_HEIGHT: u32 = 272;

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualFramebuffer {
    pub fb_address: u32,
    pub fb_stride: u32,
    pub z_address: u32,
    pub z_stride: u32,
    pub format: PixelFormat,
    /// Size in guest pixels
    pub width: u32,
    pub height: u32,
    /// Scale the backend object was created at
    pub render_scale: u32,
    pub last_frame_used: u64,
    pub handle: Option<FramebufferHandle>,
}

impl VirtualFramebuffer {
    pub fn render_size(&self) -> (u32, u32) {
        (self.width * self.render_scale, self.height * self.render_scale)
    }

    fn desc(&self) -> FramebufferDesc {
        let (width, height) = self.render_size();
        FramebufferDesc {
            width,
            height,
            depth: true,
            label: format!("fb_{:08x}", self.fb_address),
        }
    }
}

/// Framebuffer the display hardware scans out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayFramebuffer {
    pub address: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

/// Guest framebuffer size from the stride and the region/scissor extents.
pub fn estimate_framebuffer_size(gstate: &GpuStateStore) -> (u32, u32) {
    let region = gstate.region();
    let scissor = gstate.scissor();
    let stride = gstate.framebuf_stride();
    let width = (region.x2.max(scissor.x2) + 1).min(stride);
    let height = region.y2.max(scissor.y2) + 1;
    (
        width.min(MAX_FB_DIMENSION),
        height.min(MAX_FB_DIMENSION),
    )
}

#[derive(Debug)]
pub struct FramebufferManager {
    vfbs: Vec<VirtualFramebuffer>,
    current: Option<usize>,
    display: Option<DisplayFramebuffer>,
    render_scale: u32,
    frame: u64,
}

impl FramebufferManager {
    pub fn new() -> Self {
        Self {
            vfbs: Vec::new(),
            current: None,
            display: None,
            render_scale: 1,
            frame: 0,
        }
    }

    pub fn framebuffers(&self) -> &[VirtualFramebuffer] {
        &self.vfbs
    }

    pub fn current(&self) -> Option<&VirtualFramebuffer> {
        self.current.and_then(|i| self.vfbs.get(i))
    }

    pub fn display(&self) -> Option<DisplayFramebuffer> {
        self.display
    }

    pub fn render_scale(&self) -> u32 {
        self.render_scale
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Change the render scale. Backend objects at the old scale are dropped
    /// and recreated on next use.
    pub fn set_render_scale<D: DrawContext>(&mut self, ctx: &mut D, scale: u32) {
        let scale = scale.max(1);
        if scale == self.render_scale {
            return;
        }
        log(LogCategory::Framebuffer, LogLevel::Info, || {
            format!("Render scale {} -> {}", self.render_scale, scale)
        });
        self.render_scale = scale;
        for vfb in &mut self.vfbs {
            if let Some(handle) = vfb.handle.take() {
                ctx.destroy_framebuffer(handle);
            }
        }
    }

    pub fn set_display_framebuffer(&mut self, address: u32, stride: u32, format: PixelFormat) {
        self.display = Some(DisplayFramebuffer {
            address: address & 0x0FFF_FFFF,
            stride,
            format,
        });
    }

    /// Find or create the framebuffer the current registers draw into and
    /// return its backend handle.
    pub fn set_render_framebuffer<D: DrawContext>(
        &mut self,
        gstate: &GpuStateStore,
        ctx: &mut D,
        stats: &mut GpuStats,
    ) -> Option<FramebufferHandle> {
        let address = gstate.framebuf_address() & 0x0FFF_FFFF;
        let stride = gstate.framebuf_stride();
        if stride == 0 {
            log(LogCategory::Framebuffer, LogLevel::Debug, || {
                format!("Framebuffer at {:08x} has zero stride, not rendering", address)
            });
            self.current = None;
            return None;
        }
        let (width, height) = estimate_framebuffer_size(gstate);
        let format = gstate.framebuf_format();

        let index = match self.vfbs.iter().position(|v| v.fb_address == address) {
            Some(i) => {
                let vfb = &mut self.vfbs[i];
                vfb.fb_stride = stride;
                vfb.format = format;
                if width > vfb.width || height > vfb.height {
                    log(LogCategory::Framebuffer, LogLevel::Debug, || {
                        format!(
                            "Resizing framebuffer {:08x}: {}x{} -> {}x{}",
                            address,
                            vfb.width,
                            vfb.height,
                            width.max(vfb.width),
                            height.max(vfb.height)
                        )
                    });
                    vfb.width = vfb.width.max(width);
                    vfb.height = vfb.height.max(height);
                    if let Some(handle) = vfb.handle.take() {
                        ctx.destroy_framebuffer(handle);
                    }
                }
                i
            }
            None => {
                log(LogCategory::Framebuffer, LogLevel::Info, || {
                    format!(
                        "Creating framebuffer {:08x} ({}x{}, stride {}, {:?})",
                        address, width, height, stride, format
                    )
                });
                self.vfbs.push(VirtualFramebuffer {
                    fb_address: address,
                    fb_stride: stride,
                    z_address: gstate.depthbuf_address() & 0x0FFF_FFFF,
                    z_stride: gstate.depthbuf_stride(),
                    format,
                    width,
                    height,
                    render_scale: self.render_scale,
                    last_frame_used: self.frame,
                    handle: None,
                });
                self.vfbs.len() - 1
            }
        };

        self.current = Some(index);
        let scale = self.render_scale;
        let frame = self.frame;
        let vfb = &mut self.vfbs[index];
        vfb.last_frame_used = frame;
        vfb.z_address = gstate.depthbuf_address() & 0x0FFF_FFFF;
        vfb.z_stride = gstate.depthbuf_stride();
        if vfb.handle.is_none() {
            vfb.render_scale = scale;
            Self::create_backend(vfb, ctx, stats);
        }
        vfb.handle
    }

    fn create_backend<D: DrawContext>(
        vfb: &mut VirtualFramebuffer,
        ctx: &mut D,
        stats: &mut GpuStats,
    ) -> bool {
        match ctx.create_framebuffer(&vfb.desc()) {
            Ok(handle) => {
                vfb.handle = Some(handle);
                true
            }
            Err(e) => {
                stats.backend_errors += 1;
                log(LogCategory::Framebuffer, LogLevel::Error, || {
                    format!(
                        "Failed to create framebuffer {:08x}: {}",
                        vfb.fb_address, e
                    )
                });
                false
            }
        }
    }

    /// Advance the frame counter and destroy framebuffers unused for
    /// [`FBO_OLD_AGE`] frames.
    pub fn begin_frame<D: DrawContext>(&mut self, ctx: &mut D) {
        self.frame += 1;
        self.decimate(ctx);
    }

    pub fn decimate<D: DrawContext>(&mut self, ctx: &mut D) {
        let frame = self.frame;
        let display = self.display.map(|d| d.address);
        let current = self.current.map(|i| self.vfbs[i].fb_address);
        let before = self.vfbs.len();
        self.vfbs.retain(|vfb| {
            let keep = frame.saturating_sub(vfb.last_frame_used) <= FBO_OLD_AGE
                || Some(vfb.fb_address) == display
                || Some(vfb.fb_address) == current;
            if !keep {
                log(LogCategory::Framebuffer, LogLevel::Debug, || {
                    format!("Decimating framebuffer {:08x}", vfb.fb_address)
                });
                if let Some(handle) = vfb.handle {
                    ctx.destroy_framebuffer(handle);
                }
            }
            keep
        });
        if self.vfbs.len() != before {
            self.current = current.and_then(|a| self.vfbs.iter().position(|v| v.fb_address == a));
        }
    }

    /// Forget every backend handle without destroying it.
    pub fn device_lost(&mut self) {
        for vfb in &mut self.vfbs {
            vfb.handle = None;
        }
    }

    /// Recreate missing backend objects. Returns false if any failed.
    pub fn device_restore<D: DrawContext>(&mut self, ctx: &mut D, stats: &mut GpuStats) -> bool {
        let scale = self.render_scale;
        let mut ok = true;
        for vfb in self.vfbs.iter_mut().filter(|v| v.handle.is_none()) {
            vfb.render_scale = scale;
            ok &= Self::create_backend(vfb, ctx, stats);
        }
        ok
    }

    pub fn destroy_all<D: DrawContext>(&mut self, ctx: &mut D) {
        for vfb in self.vfbs.drain(..) {
            if let Some(handle) = vfb.handle {
                ctx.destroy_framebuffer(handle);
            }
        }
        self.current = None;
    }

    /// The virtual framebuffer matching the display address.
    pub fn display_source(&self) -> Option<&VirtualFramebuffer> {
        let display = self.display?;
        self.vfbs
            .iter()
            .find(|v| v.fb_address == display.address && v.handle.is_some())
    }

    /// Present the display framebuffer.
    ///
    /// Uses the matching rendered framebuffer when there is one; otherwise the
    /// display memory is converted and uploaded as a texture.
    pub fn copy_display_to_output<D: DrawContext>(
        &mut self,
        mem: &GuestMemory,
        presentation: &mut PresentationCommon,
        ctx: &mut D,
        stats: &mut GpuStats,
    ) {
        let Some(display) = self.display else {
            log(LogCategory::Framebuffer, LogLevel::Debug, || {
                "No display framebuffer set; presenting black".to_string()
            });
            presentation.clear_output(ctx);
            return;
        };

        let rotation = presentation.config().internal_rotation;
        let result = match self.display_source().and_then(|v| v.handle.map(|h| (h, v))) {
            Some((handle, vfb)) => {
                let (w, h) = vfb.render_size();
                let u1 = ((DISPLAY_WIDTH * vfb.render_scale) as f32 / w as f32).min(1.0);
                let v1 = ((DISPLAY_HEIGHT * vfb.render_scale) as f32 / h as f32).min(1.0);
                presentation.source_framebuffer(handle, w, h);
                presentation.copy_to_output(ctx, OutputFlags::empty(), rotation, 0.0, 0.0, u1, v1)
            }
            None => match read_display_pixels(mem, display) {
                Ok(pixels) => {
                    presentation.source_texture(pixels, DISPLAY_WIDTH, DISPLAY_HEIGHT);
                    presentation.copy_to_output(
                        ctx,
                        OutputFlags::empty(),
                        rotation,
                        0.0,
                        0.0,
                        1.0,
                        1.0,
                    )
                }
                Err(e) => {
                    stats.memory_errors += 1;
                    log(LogCategory::Framebuffer, LogLevel::Error, || {
                        format!("Display framebuffer {:08x} unreadable: {}", display.address, e)
                    });
                    presentation.clear_output(ctx);
                    Ok(())
                }
            },
        };

        if let Err(e) = result {
            stats.backend_errors += 1;
            log(LogCategory::Present, LogLevel::Error, || {
                format!("Presentation failed: {}", e)
            });
        }
    }
}

impl Default for FramebufferManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert 480x272 pixels of display memory to ARGB.
pub fn read_display_pixels(
    mem: &GuestMemory,
    display: DisplayFramebuffer,
) -> Result<Vec<u32>, crate::GpuError> {
    let bpp = display.format.bytes_per_pixel() as u32;
    let stride = display.stride.max(DISPLAY_WIDTH);
    let mut pixels = vec![0u32; (DISPLAY_WIDTH * DISPLAY_HEIGHT) as usize];
    for (y, row) in pixels.chunks_exact_mut(DISPLAY_WIDTH as usize).enumerate() {
        let addr = display.address + y as u32 * stride * bpp;
        let src = mem.slice(addr, (DISPLAY_WIDTH * bpp) as usize)?;
        ColorOps::convert_row(display.format, src, row);
    }
    Ok(pixels)
}

/// An intermediate post-processing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrevFbo {
    pub handle: Option<FramebufferHandle>,
    pub width: u32,
    pub height: u32,
}

/// Intermediate targets for the post-processing chain.
///
/// `pool` owns every target; `chain` lists, per pass, the pool entry the pass
/// renders into.
#[derive(Debug, Default)]
pub struct PostShaderTargets {
    pool: Vec<PrevFbo>,
    chain: Vec<usize>,
}

impl PostShaderTargets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start assigning targets for a new chain. Pool entries stay available
    /// for reuse until [`finish_chain`](Self::finish_chain).
    pub fn begin_chain(&mut self) {
        self.chain.clear();
    }

    /// Append a `width` x `height` target to the chain, reusing a pooled
    /// target of that size unless it is the one the previous pass uses.
    pub fn allocate_framebuffer<D: DrawContext>(
        &mut self,
        ctx: &mut D,
        width: u32,
        height: u32,
    ) -> bool {
        let last = self.chain.last().copied();
        let reusable = self.pool.iter().enumerate().position(|(i, p)| {
            p.width == width
                && p.height == height
                && p.handle.is_some()
                && Some(i) != last
                && !self.chain.contains(&i)
        });
        if let Some(i) = reusable {
            self.chain.push(i);
            return true;
        }

        match ctx.create_framebuffer(&FramebufferDesc {
            width,
            height,
            depth: false,
            label: "presentation".to_string(),
        }) {
            Ok(handle) => {
                self.pool.push(PrevFbo {
                    handle: Some(handle),
                    width,
                    height,
                });
                self.chain.push(self.pool.len() - 1);
                true
            }
            Err(e) => {
                log(LogCategory::Present, LogLevel::Error, || {
                    format!("Failed to allocate {}x{} post-shader target: {}", width, height, e)
                });
                false
            }
        }
    }

    /// Destroy pooled targets the current chain does not use.
    pub fn finish_chain<D: DrawContext>(&mut self, ctx: &mut D) {
        let mut remap = vec![None; self.pool.len()];
        let mut kept = Vec::with_capacity(self.chain.len());
        for (i, fbo) in self.pool.iter().enumerate() {
            if self.chain.contains(&i) {
                remap[i] = Some(kept.len());
                kept.push(*fbo);
            } else if let Some(handle) = fbo.handle {
                ctx.destroy_framebuffer(handle);
            }
        }
        self.pool = kept;
        for idx in &mut self.chain {
            if let Some(new) = remap[*idx] {
                *idx = new;
            }
        }
    }

    /// Target of pass `pass`.
    pub fn get(&self, pass: usize) -> Option<PrevFbo> {
        self.chain.get(pass).and_then(|&i| self.pool.get(i)).copied()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn live_targets(&self) -> usize {
        self.pool.iter().filter(|p| p.handle.is_some()).count()
    }

    pub fn destroy_all<D: DrawContext>(&mut self, ctx: &mut D) {
        for fbo in self.pool.drain(..) {
            if let Some(handle) = fbo.handle {
                ctx.destroy_framebuffer(handle);
            }
        }
        self.chain.clear();
    }

    pub fn device_lost(&mut self) {
        for fbo in &mut self.pool {
            fbo.handle = None;
        }
    }

    /// Recreate lost targets at their recorded sizes.
    pub fn device_restore<D: DrawContext>(&mut self, ctx: &mut D) -> bool {
        let mut ok = true;
        for fbo in self.pool.iter_mut().filter(|p| p.handle.is_none()) {
            match ctx.create_framebuffer(&FramebufferDesc {
                width: fbo.width,
                height: fbo.height,
                depth: false,
                label: "presentation".to_string(),
            }) {
                Ok(handle) => fbo.handle = Some(handle),
                Err(_) => ok = false,
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessDrawContext;
    use crate::command::*;

    fn state_for(addr: u32, stride: u32, w: u32, h: u32) -> GpuStateStore {
        let mut s = GpuStateStore::new();
        s.cmdmem[GE_CMD_FRAMEBUFPTR as usize] = word(GE_CMD_FRAMEBUFPTR, addr & 0xFF_FFF0);
        s.cmdmem[GE_CMD_FRAMEBUFWIDTH as usize] = word(GE_CMD_FRAMEBUFWIDTH, stride);
        s.cmdmem[GE_CMD_REGION2 as usize] = word(GE_CMD_REGION2, (w - 1) | ((h - 1) << 10));
        s.cmdmem[GE_CMD_SCISSOR2 as usize] = word(GE_CMD_SCISSOR2, (w - 1) | ((h - 1) << 10));
        s
    }

    #[test]
    fn test_size_estimate_clamps_to_stride() {
        let s = state_for(0, 256, 480, 272);
        assert_eq!(estimate_framebuffer_size(&s), (256, 272));
        let s = state_for(0, 512, 480, 272);
        assert_eq!(estimate_framebuffer_size(&s), (480, 272));
    }

    #[test]
    fn test_render_framebuffer_created_once() {
        let mut ctx = HeadlessDrawContext::new(480, 272);
        let mut stats = GpuStats::default();
        let mut fbm = FramebufferManager::new();
        let s = state_for(0, 512, 480, 272);

        let a = fbm.set_render_framebuffer(&s, &mut ctx, &mut stats);
        let b = fbm.set_render_framebuffer(&s, &mut ctx, &mut stats);
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_eq!(fbm.framebuffers().len(), 1);
        assert_eq!(ctx.live_framebuffers(), 1);
    }

    #[test]
    fn test_growth_recreates_backend_object() {
        let mut ctx = HeadlessDrawContext::new(480, 272);
        let mut stats = GpuStats::default();
        let mut fbm = FramebufferManager::new();

        let small = fbm
            .set_render_framebuffer(&state_for(0, 512, 256, 128), &mut ctx, &mut stats)
            .unwrap();
        let big = fbm
            .set_render_framebuffer(&state_for(0, 512, 480, 272), &mut ctx, &mut stats)
            .unwrap();
        assert_ne!(small, big);
        assert_eq!(ctx.framebuffer_size(big), Some((480, 272)));
        assert_eq!(ctx.live_framebuffers(), 1);
    }

    #[test]
    fn test_decimate_old_framebuffers() {
        let mut ctx = HeadlessDrawContext::new(480, 272);
        let mut stats = GpuStats::default();
        let mut fbm = FramebufferManager::new();
        fbm.set_render_framebuffer(&state_for(0, 512, 480, 272), &mut ctx, &mut stats);
        fbm.set_render_framebuffer(&state_for(0x8_8000, 512, 480, 272), &mut ctx, &mut stats);
        assert_eq!(fbm.framebuffers().len(), 2);

        for _ in 0..=FBO_OLD_AGE {
            fbm.begin_frame(&mut ctx);
        }
        // The current target survives.
        assert_eq!(fbm.framebuffers().len(), 1);
        assert_eq!(fbm.current().map(|v| v.fb_address), Some(0x0408_8000));
        assert_eq!(ctx.live_framebuffers(), 1);
    }

    #[test]
    fn test_device_restore_is_idempotent() {
        let mut ctx = HeadlessDrawContext::new(480, 272);
        let mut stats = GpuStats::default();
        let mut fbm = FramebufferManager::new();
        fbm.set_render_framebuffer(&state_for(0, 512, 480, 272), &mut ctx, &mut stats);

        ctx.lose_device();
        fbm.device_lost();
        assert!(fbm.framebuffers()[0].handle.is_none());

        ctx.restore_device();
        assert!(fbm.device_restore(&mut ctx, &mut stats));
        let first = fbm.framebuffers()[0].handle;
        assert!(fbm.device_restore(&mut ctx, &mut stats));
        assert_eq!(fbm.framebuffers()[0].handle, first);
        assert_eq!(ctx.live_framebuffers(), 1);
    }

    #[test]
    fn test_post_targets_reuse_by_size() {
        let mut ctx = HeadlessDrawContext::new(480, 272);
        let mut targets = PostShaderTargets::new();

        targets.begin_chain();
        assert!(targets.allocate_framebuffer(&mut ctx, 480, 272));
        assert!(targets.allocate_framebuffer(&mut ctx, 480, 272));
        targets.finish_chain(&mut ctx);
        assert_eq!(ctx.live_framebuffers(), 2);
        let first = targets.get(0).unwrap().handle;

        // Rebuilding the same chain reuses both targets.
        targets.begin_chain();
        assert!(targets.allocate_framebuffer(&mut ctx, 480, 272));
        assert!(targets.allocate_framebuffer(&mut ctx, 480, 272));
        targets.finish_chain(&mut ctx);
        assert_eq!(ctx.live_framebuffers(), 2);
        assert_eq!(targets.get(0).unwrap().handle, first);
        assert_ne!(targets.get(0), targets.get(1));

        // A different size replaces them.
        targets.begin_chain();
        assert!(targets.allocate_framebuffer(&mut ctx, 960, 544));
        targets.finish_chain(&mut ctx);
        assert_eq!(ctx.live_framebuffers(), 1);
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn test_post_target_allocation_failure() {
        let mut ctx = HeadlessDrawContext::new(480, 272);
        ctx.set_framebuffer_budget(Some(0));
        let mut targets = PostShaderTargets::new();
        targets.begin_chain();
        assert!(!targets.allocate_framebuffer(&mut ctx, 480, 272));
        assert!(targets.is_empty());
    }
}
