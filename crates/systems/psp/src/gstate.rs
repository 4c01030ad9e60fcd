//! GE register file, matrix banks and dirty tracking.
//!
//! `cmdmem` holds the last word written for every opcode, opcode byte
//! included, so `word ^ cmdmem[op]` is the change a new word makes.
//! Matrices keep the raw float bit patterns the data commands carry.

use crate::command::*;
use bitflags::bitflags;
use emu_core::graphics::PixelFormat;

bitflags! {
    /// Backend objects that must be rebuilt before the next submission.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DirtyFlags: u64 {
        const PROJMATRIX = 1 << 0;
        const PROJTHROUGHMATRIX = 1 << 1;
        const FOGCOLOR = 1 << 2;
        const FOGCOEF = 1 << 3;
        const TEXENV = 1 << 4;
        const ALPHACOLORREF = 1 << 5;
        const STENCILREPLACEVALUE = 1 << 6;
        const ALPHACOLORMASK = 1 << 7;
        const SHADERBLEND = 1 << 8;
        const UVSCALEOFFSET = 1 << 9;
        const DEPTHRANGE = 1 << 10;
        const WORLDMATRIX = 1 << 11;
        const VIEWMATRIX = 1 << 12;
        const TEXMATRIX = 1 << 13;
        const BONEMATRIX0 = 1 << 14;
        const BONEMATRIX1 = 1 << 15;
        const BONEMATRIX2 = 1 << 16;
        const BONEMATRIX3 = 1 << 17;
        const BONEMATRIX4 = 1 << 18;
        const BONEMATRIX5 = 1 << 19;
        const BONEMATRIX6 = 1 << 20;
        const BONEMATRIX7 = 1 << 21;
        const LIGHT0 = 1 << 22;
        const LIGHT1 = 1 << 23;
        const LIGHT2 = 1 << 24;
        const LIGHT3 = 1 << 25;
        const MATERIAL = 1 << 26;
        const AMBIENT = 1 << 27;
        const MORPHWEIGHTS = 1 << 28;
        const BLEND_STATE = 1 << 29;
        const DEPTHSTENCIL_STATE = 1 << 30;
        const RASTER_STATE = 1 << 31;
        const VIEWPORTSCISSOR_STATE = 1 << 32;
        const VERTEXSHADER_STATE = 1 << 33;
        const FRAGMENTSHADER_STATE = 1 << 34;
        const TEXTURE_IMAGE = 1 << 35;
        const TEXTURE_PARAMS = 1 << 36;
        const FRAMEBUF = 1 << 37;
        const CULLRANGE = 1 << 38;
        const DEPAL = 1 << 39;
        const COLORWRITEMASK = 1 << 40;
        const BEZIERSPLINE = 1 << 41;
    }
}

impl DirtyFlags {
    /// Packed into the uniform block at flush.
    pub const UNIFORMS: Self = Self::PROJMATRIX
        .union(Self::PROJTHROUGHMATRIX)
        .union(Self::FOGCOLOR)
        .union(Self::FOGCOEF)
        .union(Self::TEXENV)
        .union(Self::ALPHACOLORREF)
        .union(Self::STENCILREPLACEVALUE)
        .union(Self::ALPHACOLORMASK)
        .union(Self::SHADERBLEND)
        .union(Self::UVSCALEOFFSET)
        .union(Self::WORLDMATRIX)
        .union(Self::VIEWMATRIX)
        .union(Self::TEXMATRIX)
        .union(Self::ALL_BONES)
        .union(Self::ALL_LIGHTS)
        .union(Self::MATERIAL)
        .union(Self::AMBIENT)
        .union(Self::MORPHWEIGHTS)
        .union(Self::CULLRANGE);

    /// Folded into the pipeline key.
    pub const PIPELINE: Self = Self::BLEND_STATE
        .union(Self::DEPTHSTENCIL_STATE)
        .union(Self::RASTER_STATE)
        .union(Self::VERTEXSHADER_STATE)
        .union(Self::FRAGMENTSHADER_STATE)
        .union(Self::COLORWRITEMASK)
        .union(Self::BEZIERSPLINE);

    /// Texture upload and sampler.
    pub const TEXTURE: Self = Self::TEXTURE_IMAGE
        .union(Self::TEXTURE_PARAMS)
        .union(Self::DEPAL);

    pub const VIEWPORT: Self = Self::VIEWPORTSCISSOR_STATE.union(Self::DEPTHRANGE);

    pub const ALL_BONES: Self = Self::BONEMATRIX0
        .union(Self::BONEMATRIX1)
        .union(Self::BONEMATRIX2)
        .union(Self::BONEMATRIX3)
        .union(Self::BONEMATRIX4)
        .union(Self::BONEMATRIX5)
        .union(Self::BONEMATRIX6)
        .union(Self::BONEMATRIX7);

    pub const ALL_LIGHTS: Self = Self::LIGHT0
        .union(Self::LIGHT1)
        .union(Self::LIGHT2)
        .union(Self::LIGHT3);

    /// Bone matrix `n` (0..8).
    pub fn bone(n: u32) -> Self {
        Self::from_bits_truncate(Self::BONEMATRIX0.bits() << (n & 7))
    }

    /// Light `n` (0..4).
    pub fn light(n: u32) -> Self {
        Self::from_bits_truncate(Self::LIGHT0.bits() << (n & 3))
    }
}

/// Registers derived from commands rather than stored in `cmdmem`.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuContext {
    pub vertex_addr: u32,
    pub index_addr: u32,
    pub offset_addr: u32,
    pub texture_width: u32,
    pub texture_height: u32,
    /// CLUT bytes captured by the last LOADCLUT
    pub clut: Vec<u8>,
    pub clut_loaded_bytes: u32,
}

pub const CLUT_BYTES: usize = 1024;

impl Default for GpuContext {
    fn default() -> Self {
        Self {
            vertex_addr: 0,
            index_addr: 0,
            offset_addr: 0,
            texture_width: 1,
            texture_height: 1,
            clut: vec![0; CLUT_BYTES],
            clut_loaded_bytes: 0,
        }
    }
}

/// Block transfer registers, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParams {
    pub src: u32,
    pub src_stride: u32,
    pub src_x: u32,
    pub src_y: u32,
    pub dst: u32,
    pub dst_stride: u32,
    pub dst_x: u32,
    pub dst_y: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

/// Inclusive pixel rectangle from a pair of 10/10-bit coordinate registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

/// The persistent GE state.
#[derive(Debug, Clone)]
pub struct GpuStateStore {
    pub cmdmem: [u32; 256],
    pub world_matrix: [u32; 12],
    pub view_matrix: [u32; 12],
    pub proj_matrix: [u32; 16],
    pub tgen_matrix: [u32; 12],
    pub bone_matrix: [u32; 96],
    pub ctx: GpuContext,
    dirty: DirtyFlags,
}

impl GpuStateStore {
    pub fn new() -> Self {
        let mut state = Self {
            cmdmem: [0; 256],
            world_matrix: [0; 12],
            view_matrix: [0; 12],
            proj_matrix: [0; 16],
            tgen_matrix: [0; 12],
            bone_matrix: [0; 96],
            ctx: GpuContext::default(),
            dirty: DirtyFlags::all(),
        };
        state.reset();
        state
    }

    /// Back to power-on state with every dirty flag raised.
    pub fn reset(&mut self) {
        for (i, w) in self.cmdmem.iter_mut().enumerate() {
            *w = (i as u32) << 24;
        }
        self.world_matrix = [0; 12];
        self.view_matrix = [0; 12];
        self.proj_matrix = [0; 16];
        self.tgen_matrix = [0; 12];
        self.bone_matrix = [0; 96];
        self.ctx = GpuContext::default();
        self.dirty = DirtyFlags::all();
    }

    #[inline]
    pub fn data(&self, cmd: u8) -> u32 {
        self.cmdmem[cmd as usize] & 0x00FF_FFFF
    }

    #[inline]
    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    #[inline]
    pub fn mark_dirty(&mut self, flags: DirtyFlags) {
        self.dirty |= flags;
    }

    #[inline]
    pub fn clear_dirty(&mut self, flags: DirtyFlags) {
        self.dirty &= !flags;
    }

    pub fn mark_all_dirty(&mut self) {
        self.dirty = DirtyFlags::all();
    }

    /// Resolve a 24-bit address operand against BASE and the offset register.
    #[inline]
    pub fn relative_address(&self, data: u32) -> u32 {
        let base = (self.cmdmem[GE_CMD_BASE as usize] & 0x000F_0000) << 8;
        self.ctx.offset_addr.wrapping_add(base | data) & 0x0FFF_FFFF
    }

    #[inline]
    pub fn vertex_type(&self) -> u32 {
        self.data(GE_CMD_VERTEXTYPE)
    }

    pub fn is_texture_enabled(&self) -> bool {
        self.data(GE_CMD_TEXTUREMAPENABLE) & 1 != 0
    }

    pub fn is_clear_mode(&self) -> bool {
        self.data(GE_CMD_CLEARMODE) & 1 != 0
    }

    pub fn framebuf_address(&self) -> u32 {
        let raw = (self.data(GE_CMD_FRAMEBUFPTR) & 0xFF_FFF0)
            | ((self.data(GE_CMD_FRAMEBUFWIDTH) & 0xFF_0000) << 8);
        0x0400_0000 | (raw & 0x00FF_FFFF)
    }

    pub fn framebuf_stride(&self) -> u32 {
        self.data(GE_CMD_FRAMEBUFWIDTH) & 0x7FC
    }

    pub fn framebuf_format(&self) -> PixelFormat {
        PixelFormat::from_bits(self.data(GE_CMD_FRAMEBUFPIXFORMAT))
    }

    pub fn depthbuf_address(&self) -> u32 {
        let raw = (self.data(GE_CMD_ZBUFPTR) & 0xFF_FFF0)
            | ((self.data(GE_CMD_ZBUFWIDTH) & 0xFF_0000) << 8);
        0x0400_0000 | (raw & 0x00FF_FFFF)
    }

    pub fn depthbuf_stride(&self) -> u32 {
        self.data(GE_CMD_ZBUFWIDTH) & 0x7FC
    }

    pub fn texture_address(&self, level: u8) -> u32 {
        let level = level & 7;
        (self.data(GE_CMD_TEXADDR0 + level) & 0xFF_FFF0)
            | ((self.data(GE_CMD_TEXBUFWIDTH0 + level) << 8) & 0x0F00_0000)
    }

    pub fn texture_stride(&self, level: u8) -> u32 {
        self.data(GE_CMD_TEXBUFWIDTH0 + (level & 7)) & 0x7FF
    }

    /// Texture dimensions in texels; exponents above 9 are clamped to 512.
    pub fn texture_size(&self, level: u8) -> (u32, u32) {
        let raw = self.data(GE_CMD_TEXSIZE0 + (level & 7));
        let w = (raw & 0xF).min(9);
        let h = ((raw >> 8) & 0xF).min(9);
        (1 << w, 1 << h)
    }

    pub fn texture_format(&self) -> u32 {
        self.data(GE_CMD_TEXFORMAT) & 0xF
    }

    pub fn is_texture_swizzled(&self) -> bool {
        self.data(GE_CMD_TEXMODE) & 1 != 0
    }

    pub fn clut_address(&self) -> u32 {
        (self.data(GE_CMD_CLUTADDR) & 0xFF_FFF0)
            | ((self.data(GE_CMD_CLUTADDRUPPER) << 8) & 0x0F00_0000)
    }

    pub fn clut_format(&self) -> PixelFormat {
        PixelFormat::from_bits(self.data(GE_CMD_CLUTFORMAT))
    }

    pub fn clut_shift(&self) -> u32 {
        (self.data(GE_CMD_CLUTFORMAT) >> 2) & 0x1F
    }

    pub fn clut_mask(&self) -> u32 {
        (self.data(GE_CMD_CLUTFORMAT) >> 8) & 0xFF
    }

    pub fn clut_start(&self) -> u32 {
        ((self.data(GE_CMD_CLUTFORMAT) >> 16) & 0x1F) * 16
    }

    fn rect(&self, first: u8, second: u8) -> RegionRect {
        let a = self.data(first);
        let b = self.data(second);
        RegionRect {
            x1: a & 0x3FF,
            y1: (a >> 10) & 0x3FF,
            x2: b & 0x3FF,
            y2: (b >> 10) & 0x3FF,
        }
    }

    pub fn region(&self) -> RegionRect {
        self.rect(GE_CMD_REGION1, GE_CMD_REGION2)
    }

    pub fn scissor(&self) -> RegionRect {
        self.rect(GE_CMD_SCISSOR1, GE_CMD_SCISSOR2)
    }

    pub fn viewport(&self) -> ([f32; 3], [f32; 3]) {
        (
            [
                float24(self.data(GE_CMD_VIEWPORTXSCALE)),
                float24(self.data(GE_CMD_VIEWPORTYSCALE)),
                float24(self.data(GE_CMD_VIEWPORTZSCALE)),
            ],
            [
                float24(self.data(GE_CMD_VIEWPORTXCENTER)),
                float24(self.data(GE_CMD_VIEWPORTYCENTER)),
                float24(self.data(GE_CMD_VIEWPORTZCENTER)),
            ],
        )
    }

    /// Screen offset in pixels (registers hold 12.4 fixed point).
    pub fn screen_offset(&self) -> (f32, f32) {
        (
            (self.data(GE_CMD_OFFSETX) & 0xFFFF) as f32 / 16.0,
            (self.data(GE_CMD_OFFSETY) & 0xFFFF) as f32 / 16.0,
        )
    }

    pub fn depth_range(&self) -> (u32, u32) {
        (
            self.data(GE_CMD_MINZ) & 0xFFFF,
            self.data(GE_CMD_MAXZ) & 0xFFFF,
        )
    }

    pub fn uv_scale_offset(&self) -> [f32; 4] {
        [
            float24(self.data(GE_CMD_TEXSCALEU)),
            float24(self.data(GE_CMD_TEXSCALEV)),
            float24(self.data(GE_CMD_TEXOFFSETU)),
            float24(self.data(GE_CMD_TEXOFFSETV)),
        ]
    }

    pub fn morph_weights(&self) -> [f32; 8] {
        let mut w = [0.0; 8];
        for (i, out) in w.iter_mut().enumerate() {
            *out = float24(self.data(GE_CMD_MORPHWEIGHT0 + i as u8));
        }
        w
    }

    /// Bezier/spline subdivision counts (u, v).
    pub fn patch_division(&self) -> (u32, u32) {
        let d = self.data(GE_CMD_PATCHDIVISION);
        (d & 0x7F, (d >> 8) & 0x7F)
    }

    /// Primitive type used for tessellated patches.
    pub fn patch_primitive(&self) -> u8 {
        match self.data(GE_CMD_PATCHPRIMITIVE) & 3 {
            0 => 3, // triangles
            1 => 1, // lines
            _ => 0, // points
        }
    }

    /// Texture min filter, mag filter.
    pub fn texture_filter(&self) -> (u32, u32) {
        let d = self.data(GE_CMD_TEXFILTER);
        (d & 7, (d >> 8) & 1)
    }

    /// Clamp flags for u and v.
    pub fn texture_clamp(&self) -> (bool, bool) {
        let d = self.data(GE_CMD_TEXWRAP);
        (d & 1 != 0, (d >> 8) & 1 != 0)
    }

    pub fn transfer(&self) -> TransferParams {
        let srcw = self.data(GE_CMD_TRANSFERSRCW);
        let dstw = self.data(GE_CMD_TRANSFERDSTW);
        let srcpos = self.data(GE_CMD_TRANSFERSRCPOS);
        let dstpos = self.data(GE_CMD_TRANSFERDSTPOS);
        let size = self.data(GE_CMD_TRANSFERSIZE);
        TransferParams {
            src: (self.data(GE_CMD_TRANSFERSRC) & 0xFF_FFF0) | ((srcw & 0xFF_0000) << 8),
            src_stride: srcw & 0x7F8,
            src_x: srcpos & 0x3FF,
            src_y: (srcpos >> 10) & 0x3FF,
            dst: (self.data(GE_CMD_TRANSFERDST) & 0xFF_FFF0) | ((dstw & 0xFF_0000) << 8),
            dst_stride: dstw & 0x7F8,
            dst_x: dstpos & 0x3FF,
            dst_y: (dstpos >> 10) & 0x3FF,
            width: (size & 0x3FF) + 1,
            height: ((size >> 10) & 0x3FF) + 1,
            bpp: if self.data(GE_CMD_TRANSFERSTART) & 1 != 0 {
                4
            } else {
                2
            },
        }
    }

    pub fn world_matrix_f32(&self) -> [f32; 12] {
        self.world_matrix.map(f32::from_bits)
    }

    pub fn view_matrix_f32(&self) -> [f32; 12] {
        self.view_matrix.map(f32::from_bits)
    }

    pub fn proj_matrix_f32(&self) -> [f32; 16] {
        self.proj_matrix.map(f32::from_bits)
    }

    pub fn tgen_matrix_f32(&self) -> [f32; 12] {
        self.tgen_matrix.map(f32::from_bits)
    }

    /// Bone matrix `n` as a 4x3 column-major float matrix.
    pub fn bone_matrix_f32(&self, n: usize) -> [f32; 12] {
        let mut m = [0.0; 12];
        let start = (n & 7) * 12;
        for (out, bits) in m.iter_mut().zip(&self.bone_matrix[start..start + 12]) {
            *out = f32::from_bits(*bits);
        }
        m
    }
}

impl Default for GpuStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_seeds_opcode_bytes() {
        let state = GpuStateStore::new();
        assert_eq!(state.cmdmem[0x9C], 0x9C00_0000);
        assert_eq!(state.cmdmem[0xFF], 0xFF00_0000);
        assert_eq!(state.dirty(), DirtyFlags::all());
    }

    #[test]
    fn test_groups_cover_every_flag() {
        let groups = DirtyFlags::UNIFORMS
            | DirtyFlags::PIPELINE
            | DirtyFlags::TEXTURE
            | DirtyFlags::VIEWPORT
            | DirtyFlags::FRAMEBUF;
        assert_eq!(groups, DirtyFlags::all());
    }

    #[test]
    fn test_relative_address() {
        let mut state = GpuStateStore::new();
        state.cmdmem[GE_CMD_BASE as usize] = word(GE_CMD_BASE, 0x08_0000);
        assert_eq!(state.relative_address(0x00_1000), 0x0800_1000);

        state.ctx.offset_addr = 0x100;
        assert_eq!(state.relative_address(0x00_1000), 0x0800_1100);

        state.ctx.offset_addr = 0xF000_0000;
        assert_eq!(state.relative_address(0), 0x0800_0000);
    }

    #[test]
    fn test_framebuffer_registers() {
        let mut state = GpuStateStore::new();
        state.cmdmem[GE_CMD_FRAMEBUFPTR as usize] = word(GE_CMD_FRAMEBUFPTR, 0x08_8000);
        state.cmdmem[GE_CMD_FRAMEBUFWIDTH as usize] = word(GE_CMD_FRAMEBUFWIDTH, 512);
        state.cmdmem[GE_CMD_FRAMEBUFPIXFORMAT as usize] = word(GE_CMD_FRAMEBUFPIXFORMAT, 3);
        assert_eq!(state.framebuf_address(), 0x0408_8000);
        assert_eq!(state.framebuf_stride(), 512);
        assert_eq!(state.framebuf_format(), PixelFormat::Rgba8888);
    }

    #[test]
    fn test_texture_registers() {
        let mut state = GpuStateStore::new();
        state.cmdmem[GE_CMD_TEXADDR0 as usize] = word(GE_CMD_TEXADDR0, 0x12_3450);
        state.cmdmem[GE_CMD_TEXBUFWIDTH0 as usize] = word(GE_CMD_TEXBUFWIDTH0, 0x09_0100);
        state.cmdmem[GE_CMD_TEXSIZE0 as usize] = word(GE_CMD_TEXSIZE0, 0x0807);
        assert_eq!(state.texture_address(0), 0x0912_3450);
        assert_eq!(state.texture_stride(0), 0x100);
        assert_eq!(state.texture_size(0), (128, 256));

        state.cmdmem[GE_CMD_TEXSIZE0 as usize] = word(GE_CMD_TEXSIZE0, 0x0F0F);
        assert_eq!(state.texture_size(0), (512, 512));
    }

    #[test]
    fn test_transfer_registers() {
        let mut state = GpuStateStore::new();
        state.cmdmem[GE_CMD_TRANSFERSRC as usize] = word(GE_CMD_TRANSFERSRC, 0x00_0000);
        state.cmdmem[GE_CMD_TRANSFERSRCW as usize] = word(GE_CMD_TRANSFERSRCW, 0x08_0040);
        state.cmdmem[GE_CMD_TRANSFERSIZE as usize] = word(GE_CMD_TRANSFERSIZE, (3 << 10) | 7);
        state.cmdmem[GE_CMD_TRANSFERSTART as usize] = word(GE_CMD_TRANSFERSTART, 1);
        let t = state.transfer();
        assert_eq!(t.src, 0x0800_0000);
        assert_eq!(t.src_stride, 0x40);
        assert_eq!((t.width, t.height), (8, 4));
        assert_eq!(t.bpp, 4);
    }

    #[test]
    fn test_dirty_helpers() {
        let mut state = GpuStateStore::new();
        state.clear_dirty(DirtyFlags::all());
        state.mark_dirty(DirtyFlags::bone(3) | DirtyFlags::light(2));
        assert_eq!(
            state.dirty(),
            DirtyFlags::BONEMATRIX3 | DirtyFlags::LIGHT2
        );
    }
}
