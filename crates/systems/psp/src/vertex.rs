//! Vertex type decoding.
//!
//! The VERTEXTYPE register describes a packed vertex: optional skinning
//! weights, texture coordinates, color, normal and a position, each aligned
//! to its own component size, repeated once per morph target. Draws are
//! decoded into a single fixed layout ([`DecodedVertex`]) at queue time.

use bytemuck::{Pod, Zeroable};
use emu_core::graphics::ColorOps;

const TC_SIZE: [u32; 4] = [0, 2, 4, 8];
const TC_ALIGN: [u32; 4] = [0, 1, 2, 4];
const COL_SIZE: [u32; 8] = [0, 0, 0, 0, 2, 2, 2, 4];
const NRM_SIZE: [u32; 4] = [0, 3, 6, 12];
const NRM_ALIGN: [u32; 4] = [0, 1, 2, 4];
const POS_SIZE: [u32; 4] = [3, 3, 6, 12];
const POS_ALIGN: [u32; 4] = [1, 1, 2, 4];
const WT_SIZE: [u32; 4] = [0, 1, 2, 4];

pub const VTYPE_THROUGH: u32 = 1 << 23;
/// Bits holding the skinning weight count.
pub const VTYPE_WEIGHTCOUNT_MASK: u32 = 7 << 14;
pub const VTYPE_MORPHCOUNT_MASK: u32 = 7 << 18;

/// Layout of one packed vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexFormat {
    pub raw: u32,
    pub tc: u32,
    pub col: u32,
    pub nrm: u32,
    pub pos: u32,
    pub weight: u32,
    pub idx: u32,
    pub weight_count: u32,
    pub morph_count: u32,
    pub through: bool,
    weight_off: u32,
    tc_off: u32,
    col_off: u32,
    nrm_off: u32,
    pos_off: u32,
    /// Size of one morph frame, aligned to the largest component
    one_size: u32,
}

#[inline]
fn align_up(v: u32, align: u32) -> u32 {
    if align <= 1 {
        v
    } else {
        (v + align - 1) & !(align - 1)
    }
}

impl VertexFormat {
    pub fn decode(vtype: u32) -> Self {
        let tc = vtype & 3;
        let col = (vtype >> 2) & 7;
        let nrm = (vtype >> 5) & 3;
        let pos = (vtype >> 7) & 3;
        let weight = (vtype >> 9) & 3;
        let idx = (vtype >> 11) & 3;
        let weight_count = ((vtype >> 14) & 7) + 1;
        let morph_count = ((vtype >> 18) & 7) + 1;

        let mut size = 0;
        let mut biggest = 1;

        // Weights always lead the vertex.
        let weight_off = 0;
        if weight != 0 {
            size += WT_SIZE[weight as usize] * weight_count;
            biggest = biggest.max(WT_SIZE[weight as usize]);
        }

        size = align_up(size, TC_ALIGN[tc as usize]);
        let tc_off = size;
        size += TC_SIZE[tc as usize];
        biggest = biggest.max(TC_ALIGN[tc as usize]);

        size = align_up(size, COL_SIZE[col as usize]);
        let col_off = size;
        size += COL_SIZE[col as usize];
        biggest = biggest.max(COL_SIZE[col as usize]);

        size = align_up(size, NRM_ALIGN[nrm as usize]);
        let nrm_off = size;
        size += NRM_SIZE[nrm as usize];
        biggest = biggest.max(NRM_ALIGN[nrm as usize]);

        size = align_up(size, POS_ALIGN[pos as usize]);
        let pos_off = size;
        size += POS_SIZE[pos as usize];
        biggest = biggest.max(POS_ALIGN[pos as usize]);

        let one_size = align_up(size, biggest);

        Self {
            raw: vtype,
            tc,
            col,
            nrm,
            pos,
            weight,
            idx,
            weight_count,
            morph_count,
            through: vtype & VTYPE_THROUGH != 0,
            weight_off,
            tc_off,
            col_off,
            nrm_off,
            pos_off,
            one_size,
        }
    }

    /// Bytes per vertex including every morph frame.
    pub fn stride(&self) -> u32 {
        self.one_size * self.morph_count
    }

    /// Bytes per index, 0 for non-indexed draws.
    pub fn index_size(&self) -> u32 {
        match self.idx {
            1 => 1,
            2 => 2,
            3 => 4,
            _ => 0,
        }
    }

    pub fn is_indexed(&self) -> bool {
        self.idx != 0
    }

    pub fn has_weights(&self) -> bool {
        self.weight != 0
    }

    pub fn normal_offset(&self) -> u32 {
        self.nrm_off
    }
}

/// Canonical vertex layout uploaded to the backend.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DecodedVertex {
    pub pos: [f32; 3],
    pub uv: [f32; 2],
    /// ABGR8888, red in the low byte
    pub color: u32,
}

pub const DECODED_VERTEX_SIZE: u32 = std::mem::size_of::<DecodedVertex>() as u32;

#[inline]
fn rd_u8(b: &[u8], off: u32) -> u8 {
    b.get(off as usize).copied().unwrap_or(0)
}

#[inline]
fn rd_u16(b: &[u8], off: u32) -> u16 {
    let o = off as usize;
    match b.get(o..o + 2) {
        Some(s) => u16::from_le_bytes([s[0], s[1]]),
        None => 0,
    }
}

#[inline]
fn rd_u32(b: &[u8], off: u32) -> u32 {
    let o = off as usize;
    match b.get(o..o + 4) {
        Some(s) => u32::from_le_bytes([s[0], s[1], s[2], s[3]]),
        None => 0,
    }
}

#[inline]
fn rd_f32(b: &[u8], off: u32) -> f32 {
    f32::from_bits(rd_u32(b, off))
}

/// Decodes packed vertices into [`DecodedVertex`].
pub struct VertexDecoder<'a> {
    fmt: VertexFormat,
    morph_weights: [f32; 8],
    /// Bone matrices for software skinning; `None` leaves positions unskinned.
    bones: Option<&'a [[f32; 12]; 8]>,
}

impl<'a> VertexDecoder<'a> {
    pub fn new(fmt: VertexFormat, morph_weights: [f32; 8]) -> Self {
        Self {
            fmt,
            morph_weights,
            bones: None,
        }
    }

    pub fn with_skinning(mut self, bones: &'a [[f32; 12]; 8]) -> Self {
        self.bones = Some(bones);
        self
    }

    fn frame_pos(&self, b: &[u8], base: u32) -> [f32; 3] {
        let off = base + self.fmt.pos_off;
        let through = self.fmt.through;
        match self.fmt.pos {
            3 => [rd_f32(b, off), rd_f32(b, off + 4), rd_f32(b, off + 8)],
            2 if through => [
                rd_u16(b, off) as i16 as f32,
                rd_u16(b, off + 2) as i16 as f32,
                rd_u16(b, off + 4) as f32,
            ],
            2 => [
                rd_u16(b, off) as i16 as f32 / 32768.0,
                rd_u16(b, off + 2) as i16 as f32 / 32768.0,
                rd_u16(b, off + 4) as i16 as f32 / 32768.0,
            ],
            _ if through => [
                rd_u8(b, off) as i8 as f32,
                rd_u8(b, off + 1) as i8 as f32,
                rd_u8(b, off + 2) as f32,
            ],
            _ => [
                rd_u8(b, off) as i8 as f32 / 128.0,
                rd_u8(b, off + 1) as i8 as f32 / 128.0,
                rd_u8(b, off + 2) as i8 as f32 / 128.0,
            ],
        }
    }

    fn frame_uv(&self, b: &[u8], base: u32) -> [f32; 2] {
        let off = base + self.fmt.tc_off;
        let through = self.fmt.through;
        match self.fmt.tc {
            1 if through => [rd_u8(b, off) as f32, rd_u8(b, off + 1) as f32],
            1 => [rd_u8(b, off) as f32 / 128.0, rd_u8(b, off + 1) as f32 / 128.0],
            2 if through => [rd_u16(b, off) as f32, rd_u16(b, off + 2) as f32],
            2 => [
                rd_u16(b, off) as f32 / 32768.0,
                rd_u16(b, off + 2) as f32 / 32768.0,
            ],
            3 => [rd_f32(b, off), rd_f32(b, off + 4)],
            _ => [0.0, 0.0],
        }
    }

    /// ARGB8888
    fn frame_color(&self, b: &[u8], base: u32) -> u32 {
        let off = base + self.fmt.col_off;
        match self.fmt.col {
            4 => ColorOps::from_565(rd_u16(b, off)),
            5 => ColorOps::from_5551(rd_u16(b, off)),
            6 => ColorOps::from_4444(rd_u16(b, off)),
            7 => ColorOps::from_8888(rd_u32(b, off)),
            _ => 0xFFFF_FFFF,
        }
    }

    fn weights(&self, b: &[u8]) -> [f32; 8] {
        let mut w = [0.0; 8];
        let off = self.fmt.weight_off;
        for (i, out) in w.iter_mut().take(self.fmt.weight_count as usize).enumerate() {
            let i = i as u32;
            *out = match self.fmt.weight {
                1 => rd_u8(b, off + i) as f32 / 128.0,
                2 => rd_u16(b, off + i * 2) as f32 / 32768.0,
                3 => rd_f32(b, off + i * 4),
                _ => 0.0,
            };
        }
        w
    }

    /// Decode one vertex from `bytes`, which starts at the vertex.
    pub fn decode(&self, bytes: &[u8]) -> DecodedVertex {
        let frames = self.fmt.morph_count;
        let (mut pos, mut uv, color) = if frames == 1 {
            (
                self.frame_pos(bytes, 0),
                self.frame_uv(bytes, 0),
                self.frame_color(bytes, 0),
            )
        } else {
            let mut pos = [0.0f32; 3];
            let mut uv = [0.0f32; 2];
            let mut rgba = [0.0f32; 4];
            for n in 0..frames {
                let w = self.morph_weights[n as usize];
                let base = n * self.fmt.one_size;
                let p = self.frame_pos(bytes, base);
                let t = self.frame_uv(bytes, base);
                let c = self.frame_color(bytes, base);
                for k in 0..3 {
                    pos[k] += p[k] * w;
                }
                uv[0] += t[0] * w;
                uv[1] += t[1] * w;
                rgba[0] += ColorOps::red(c) as f32 * w;
                rgba[1] += ColorOps::green(c) as f32 * w;
                rgba[2] += ColorOps::blue(c) as f32 * w;
                rgba[3] += ColorOps::alpha(c) as f32 * w;
            }
            let ch = |v: f32| v.round().clamp(0.0, 255.0) as u32;
            let color = (ch(rgba[3]) << 24) | (ch(rgba[0]) << 16) | (ch(rgba[1]) << 8) | ch(rgba[2]);
            (pos, uv, color)
        };

        if let (Some(bones), true) = (self.bones, self.fmt.has_weights() && !self.fmt.through) {
            let w = self.weights(bytes);
            let mut out = [0.0f32; 3];
            for (i, m) in bones.iter().take(self.fmt.weight_count as usize).enumerate() {
                let wi = w[i];
                if wi == 0.0 {
                    continue;
                }
                out[0] += wi * (m[0] * pos[0] + m[3] * pos[1] + m[6] * pos[2] + m[9]);
                out[1] += wi * (m[1] * pos[0] + m[4] * pos[1] + m[7] * pos[2] + m[10]);
                out[2] += wi * (m[2] * pos[0] + m[5] * pos[1] + m[8] * pos[2] + m[11]);
            }
            pos = out;
        }

        if !uv[0].is_finite() {
            uv[0] = 0.0;
        }
        if !uv[1].is_finite() {
            uv[1] = 0.0;
        }

        DecodedVertex {
            pos,
            uv,
            color: ColorOps::swap_rb(color),
        }
    }
}

/// Read index `i` of the given size from an index buffer.
#[inline]
pub fn read_index(bytes: &[u8], index_size: u32, i: u32) -> u32 {
    match index_size {
        1 => rd_u8(bytes, i) as u32,
        2 => rd_u16(bytes, i * 2) as u32,
        4 => rd_u32(bytes, i * 4),
        _ => i,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_position_only() {
        let f = VertexFormat::decode(3 << 7);
        assert_eq!(f.stride(), 12);
        assert!(!f.is_indexed());
    }

    #[test]
    fn test_u16_tc_8888_color_float_pos() {
        // tc u16 (4) + color 8888 (4) + pos float (12)
        let f = VertexFormat::decode(2 | (7 << 2) | (3 << 7));
        assert_eq!(f.stride(), 20);
    }

    #[test]
    fn test_alignment_padding() {
        // tc u8 (2) then 565 color aligned to 2, pos s16 aligned to 2
        let f = VertexFormat::decode(1 | (4 << 2) | (2 << 7));
        assert_eq!(f.stride(), 2 + 2 + 6);

        // u8 tc (2), pad to 4, float pos (12)
        let f = VertexFormat::decode(1 | (3 << 7));
        assert_eq!(f.stride(), 16);
    }

    #[test]
    fn test_weights_and_morph() {
        // two u8 weights, s8 pos, 2 morph frames
        let f = VertexFormat::decode((1 << 9) | (1 << 14) | (1 << 7) | (1 << 18));
        assert_eq!(f.weight_count, 2);
        assert_eq!(f.morph_count, 2);
        assert_eq!(f.stride(), (2 + 3) * 2);
    }

    #[test]
    fn test_index_sizes() {
        assert_eq!(VertexFormat::decode(1 << 11).index_size(), 1);
        assert_eq!(VertexFormat::decode(2 << 11).index_size(), 2);
        assert_eq!(VertexFormat::decode(3 << 11).index_size(), 4);
        assert_eq!(VertexFormat::decode(0).index_size(), 0);
    }

    #[test]
    fn test_decode_through_vertex() {
        let f = VertexFormat::decode(2 | (7 << 2) | (2 << 7) | VTYPE_THROUGH);
        assert_eq!(f.stride(), 4 + 4 + 6 + 2);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(&32u16.to_le_bytes());
        bytes.extend_from_slice(&0xFF00_00FFu32.to_le_bytes());
        bytes.extend_from_slice(&100i16.to_le_bytes());
        bytes.extend_from_slice(&50i16.to_le_bytes());
        bytes.extend_from_slice(&7u16.to_le_bytes());
        bytes.extend_from_slice(&[0, 0]);

        let v = VertexDecoder::new(f, [1.0; 8]).decode(&bytes);
        assert_eq!(v.pos, [100.0, 50.0, 7.0]);
        assert_eq!(v.uv, [16.0, 32.0]);
        assert_eq!(v.color, 0xFF00_00FF);
    }

    #[test]
    fn test_morph_blend() {
        let f = VertexFormat::decode((3 << 7) | (1 << 18));
        let mut bytes = Vec::new();
        for v in [0.0f32, 0.0, 0.0, 2.0, 4.0, 6.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let mut weights = [0.0; 8];
        weights[0] = 0.5;
        weights[1] = 0.5;
        let v = VertexDecoder::new(f, weights).decode(&bytes);
        assert_eq!(v.pos, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_software_skinning() {
        // one float weight, float pos
        let f = VertexFormat::decode((3 << 9) | (3 << 7));
        let mut bytes = Vec::new();
        for v in [1.0f32, 1.0, 2.0, 3.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let mut bones = [[0.0f32; 12]; 8];
        // identity plus translation (10, 0, 0)
        bones[0] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 10.0, 0.0, 0.0];
        let v = VertexDecoder::new(f, [1.0; 8])
            .with_skinning(&bones)
            .decode(&bytes);
        assert_eq!(v.pos, [11.0, 2.0, 3.0]);
    }

    #[test]
    fn test_read_index() {
        let bytes = [1u8, 0, 2, 0, 3, 0];
        assert_eq!(read_index(&bytes, 2, 2), 3);
        assert_eq!(read_index(&bytes, 1, 2), 2);
        assert_eq!(read_index(&bytes, 0, 9), 9);
    }
}
