//! Texture decoding from guest memory.
//!
//! Only level 0 is decoded. Output is ARGB8888 rows of exactly `width`
//! texels, ready for [`DrawContext::create_texture`].
//!
//! [`DrawContext::create_texture`]: crate::backend::DrawContext::create_texture

use crate::gstate::GpuStateStore;
use crate::memory::GuestMemory;
use crate::GpuError;
use emu_core::graphics::{ColorOps, PixelFormat};
use emu_core::logging::{log, LogCategory, LogLevel};

pub const TEXFMT_CLUT4: u32 = 4;
pub const TEXFMT_CLUT8: u32 = 5;
pub const TEXFMT_CLUT16: u32 = 6;
pub const TEXFMT_CLUT32: u32 = 7;
pub const TEXFMT_DXT1: u32 = 8;
pub const TEXFMT_DXT5: u32 = 10;

/// Shown for formats that are not decoded.
const PLACEHOLDER_COLOR: u32 = 0xFFFF_00FF;

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTexture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u32>,
}

/// Bits per texel for a TEXFORMAT value.
pub fn bits_per_texel(format: u32) -> u32 {
    match format {
        0..=2 => 16,
        3 => 32,
        TEXFMT_CLUT4 => 4,
        TEXFMT_CLUT8 => 8,
        TEXFMT_CLUT16 => 16,
        TEXFMT_CLUT32 => 32,
        TEXFMT_DXT1 => 4,
        _ => 8,
    }
}

/// Undo the 16-byte x 8-row block layout.
pub fn unswizzle(src: &[u8], row_bytes: usize, height: usize) -> Vec<u8> {
    let mut out = vec![0u8; row_bytes * height];
    let blocks_x = row_bytes / 16;
    let mut src_off = 0;
    for by in 0..height.div_ceil(8) {
        for bx in 0..blocks_x {
            for y in 0..8 {
                let row = by * 8 + y;
                if row < height {
                    if let Some(block) = src.get(src_off..src_off + 16) {
                        let dst = row * row_bytes + bx * 16;
                        out[dst..dst + 16].copy_from_slice(block);
                    }
                }
                src_off += 16;
            }
        }
    }
    out
}

/// Resolve one CLUT index through shift, mask and start.
#[inline]
pub fn clut_index(gstate: &GpuStateStore, index: u32) -> u32 {
    ((index >> gstate.clut_shift()) & gstate.clut_mask()) | gstate.clut_start()
}

/// Color of CLUT entry `entry` as ARGB.
pub fn clut_color(gstate: &GpuStateStore, entry: u32) -> u32 {
    let clut = &gstate.ctx.clut;
    match gstate.clut_format() {
        PixelFormat::Rgba8888 => {
            let o = entry as usize * 4;
            match clut.get(o..o + 4) {
                Some(b) => ColorOps::from_8888(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                None => 0,
            }
        }
        format => {
            let o = entry as usize * 2;
            let raw = match clut.get(o..o + 2) {
                Some(b) => u16::from_le_bytes([b[0], b[1]]),
                None => return 0,
            };
            match format {
                PixelFormat::Rgb565 => ColorOps::from_565(raw),
                PixelFormat::Rgba5551 => ColorOps::from_5551(raw),
                _ => ColorOps::from_4444(raw),
            }
        }
    }
}

/// Decode texture level 0 as currently configured.
pub fn decode_texture(
    gstate: &GpuStateStore,
    mem: &GuestMemory,
) -> Result<DecodedTexture, GpuError> {
    let (width, height) = gstate.texture_size(0);
    let format = gstate.texture_format();
    let bpp = bits_per_texel(format);
    let stride = gstate.texture_stride(0).max(width);

    if format >= TEXFMT_DXT1 {
        log(LogCategory::Stubs, LogLevel::Warn, || {
            format!("Compressed texture format {} not decoded", format)
        });
        return Ok(DecodedTexture {
            width,
            height,
            pixels: vec![PLACEHOLDER_COLOR; (width * height) as usize],
        });
    }

    let mut row_bytes = (stride * bpp / 8) as usize;
    let swizzled = gstate.is_texture_swizzled();
    if swizzled {
        row_bytes = row_bytes.max(16).next_multiple_of(16);
    }
    let rows = if swizzled {
        (height as usize).next_multiple_of(8)
    } else {
        height as usize
    };
    let addr = gstate.texture_address(0);
    let raw = mem.slice(addr, row_bytes * rows)?;
    let linear;
    let data: &[u8] = if swizzled {
        linear = unswizzle(raw, row_bytes, height as usize);
        &linear
    } else {
        raw
    };

    let mut pixels = Vec::with_capacity((width * height) as usize);
    for y in 0..height as usize {
        let row = &data[y * row_bytes..(y + 1) * row_bytes];
        for x in 0..width as usize {
            let texel = match format {
                0 | 1 | 2 | TEXFMT_CLUT16 => {
                    let raw = u16::from_le_bytes([row[x * 2], row[x * 2 + 1]]);
                    match format {
                        0 => ColorOps::from_565(raw),
                        1 => ColorOps::from_5551(raw),
                        2 => ColorOps::from_4444(raw),
                        _ => clut_color(gstate, clut_index(gstate, raw as u32)),
                    }
                }
                3 | TEXFMT_CLUT32 => {
                    let raw = u32::from_le_bytes([
                        row[x * 4],
                        row[x * 4 + 1],
                        row[x * 4 + 2],
                        row[x * 4 + 3],
                    ]);
                    if format == 3 {
                        ColorOps::from_8888(raw)
                    } else {
                        clut_color(gstate, clut_index(gstate, raw))
                    }
                }
                TEXFMT_CLUT8 => clut_color(gstate, clut_index(gstate, row[x] as u32)),
                _ => {
                    let byte = row[x / 2];
                    let nibble = if x & 1 == 0 { byte & 0xF } else { byte >> 4 };
                    clut_color(gstate, clut_index(gstate, nibble as u32))
                }
            };
            pixels.push(texel);
        }
    }

    Ok(DecodedTexture {
        width,
        height,
        pixels,
    })
}

/// The loaded CLUT as ARGB colors.
pub fn clut_colors(gstate: &GpuStateStore) -> Vec<u32> {
    let entry_bytes = if gstate.clut_format() == PixelFormat::Rgba8888 {
        4
    } else {
        2
    };
    let count = gstate.ctx.clut_loaded_bytes / entry_bytes;
    (0..count).map(|i| clut_color(gstate, i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::*;

    fn set(state: &mut GpuStateStore, op: u8, data: u32) {
        state.cmdmem[op as usize] = word(op, data);
    }

    #[test]
    fn test_unswizzle_single_block_column() {
        // 16 bytes per row, 8 rows: swizzled order equals linear order.
        let src: Vec<u8> = (0..128).map(|i| i as u8).collect();
        assert_eq!(unswizzle(&src, 16, 8), src);
    }

    #[test]
    fn test_unswizzle_two_blocks() {
        // Two blocks side by side: block 0 holds rows 0..8 of bytes 0..16.
        let mut src = vec![0u8; 256];
        src[..128].fill(1);
        src[128..].fill(2);
        let out = unswizzle(&src, 32, 8);
        assert_eq!(&out[0..16], &[1; 16]);
        assert_eq!(&out[16..32], &[2; 16]);
        assert_eq!(&out[7 * 32 + 16..8 * 32], &[2; 16]);
    }

    #[test]
    fn test_decode_8888() {
        let mut mem = GuestMemory::new();
        let mut state = GpuStateStore::new();
        set(&mut state, GE_CMD_TEXADDR0, 0x10_0000);
        set(&mut state, GE_CMD_TEXBUFWIDTH0, 0x08_0002);
        set(&mut state, GE_CMD_TEXSIZE0, 0x0101);
        set(&mut state, GE_CMD_TEXFORMAT, 3);
        mem.write_words(0x0810_0000, &[0xFF00_00FF, 0xFF00_FF00, 0xFFFF_0000, 0x8000_0000])
            .unwrap();

        let tex = decode_texture(&state, &mem).unwrap();
        assert_eq!((tex.width, tex.height), (2, 2));
        assert_eq!(tex.pixels[0], 0xFFFF_0000);
        assert_eq!(tex.pixels[1], 0xFF00_FF00);
        assert_eq!(tex.pixels[2], 0xFF00_00FF);
        assert_eq!(tex.pixels[3], 0x8000_0000);
    }

    #[test]
    fn test_decode_clut8_with_shift_mask_start() {
        let mut mem = GuestMemory::new();
        let mut state = GpuStateStore::new();
        set(&mut state, GE_CMD_TEXADDR0, 0x10_0000);
        set(&mut state, GE_CMD_TEXBUFWIDTH0, 0x08_0004);
        set(&mut state, GE_CMD_TEXSIZE0, 0x0002);
        set(&mut state, GE_CMD_TEXFORMAT, TEXFMT_CLUT8);
        // 32-bit entries, shift 1, mask 0xFF, start 0
        set(&mut state, GE_CMD_CLUTFORMAT, 3 | (1 << 2) | (0xFF << 8));
        state.ctx.clut[4..8].copy_from_slice(&0xFF00_00FFu32.to_le_bytes());
        mem.write_bytes(0x0810_0000, &[2, 3, 0, 1]).unwrap();

        let tex = decode_texture(&state, &mem).unwrap();
        // 2 >> 1 = 1 and 3 >> 1 = 1 both hit entry 1 (red).
        assert_eq!(tex.pixels[0], 0xFFFF_0000);
        assert_eq!(tex.pixels[1], 0xFFFF_0000);
        assert_eq!(tex.pixels[2], 0);
    }

    #[test]
    fn test_out_of_range_texture_fails() {
        let mem = GuestMemory::new();
        let mut state = GpuStateStore::new();
        set(&mut state, GE_CMD_TEXADDR0, 0xFF_FFF0);
        set(&mut state, GE_CMD_TEXBUFWIDTH0, 0x0F_0200);
        set(&mut state, GE_CMD_TEXSIZE0, 0x0909);
        set(&mut state, GE_CMD_TEXFORMAT, 3);
        assert!(matches!(
            decode_texture(&state, &mem),
            Err(GpuError::OutOfBoundsMemoryAccess { .. })
        ));
    }
}
