//! Pixel format conversions for the GE's 16- and 32-bit framebuffer formats.
//!
//! Everything converts to ARGB8888 (0xAARRGGBB), the layout used by
//! [`crate::types::Frame`].

use serde::{Deserialize, Serialize};

/// GE pixel formats, numbered as in the FRAMEBUFPIXFORMAT register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb565 = 0,
    Rgba5551 = 1,
    Rgba4444 = 2,
    Rgba8888 = 3,
}

impl PixelFormat {
    /// Decode the low two bits of a format register.
    pub fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => PixelFormat::Rgb565,
            1 => PixelFormat::Rgba5551,
            2 => PixelFormat::Rgba4444,
            _ => PixelFormat::Rgba8888,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8888 => 4,
            _ => 2,
        }
    }
}

/// Color operation utilities
pub struct ColorOps;

impl ColorOps {
    #[inline]
    fn expand5(v: u32) -> u32 {
        (v << 3) | (v >> 2)
    }

    #[inline]
    fn expand6(v: u32) -> u32 {
        (v << 2) | (v >> 4)
    }

    #[inline]
    fn expand4(v: u32) -> u32 {
        (v << 4) | v
    }

    /// R in bits 0-4, G in 5-10, B in 11-15; alpha is opaque.
    ///
    /// ```
    /// use emu_core::graphics::ColorOps;
    ///
    /// assert_eq!(ColorOps::from_565(0x001F), 0xFFFF0000);
    /// ```
    #[inline]
    pub fn from_565(px: u16) -> u32 {
        let px = px as u32;
        let r = Self::expand5(px & 0x1F);
        let g = Self::expand6((px >> 5) & 0x3F);
        let b = Self::expand5((px >> 11) & 0x1F);
        0xFF00_0000 | (r << 16) | (g << 8) | b
    }

    /// R, G, B in 5-bit fields from bit 0, alpha in bit 15.
    #[inline]
    pub fn from_5551(px: u16) -> u32 {
        let px = px as u32;
        let r = Self::expand5(px & 0x1F);
        let g = Self::expand5((px >> 5) & 0x1F);
        let b = Self::expand5((px >> 10) & 0x1F);
        let a = if px & 0x8000 != 0 { 0xFF } else { 0 };
        (a << 24) | (r << 16) | (g << 8) | b
    }

    /// R, G, B, A nibbles from bit 0.
    #[inline]
    pub fn from_4444(px: u16) -> u32 {
        let px = px as u32;
        let r = Self::expand4(px & 0xF);
        let g = Self::expand4((px >> 4) & 0xF);
        let b = Self::expand4((px >> 8) & 0xF);
        let a = Self::expand4((px >> 12) & 0xF);
        (a << 24) | (r << 16) | (g << 8) | b
    }

    /// Guest ABGR8888 (R in the low byte) to ARGB8888.
    #[inline]
    pub fn from_8888(px: u32) -> u32 {
        let r = px & 0xFF;
        let g = (px >> 8) & 0xFF;
        let b = (px >> 16) & 0xFF;
        let a = px >> 24;
        (a << 24) | (r << 16) | (g << 8) | b
    }

    /// Convert a little-endian guest pixel row into ARGB8888.
    ///
    /// `src` must hold at least `width * bytes_per_pixel` bytes; a short row
    /// converts only the complete pixels it contains.
    pub fn convert_row(format: PixelFormat, src: &[u8], dst: &mut [u32]) {
        match format {
            PixelFormat::Rgba8888 => {
                for (out, px) in dst.iter_mut().zip(src.chunks_exact(4)) {
                    *out = Self::from_8888(u32::from_le_bytes([px[0], px[1], px[2], px[3]]));
                }
            }
            _ => {
                let convert = match format {
                    PixelFormat::Rgb565 => Self::from_565,
                    PixelFormat::Rgba5551 => Self::from_5551,
                    _ => Self::from_4444,
                };
                for (out, px) in dst.iter_mut().zip(src.chunks_exact(2)) {
                    *out = convert(u16::from_le_bytes([px[0], px[1]]));
                }
            }
        }
    }

    /// Swap the red and blue channels of an ARGB color
    #[inline]
    pub fn swap_rb(color: u32) -> u32 {
        (color & 0xFF00_FF00) | ((color >> 16) & 0xFF) | ((color & 0xFF) << 16)
    }

    /// Extract red channel from ARGB color
    #[inline]
    pub fn red(color: u32) -> u8 {
        ((color >> 16) & 0xFF) as u8
    }

    /// Extract green channel from ARGB color
    #[inline]
    pub fn green(color: u32) -> u8 {
        ((color >> 8) & 0xFF) as u8
    }

    /// Extract blue channel from ARGB color
    #[inline]
    pub fn blue(color: u32) -> u8 {
        (color & 0xFF) as u8
    }

    /// Extract alpha channel from ARGB color
    #[inline]
    pub fn alpha(color: u32) -> u8 {
        ((color >> 24) & 0xFF) as u8
    }
}
