//! Output rectangle math for presentation.
//!
//! Coordinates are in backbuffer pixels with the origin at the top left.

use crate::config::{CardboardConfig, PresentationConfig, ZoomMode};
use crate::presentation::OutputFlags;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Native GE display size.
pub const PSP_WIDTH: f32 = 480.0;
pub const PSP_HEIGHT: f32 = 272.0;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl FRect {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }
}

/// Screen orientation, applied by rotating texture coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ScreenRotation {
    #[default]
    Horizontal,
    Vertical,
    Horizontal180,
    Vertical180,
}

impl ScreenRotation {
    pub fn is_vertical(self) -> bool {
        matches!(self, ScreenRotation::Vertical | ScreenRotation::Vertical180)
    }

    /// Quarter turns applied to the quad's texture coordinates.
    fn quarter_turns(self) -> usize {
        match self {
            ScreenRotation::Horizontal => 0,
            ScreenRotation::Horizontal180 => 2,
            ScreenRotation::Vertical => 3,
            ScreenRotation::Vertical180 => 1,
        }
    }
}

/// Zoom parameters used by [`center_display_output_rect`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayLayout {
    pub zoom: ZoomMode,
    pub manual_zoom: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

impl Default for DisplayLayout {
    fn default() -> Self {
        Self {
            zoom: ZoomMode::Auto,
            manual_zoom: 1.0,
            offset_x: 0.5,
            offset_y: 0.5,
        }
    }
}

impl From<&PresentationConfig> for DisplayLayout {
    fn from(config: &PresentationConfig) -> Self {
        Self {
            zoom: config.zoom,
            manual_zoom: config.manual_zoom,
            offset_x: config.manual_offset_x,
            offset_y: config.manual_offset_y,
        }
    }
}

/// Fit an `orig_w` x `orig_h` image into `frame`.
pub fn center_display_output_rect(
    orig_w: f32,
    orig_h: f32,
    frame: FRect,
    rotation: ScreenRotation,
    layout: &DisplayLayout,
) -> FRect {
    let rotated = rotation.is_vertical();

    let (out_w, out_h) = match layout.zoom {
        ZoomMode::Stretch => (frame.w, frame.h),
        ZoomMode::Manual => {
            let offset_x = (layout.offset_x - 0.5) * 2.0 * frame.w + frame.x;
            let offset_y = (layout.offset_y - 0.5) * 2.0 * frame.h + frame.y;
            let small_w = orig_w * layout.manual_zoom;
            let small_h = orig_h * layout.manual_zoom;
            let (w, h) = if rotated {
                (small_h, small_w)
            } else {
                (small_w, small_h)
            };
            return FRect {
                x: (((frame.w - w) / 2.0) + offset_x).floor(),
                y: (((frame.h - h) / 2.0) + offset_y).floor(),
                w: w.floor(),
                h: h.floor(),
            };
        }
        zoom => {
            if zoom == ZoomMode::Auto {
                // Exact multiples of 270 lines (1080p and friends) get a clean
                // integer scale that crops one line top and bottom.
                let pixel_crop = frame.h / 270.0;
                let fractional = pixel_crop - pixel_crop.floor();
                if !rotated && fractional == 0.0 && frame.w >= pixel_crop * PSP_WIDTH {
                    return FRect {
                        x: ((frame.w - pixel_crop * PSP_WIDTH) * 0.5 + frame.x).floor(),
                        y: (-pixel_crop + frame.y).floor(),
                        w: (pixel_crop * PSP_WIDTH).floor(),
                        h: (pixel_crop * PSP_HEIGHT).floor(),
                    };
                }
            }

            let orig_ratio = if rotated {
                orig_h / orig_w
            } else {
                orig_w / orig_h
            };
            let frame_ratio = frame.w / frame.h;

            if orig_ratio > frame_ratio {
                // Wider than the frame: letterbox top and bottom.
                let out_w = frame.w;
                let mut out_h = frame.w / orig_ratio;
                if !rotated && zoom == ZoomMode::PartialStretch {
                    out_h = (frame.h + out_h) / 2.0;
                }
                (out_w, out_h)
            } else {
                // Taller than the frame: pillarbox left and right.
                let mut out_w = frame.h * orig_ratio;
                let out_h = frame.h;
                if rotated && zoom == ZoomMode::PartialStretch {
                    out_w = (frame.h + out_h) / 2.0;
                }
                (out_w, out_h)
            }
        }
    };

    FRect {
        x: ((frame.w - out_w) / 2.0 + frame.x).floor(),
        y: ((frame.h - out_h) / 2.0 + frame.y).floor(),
        w: out_w.floor(),
        h: out_h.floor(),
    }
}

/// The usable part of the backbuffer after safe-area insets.
pub fn get_screen_frame(pixel_w: f32, pixel_h: f32, config: &PresentationConfig) -> FRect {
    let mut rc = FRect::new(0.0, 0.0, pixel_w, pixel_h);
    if !config.ignore_insets {
        let dpi_x = if config.dpi_scale_x > 0.0 {
            config.dpi_scale_x
        } else {
            1.0
        };
        let dpi_y = if config.dpi_scale_y > 0.0 {
            config.dpi_scale_y
        } else {
            1.0
        };
        let left = config.insets.left / dpi_x;
        let right = config.insets.right / dpi_x;
        let top = config.insets.top / dpi_y;
        let bottom = config.insets.bottom / dpi_y;
        rc.x += left;
        rc.w -= left + right;
        rc.y += top;
        rc.h -= top + bottom;
    }
    rc
}

/// Per-eye placement for side-by-side stereo output.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CardboardSettings {
    pub enabled: bool,
    pub left_eye_x: f32,
    pub right_eye_x: f32,
    pub screen_y: f32,
    pub screen_width: f32,
    pub screen_height: f32,
}

pub fn cardboard_settings(pixel_w: f32, pixel_h: f32, config: &CardboardConfig) -> CardboardSettings {
    if !config.enabled {
        return CardboardSettings::default();
    }

    let scale = config.screen_size as f32 / 100.0;
    let screen_width = pixel_w / 2.0 * scale;
    let screen_height = pixel_h * scale;
    let max_x_shift = (pixel_w / 2.0 - screen_width) / 2.0;
    let user_x_shift = config.x_shift as f32 / 100.0 * max_x_shift;
    let max_y_shift = pixel_h / 2.0 - screen_height / 2.0;
    let user_y_shift = config.y_shift as f32 / 100.0 * max_y_shift;

    CardboardSettings {
        enabled: true,
        left_eye_x: max_x_shift + user_x_shift,
        right_eye_x: pixel_w / 2.0 + max_x_shift - user_x_shift,
        screen_y: max_y_shift + user_y_shift,
        screen_width,
        screen_height,
    }
}

/// Presentation vertex: position in normalized device coordinates plus UV.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct QuadVertex {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub u: f32,
    pub v: f32,
}

pub const QUAD_VERTEX_SIZE: usize = std::mem::size_of::<QuadVertex>();

/// Two triangles over a four-vertex quad.
pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 0, 2, 3];

/// Texture window of a quad: u0, v0, u1, v1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvRect {
    pub u0: f32,
    pub v0: f32,
    pub u1: f32,
    pub v1: f32,
}

impl UvRect {
    pub const FULL: Self = Self {
        u0: 0.0,
        v0: 0.0,
        u1: 1.0,
        v1: 1.0,
    };
}

/// Quad covering `rc` on a `pixel_w` x `pixel_h` target.
///
/// Applies, in order: the flip of the v range, UV rotation (turned the other
/// way when flipped), the pillarbox x-scale and the final y flip.
pub fn output_quad(
    rc: FRect,
    pixel_w: f32,
    pixel_h: f32,
    flags: OutputFlags,
    uv_rotation: ScreenRotation,
    uv: UvRect,
) -> [QuadVertex; 4] {
    let flipped = flags.intersects(OutputFlags::BACKBUFFER_FLIPPED | OutputFlags::POSITION_FLIPPED);
    let UvRect { u0, mut v0, u1, mut v1 } = uv;
    if flipped {
        std::mem::swap(&mut v0, &mut v1);
    }

    let inv_w = 2.0 / pixel_w;
    let inv_h = 2.0 / pixel_h;
    let corner = |x: f32, y: f32, u: f32, v: f32| QuadVertex {
        x: x * inv_w - 1.0,
        y: y * inv_h - 1.0,
        z: 0.0,
        u,
        v,
    };
    let mut verts = [
        corner(rc.x, rc.y, u0, v0),
        corner(rc.x + rc.w, rc.y, u1, v0),
        corner(rc.x + rc.w, rc.y + rc.h, u1, v1),
        corner(rc.x, rc.y + rc.h, u0, v1),
    ];

    let mut turns = uv_rotation.quarter_turns();
    if turns != 0 {
        if flipped && turns & 1 != 0 {
            turns ^= 2;
        }
        let uvs: [(f32, f32); 4] = std::array::from_fn(|i| {
            let src = &verts[(i + turns) & 3];
            (src.u, src.v)
        });
        for (vert, (u, v)) in verts.iter_mut().zip(uvs) {
            vert.u = u;
            vert.v = v;
        }
    }

    if flags.contains(OutputFlags::PILLARBOX) {
        for vert in &mut verts {
            vert.x *= 0.75;
        }
    }

    if flipped {
        for vert in &mut verts {
            vert.y = -vert.y;
        }
    }

    verts
}

/// Full-target quad for intermediate post-processing passes.
pub fn pass_quad(uv: UvRect) -> [QuadVertex; 4] {
    [
        QuadVertex { x: -1.0, y: -1.0, z: 0.0, u: uv.u0, v: uv.v0 },
        QuadVertex { x: 1.0, y: -1.0, z: 0.0, u: uv.u1, v: uv.v0 },
        QuadVertex { x: 1.0, y: 1.0, z: 0.0, u: uv.u1, v: uv.v1 },
        QuadVertex { x: -1.0, y: 1.0, z: 0.0, u: uv.u0, v: uv.v1 },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_720p() -> FRect {
        FRect::new(0.0, 0.0, 1280.0, 720.0)
    }

    #[test]
    fn test_auto_fit_720p() {
        let rc = center_display_output_rect(
            480.0,
            272.0,
            frame_720p(),
            ScreenRotation::Horizontal,
            &DisplayLayout::default(),
        );
        assert_eq!(rc, FRect::new(4.0, 0.0, 1270.0, 720.0));
        // Touches top and bottom, centered horizontally.
        assert_eq!(rc.y, 0.0);
        assert_eq!(rc.y + rc.h, 720.0);
        assert!((rc.w / rc.h - 480.0 / 272.0).abs() < 0.01);
    }

    #[test]
    fn test_auto_integer_scale_1080p() {
        let rc = center_display_output_rect(
            480.0,
            272.0,
            FRect::new(0.0, 0.0, 1920.0, 1080.0),
            ScreenRotation::Horizontal,
            &DisplayLayout::default(),
        );
        assert_eq!(rc, FRect::new(0.0, -4.0, 1920.0, 1088.0));
    }

    #[test]
    fn test_stretch() {
        let layout = DisplayLayout {
            zoom: ZoomMode::Stretch,
            ..Default::default()
        };
        let rc = center_display_output_rect(
            480.0,
            272.0,
            frame_720p(),
            ScreenRotation::Horizontal,
            &layout,
        );
        assert_eq!(rc, frame_720p());
    }

    #[test]
    fn test_partial_stretch_letterbox() {
        let layout = DisplayLayout {
            zoom: ZoomMode::PartialStretch,
            ..Default::default()
        };
        // 4:3 frame, image is wider: height goes half way to the frame.
        let rc = center_display_output_rect(
            480.0,
            272.0,
            FRect::new(0.0, 0.0, 960.0, 720.0),
            ScreenRotation::Horizontal,
            &layout,
        );
        assert_eq!(rc.w, 960.0);
        assert_eq!(rc.h, 632.0);
        assert_eq!(rc.y, 44.0);
    }

    #[test]
    fn test_manual_zoom_centered() {
        let layout = DisplayLayout {
            zoom: ZoomMode::Manual,
            manual_zoom: 2.0,
            offset_x: 0.5,
            offset_y: 0.5,
        };
        let rc = center_display_output_rect(
            480.0,
            272.0,
            frame_720p(),
            ScreenRotation::Horizontal,
            &layout,
        );
        assert_eq!(rc, FRect::new(160.0, 88.0, 960.0, 544.0));
    }

    #[test]
    fn test_vertical_rotation_swaps_ratio() {
        let rc = center_display_output_rect(
            480.0,
            272.0,
            frame_720p(),
            ScreenRotation::Vertical,
            &DisplayLayout::default(),
        );
        assert_eq!(rc.h, 720.0);
        assert_eq!(rc.w, 408.0);
    }

    #[test]
    fn test_screen_frame_insets() {
        let mut config = PresentationConfig::default();
        config.insets.left = 40.0;
        config.insets.top = 20.0;
        config.dpi_scale_x = 2.0;
        config.dpi_scale_y = 2.0;

        assert_eq!(
            get_screen_frame(1280.0, 720.0, &config),
            FRect::new(0.0, 0.0, 1280.0, 720.0)
        );

        config.ignore_insets = false;
        assert_eq!(
            get_screen_frame(1280.0, 720.0, &config),
            FRect::new(20.0, 10.0, 1260.0, 710.0)
        );
    }

    #[test]
    fn test_cardboard_settings() {
        let disabled = cardboard_settings(1280.0, 720.0, &CardboardConfig::default());
        assert!(!disabled.enabled);

        let config = CardboardConfig {
            enabled: true,
            screen_size: 50,
            x_shift: 0,
            y_shift: 0,
        };
        let s = cardboard_settings(1280.0, 720.0, &config);
        assert!(s.enabled);
        assert_eq!(s.screen_width, 320.0);
        assert_eq!(s.screen_height, 360.0);
        assert_eq!(s.left_eye_x, 160.0);
        assert_eq!(s.right_eye_x, 800.0);
        assert_eq!(s.screen_y, 180.0);
    }

    #[test]
    fn test_output_quad_plain() {
        let q = output_quad(
            FRect::new(0.0, 0.0, 100.0, 50.0),
            100.0,
            50.0,
            OutputFlags::empty(),
            ScreenRotation::Horizontal,
            UvRect::FULL,
        );
        assert_eq!((q[0].x, q[0].y, q[0].u, q[0].v), (-1.0, -1.0, 0.0, 0.0));
        assert_eq!((q[2].x, q[2].y, q[2].u, q[2].v), (1.0, 1.0, 1.0, 1.0));
    }

    #[test]
    fn test_output_quad_pillarbox_and_flip() {
        let q = output_quad(
            FRect::new(0.0, 0.0, 100.0, 50.0),
            100.0,
            50.0,
            OutputFlags::PILLARBOX | OutputFlags::BACKBUFFER_FLIPPED,
            ScreenRotation::Horizontal,
            UvRect::FULL,
        );
        assert_eq!(q[0].x, -0.75);
        assert_eq!(q[1].x, 0.75);
        assert_eq!(q[0].y, 1.0);
        // v range swapped by the flip
        assert_eq!(q[0].v, 1.0);
        assert_eq!(q[3].v, 0.0);
    }

    #[test]
    fn test_output_quad_rotation() {
        let q = output_quad(
            FRect::new(0.0, 0.0, 100.0, 50.0),
            100.0,
            50.0,
            OutputFlags::empty(),
            ScreenRotation::Horizontal180,
            UvRect::FULL,
        );
        // Half turn: the top-left corner samples the bottom-right texel.
        assert_eq!((q[0].u, q[0].v), (1.0, 1.0));
        assert_eq!((q[2].u, q[2].v), (0.0, 0.0));
    }
}
