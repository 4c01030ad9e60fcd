//! Core primitives shared by the GE interpreter and its frontends.

pub mod graphics;
pub mod logging;

pub mod types {
    use serde::{Deserialize, Serialize};

    /// An ARGB8888 image, row-major.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Frame {
        pub width: u32,
        pub height: u32,
        pub pixels: Vec<u32>,
    }

    impl Frame {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                pixels: vec![0; (width * height) as usize],
            }
        }

        /// Pixel at (x, y), or `None` outside the frame.
        pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
            if x >= self.width || y >= self.height {
                return None;
            }
            self.pixels.get((y * self.width + x) as usize).copied()
        }
    }
}

use serde_json::Value;

/// A frame-producing machine with JSON save states.
pub trait System {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reset to the initial power-on state
    fn reset(&mut self);

    /// Run until a frame is presented and return what was displayed.
    fn step_frame(&mut self) -> Result<types::Frame, Self::Error>;

    /// Return a JSON-serializable save state.
    /// Guest memory is not included; only the machine's own registers.
    fn save_state(&self) -> Value;

    /// Load a JSON save state produced by `save_state`.
    fn load_state(&mut self, v: &Value) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_initialization() {
        let f = types::Frame::new(10, 10);
        assert_eq!(f.pixels.len(), 100);
        assert_eq!(f.width, 10);
        assert_eq!(f.height, 10);
    }

    #[test]
    fn frame_pixel_bounds() {
        let mut f = types::Frame::new(4, 2);
        f.pixels[5] = 0xFF00FF00;
        assert_eq!(f.pixel(1, 1), Some(0xFF00FF00));
        assert_eq!(f.pixel(4, 0), None);
        assert_eq!(f.pixel(0, 2), None);
    }

    struct MockSystem {
        frames: u32,
    }

    impl System for MockSystem {
        type Error = std::convert::Infallible;

        fn reset(&mut self) {
            self.frames = 0;
        }

        fn step_frame(&mut self) -> Result<types::Frame, Self::Error> {
            self.frames += 1;
            Ok(types::Frame::new(2, 2))
        }

        fn save_state(&self) -> Value {
            serde_json::json!({ "frames": self.frames })
        }

        fn load_state(&mut self, v: &Value) -> Result<(), Self::Error> {
            self.frames = v["frames"].as_u64().unwrap_or(0) as u32;
            Ok(())
        }
    }

    #[test]
    fn mock_system_save_load_roundtrip() {
        let mut sys = MockSystem { frames: 0 };
        sys.step_frame().unwrap();
        sys.step_frame().unwrap();
        let v = sys.save_state();
        let s = serde_json::to_string(&v).expect("serialize");
        let v2: Value = serde_json::from_str(&s).expect("deserialize");
        let mut sys2 = MockSystem { frames: 0 };
        assert!(sys2.load_state(&v2).is_ok());
        assert_eq!(sys2.frames, 2);

        sys2.reset();
        assert_eq!(sys2.frames, 0);
    }
}
