//! Pixel helpers shared by the GE core and its frontends.

pub mod color;

pub use color::{ColorOps, PixelFormat};
