//! PSP GE (Graphics Engine) command interpreter and presentation core.
//!
//! The GE consumes display lists of 32-bit command words written by the
//! emulated CPU. This crate walks those lists, keeps the persistent register
//! state, batches draws for an abstract graphics backend and composites the
//! finished frame onto the host surface:
//!
//! - **Dispatcher** ([`gpu`], [`handlers`], [`cmd_table`], [`display_list`]):
//!   list queue, stalls, signals, per-opcode dispatch
//! - **State** ([`gstate`]): `cmdmem`, matrix banks, dirty tracking
//! - **Draw engine** ([`draw_engine`]): batching and dirty-object rebuild
//! - **Framebuffers** ([`framebuffer`]): virtual render targets and display
//! - **Presentation** ([`presentation`], [`post_shader`], [`geometry`]):
//!   post-processing chain and final blit
//! - **Backends** ([`backend`]): the `DrawContext` trait, a recording headless
//!   backend and an optional OpenGL backend (feature `opengl`)

pub mod backend;
pub mod cmd_table;
pub mod command;
pub mod config;
pub mod debug;
pub mod display_list;
pub mod draw_engine;
pub mod framebuffer;
pub mod geometry;
pub mod gpu;
pub mod gstate;
pub mod handlers;
pub mod memory;
pub mod post_shader;
pub mod presentation;
pub mod savestate;
pub mod texture;
pub mod vertex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use backend::headless::HeadlessDrawContext;
pub use backend::{BackendError, DrawContext};
pub use cmd_table::CommandTable;
pub use config::{Config, GpuConfig, PresentationConfig};
pub use gpu::{CommandTrace, PspGpu};
pub use memory::GuestMemory;
pub use presentation::{OutputFlags, PresentationCommon, PresentationState};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GpuError {
    #[error("Malformed command {word:08x} at {pc:08x}")]
    MalformedOpcode { pc: u32, word: u32 },
    #[error("Guest memory access out of bounds: {len} bytes at {addr:08x}")]
    OutOfBoundsMemoryAccess { addr: u32, len: usize },
    #[error("Shader compile failure: {0}")]
    ShaderCompileFailure(String),
    #[error("Backend resources exhausted: {0}")]
    BackendResourceExhaustion(String),
    #[error("Graphics device lost")]
    DeviceLost,
    #[error("Display list queue full ({0} lists)")]
    ListQueueFull(usize),
    #[error("Invalid display list id {0}")]
    InvalidListId(usize),
    #[error("Invalid display list address {0:08x}")]
    InvalidListAddress(u32),
    #[error("Invalid save state: {0}")]
    State(String),
    #[error("Save state checksum mismatch: stored {stored:08x}, computed {computed:08x}")]
    StateChecksum { stored: u32, computed: u32 },
    #[error("Save state layout mismatch: {0}")]
    StateLayout(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Counters kept by the interpreter, the draw engine and presentation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuStats {
    /// Command words executed
    pub commands: u64,
    pub unknown_opcodes: u64,
    /// PRIM, BEZIER and SPLINE draws queued
    pub draw_calls: u64,
    pub flushes: u64,
    /// Batches that reached the backend
    pub submissions: u64,
    pub vertices_submitted: u64,
    pub submission_errors: u64,
    pub backend_errors: u64,
    /// Batches discarded after an error or device loss
    pub dropped_batches: u64,
    /// Vertices cut from draws larger than one batch
    pub truncated_vertices: u64,
    pub memory_errors: u64,
    pub pipelines_created: u64,
    pub textures_decoded: u64,
    pub block_transfers: u64,
    pub signals: u64,
    pub lists_completed: u64,
    pub frames: u64,
}
