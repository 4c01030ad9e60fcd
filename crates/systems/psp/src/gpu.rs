//! The GE command interpreter.
//!
//! # Architecture
//!
//! ```text
//! enqueue_list / update_stall / continue_list
//!        │
//!        ▼
//! process_dl_queue ──► interpret_list ──► run loop (fast, or slow with hook)
//!                                             │ per word
//!                                             ▼
//!                         pre_execute_op ─► cmdmem ─► execute_op
//!                         (flush check)               (handler or dirty bits)
//!                                                          │
//!                                                          ▼
//!                                     DrawEngine ─► DrawContext ◄─ PresentationCommon
//! ```
//!
//! The running list's program counter lives in [`PspGpu`] while the list
//! executes and is written back when the run stops. Handlers that redirect
//! the list set the pc to the word *before* the target, since the loop
//! advances past every word it executes.

use crate::backend::DrawContext;
use crate::cmd_table::{CommandFlags, CommandTable};
use crate::command::*;
use crate::config::{Config, GpuConfig};
use crate::display_list::{DisplayListQueue, ListState};
use crate::draw_engine::{DrawEngine, FlushReport, GePrimitive};
use crate::framebuffer::FramebufferManager;
use crate::gstate::{DirtyFlags, GpuStateStore};
use crate::memory::GuestMemory;
use crate::post_shader::ShaderRegistry;
use crate::presentation::PresentationCommon;
use crate::{GpuError, GpuStats};
use emu_core::graphics::PixelFormat;
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::types::Frame;
use emu_core::System;
use serde_json::Value;

/// What the command hook sees before each word executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTrace {
    pub pc: u32,
    /// The word about to execute
    pub op: u32,
    /// The word it replaces in `cmdmem`
    pub previous: u32,
}

pub type CommandHook = Box<dyn FnMut(&CommandTrace)>;

/// State changed by [`PspGpu::copy_display_to_output`] that every later draw
/// has to rebuild.
const PRESENT_DIRTY: DirtyFlags = DirtyFlags::FRAMEBUF
    .union(DirtyFlags::PIPELINE)
    .union(DirtyFlags::VIEWPORT)
    .union(DirtyFlags::TEXTURE)
    .union(DirtyFlags::UNIFORMS);

pub struct PspGpu<D: DrawContext> {
    pub(crate) mem: GuestMemory,
    pub(crate) table: CommandTable<D>,
    pub(crate) gstate: GpuStateStore,
    pub(crate) lists: DisplayListQueue,
    pub(crate) draw: DrawEngine,
    pub(crate) framebuffers: FramebufferManager,
    pub(crate) presentation: PresentationCommon,
    pub(crate) ctx: D,
    pub(crate) config: GpuConfig,
    pub(crate) stats: GpuStats,
    hook: Option<CommandHook>,

    /// Program counter of the running list
    pub(crate) pc: u32,
    /// Words the run loop may still execute before re-checking the stall
    pub(crate) downcount: u32,
    /// List being interpreted
    pub(crate) current_list: Option<usize>,
    /// Primitive type reused by PRIM type 7
    pub(crate) prev_prim: GePrimitive,
    device_lost: bool,
}

impl<D: DrawContext> PspGpu<D> {
    /// Build a GPU around an explicitly constructed command table.
    pub fn new(mut table: CommandTable<D>, ctx: D, mem: GuestMemory, config: Config) -> Self {
        table.apply_features(&config.gpu);
        let registry = ShaderRegistry::with_builtins();
        let mut gpu = Self {
            mem,
            table,
            gstate: GpuStateStore::new(),
            lists: DisplayListQueue::new(config.gpu.max_display_lists),
            draw: DrawEngine::new(),
            framebuffers: FramebufferManager::new(),
            presentation: PresentationCommon::new(config.presentation, registry),
            ctx,
            config: config.gpu,
            stats: GpuStats::default(),
            hook: None,
            pc: 0,
            downcount: 0,
            current_list: None,
            prev_prim: GePrimitive::Triangles,
            device_lost: false,
        };
        if let Err(e) = gpu.presentation.init_device_objects(&mut gpu.ctx) {
            log(LogCategory::Present, LogLevel::Error, || {
                format!("Failed to create presentation objects: {}", e)
            });
        }
        gpu.presentation.update_post_shader(&mut gpu.ctx);
        gpu.sync_render_scale();
        gpu
    }

    /// Default table, default configuration, 32 MiB of RAM.
    pub fn with_backend(ctx: D) -> Self {
        Self::new(CommandTable::new(), ctx, GuestMemory::new(), Config::default())
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut self.mem
    }

    pub fn state(&self) -> &GpuStateStore {
        &self.gstate
    }

    pub fn state_mut(&mut self) -> &mut GpuStateStore {
        &mut self.gstate
    }

    pub fn lists(&self) -> &DisplayListQueue {
        &self.lists
    }

    pub fn backend(&self) -> &D {
        &self.ctx
    }

    pub fn backend_mut(&mut self) -> &mut D {
        &mut self.ctx
    }

    pub fn framebuffers(&self) -> &FramebufferManager {
        &self.framebuffers
    }

    pub fn draw_engine(&self) -> &DrawEngine {
        &self.draw
    }

    pub fn presentation(&self) -> &PresentationCommon {
        &self.presentation
    }

    pub fn presentation_mut(&mut self) -> (&mut PresentationCommon, &mut D) {
        (&mut self.presentation, &mut self.ctx)
    }

    pub fn table(&self) -> &CommandTable<D> {
        &self.table
    }

    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    pub fn stats(&self) -> &GpuStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = GpuStats::default();
    }

    /// Replace the GPU configuration and re-patch the command table.
    pub fn set_config(&mut self, config: GpuConfig) {
        self.flush();
        self.table.apply_features(&config);
        self.config = config;
    }

    /// Install a hook called before every command; switches to the slow loop.
    pub fn set_command_hook(&mut self, hook: CommandHook) {
        self.hook = Some(hook);
    }

    pub fn clear_command_hook(&mut self) {
        self.hook = None;
    }

    pub fn has_command_hook(&self) -> bool {
        self.hook.is_some()
    }

    /// The last presentation failure as an error.
    pub fn presentation_error(&self) -> Option<GpuError> {
        self.presentation
            .last_error()
            .map(|msg| GpuError::ShaderCompileFailure(msg.to_string()))
    }

    // ----- Dispatch -----

    /// Run the handler or raise the dirty flags for one stored command.
    pub fn execute_op(&mut self, op: u32, diff: u32) {
        let info = *self.table.get((op >> 24) as u8);
        let run = info.flags.contains(CommandFlags::EXECUTE)
            || (info.flags.contains(CommandFlags::EXECUTE_ON_CHANGE) && diff != 0);
        match info.handler {
            Some(handler) if run => handler(self, op, diff),
            _ => {
                if diff != 0 {
                    self.gstate.mark_dirty(info.dirty);
                }
            }
        }
    }

    /// Flush check and hook notification ahead of a command.
    pub fn pre_execute_op(&mut self, op: u32, diff: u32) {
        let opcode = (op >> 24) as u8;
        let flags = self.table.get(opcode).flags;
        if flags.contains(CommandFlags::FLUSH_BEFORE)
            || (diff != 0 && flags.contains(CommandFlags::FLUSH_BEFORE_ON_CHANGE))
        {
            self.flush();
        }
        if let Some(hook) = self.hook.as_mut() {
            hook(&CommandTrace {
                pc: self.pc,
                op,
                previous: self.gstate.cmdmem[opcode as usize],
            });
        }
    }

    /// Execute one command word as the run loop would.
    pub fn execute_word(&mut self, word: u32) {
        let opcode = (word >> 24) as u8;
        if !self.table.get(opcode).is_known() {
            self.unknown_command(word);
            return;
        }
        let diff = word ^ self.gstate.cmdmem[opcode as usize];
        self.pre_execute_op(word, diff);
        self.gstate.cmdmem[opcode as usize] = word;
        self.stats.commands += 1;
        self.execute_op(word, diff);
    }

    fn unknown_command(&mut self, word: u32) {
        self.stats.unknown_opcodes += 1;
        let err = GpuError::MalformedOpcode { pc: self.pc, word };
        log(LogCategory::GE, LogLevel::Warn, || format!("{}, skipped", err));
    }

    fn fetch(&mut self) -> Option<u32> {
        match self.mem.read_u32(self.pc) {
            Ok(word) => Some(word),
            Err(e) => {
                self.stats.memory_errors += 1;
                log(LogCategory::DisplayList, LogLevel::Error, || {
                    format!("List fetch failed: {}; ending list", e)
                });
                self.complete_current_list();
                None
            }
        }
    }

    /// Execute words until the downcount runs out. No hook calls.
    fn run_fast_loop(&mut self) {
        while self.downcount > 0 {
            let Some(word) = self.fetch() else {
                return;
            };
            let opcode = (word >> 24) as u8;
            let info = *self.table.get(opcode);
            if !info.is_known() {
                self.unknown_command(word);
            } else {
                let diff = word ^ self.gstate.cmdmem[opcode as usize];
                if info.flags.contains(CommandFlags::FLUSH_BEFORE)
                    || (diff != 0 && info.flags.contains(CommandFlags::FLUSH_BEFORE_ON_CHANGE))
                {
                    self.flush();
                }
                self.gstate.cmdmem[opcode as usize] = word;
                self.stats.commands += 1;
                self.execute_op(word, diff);
            }
            self.pc = self.pc.wrapping_add(4);
            self.downcount = self.downcount.saturating_sub(1);
        }
    }

    /// Same semantics as the fast loop, through [`execute_word`](Self::execute_word).
    fn run_slow_loop(&mut self) {
        while self.downcount > 0 {
            let Some(word) = self.fetch() else {
                return;
            };
            self.execute_word(word);
            self.pc = self.pc.wrapping_add(4);
            self.downcount = self.downcount.saturating_sub(1);
        }
    }

    /// Stop the run loop after the current word.
    pub(crate) fn break_run(&mut self) {
        self.downcount = 0;
    }

    /// Redirect the running list so `target` executes next.
    pub(crate) fn jump_to(&mut self, target: u32) {
        self.pc = target.wrapping_sub(4);
        // Recompute the distance to the stall address from the new pc.
        self.break_run();
    }

    /// Run list `id` until it completes, pauses or reaches its stall address.
    pub fn interpret_list(&mut self, id: usize) -> Result<ListState, GpuError> {
        let list = self.lists.get_mut(id).ok_or(GpuError::InvalidListId(id))?;
        if matches!(list.state, ListState::Completed | ListState::Paused) {
            return Ok(list.state);
        }
        list.state = ListState::Running;
        self.pc = list.pc;
        self.current_list = Some(id);
        log(LogCategory::DisplayList, LogLevel::Debug, || {
            format!("Running list {} at {:08x}", id, self.pc)
        });

        loop {
            let Some(list) = self.lists.get_mut(id) else {
                break;
            };
            if list.state != ListState::Running {
                break;
            }
            list.pc = self.pc;
            if list.at_stall() {
                list.state = ListState::Stalled;
                log(LogCategory::DisplayList, LogLevel::Trace, || {
                    format!("List {} stalled at {:08x}", id, list.stall)
                });
                break;
            }
            self.downcount = list.downcount().max(1);
            if self.hook.is_some() {
                self.run_slow_loop();
            } else {
                self.run_fast_loop();
            }
        }

        if let Some(list) = self.lists.get_mut(id) {
            list.pc = self.pc;
        }
        self.current_list = None;
        Ok(self
            .lists
            .get(id)
            .map(|l| l.state)
            .unwrap_or(ListState::Completed))
    }

    pub(crate) fn complete_current_list(&mut self) {
        if let Some(list) = self.current_list.and_then(|id| self.lists.get_mut(id)) {
            list.state = ListState::Completed;
            self.stats.lists_completed += 1;
        }
        self.break_run();
    }

    // ----- List API -----

    /// Queue a list starting at `pc`; `stall` 0 means no stall address.
    pub fn enqueue_list(&mut self, pc: u32, stall: u32) -> Result<usize, GpuError> {
        let pc = pc & 0x0FFF_FFFC;
        if !self.mem.is_valid_address(pc) {
            return Err(GpuError::InvalidListAddress(pc));
        }
        let id = self.lists.enqueue(pc, stall & 0x0FFF_FFFC)?;
        log(LogCategory::DisplayList, LogLevel::Debug, || {
            format!("Enqueued list {} at {:08x}, stall {:08x}", id, pc, stall)
        });
        self.process_dl_queue();
        Ok(id)
    }

    /// Move a list's stall address and resume it.
    pub fn update_stall(&mut self, id: usize, stall: u32) -> Result<(), GpuError> {
        let list = self.lists.get_mut(id).ok_or(GpuError::InvalidListId(id))?;
        list.stall = stall & 0x0FFF_FFFC;
        if list.state == ListState::Stalled {
            list.state = ListState::Queued;
        }
        self.process_dl_queue();
        Ok(())
    }

    /// Resume the list a PAUSE signal stopped. Returns false if none is paused.
    pub fn continue_list(&mut self) -> bool {
        let Some(list) = self.lists.current_mut() else {
            return false;
        };
        if list.state != ListState::Paused {
            return false;
        }
        list.state = ListState::Queued;
        self.process_dl_queue();
        true
    }

    /// Flush and report the state of list `id`. Retired lists report
    /// [`ListState::Completed`].
    pub fn list_sync(&mut self, id: usize) -> Result<ListState, GpuError> {
        if id >= self.lists.capacity() {
            return Err(GpuError::InvalidListId(id));
        }
        self.flush();
        Ok(self
            .lists
            .get(id)
            .map(|l| l.state)
            .unwrap_or(ListState::Completed))
    }

    /// Flush everything queued. Returns true when no list is left to run.
    pub fn draw_sync(&mut self) -> bool {
        self.flush();
        self.lists.is_empty()
    }

    /// Run queued lists in order until the queue drains or a list blocks.
    /// Returns true when the queue is empty.
    pub fn process_dl_queue(&mut self) -> bool {
        while let Some(id) = self.lists.front() {
            let state = match self.interpret_list(id) {
                Ok(state) => state,
                Err(_) => {
                    self.lists.retire(id);
                    continue;
                }
            };
            if state != ListState::Completed {
                return false;
            }
            self.flush();
            self.lists.retire(id);
            log(LogCategory::DisplayList, LogLevel::Debug, || {
                format!("List {} completed", id)
            });
        }
        true
    }

    // ----- Drawing -----

    /// Submit pending draws.
    pub fn flush(&mut self) -> FlushReport {
        if !self.draw.has_pending() {
            return FlushReport::default();
        }
        if self.ctx.is_device_lost() && !self.device_lost {
            self.device_lost();
        }
        self.draw.flush(
            &mut self.gstate,
            &self.mem,
            &mut self.framebuffers,
            &mut self.ctx,
            &mut self.stats,
        )
    }

    pub fn set_display_framebuffer(&mut self, address: u32, stride: u32, format: PixelFormat) {
        self.framebuffers
            .set_display_framebuffer(address, stride, format);
    }

    /// Present the display framebuffer and start the next frame.
    pub fn copy_display_to_output(&mut self) {
        self.flush();
        if self.ctx.is_device_lost() {
            if !self.device_lost {
                self.device_lost();
            }
            return;
        }
        self.presentation.notify_vblank();
        self.framebuffers.copy_display_to_output(
            &self.mem,
            &mut self.presentation,
            &mut self.ctx,
            &mut self.stats,
        );
        // Presentation rebinds targets, pipelines and textures behind the
        // draw engine's back.
        self.gstate.mark_dirty(PRESENT_DIRTY);
        self.draw.invalidate_bindings();
        self.sync_render_scale();
        self.framebuffers.begin_frame(&mut self.ctx);
        self.stats.frames += 1;
    }

    fn sync_render_scale(&mut self) {
        let chain = self
            .presentation
            .registry()
            .configured_chain(&self.presentation.config().post_shaders);
        let render = self
            .presentation
            .update_render_resolution(&self.ctx, &chain);
        self.framebuffers.set_render_scale(&mut self.ctx, render.scale);
    }

    // ----- Device loss -----

    /// The backend dropped every object. Handles are forgotten; logical
    /// state survives for [`device_restore`](Self::device_restore).
    pub fn device_lost(&mut self) {
        log(LogCategory::Draw, LogLevel::Warn, || {
            "Device lost; discarding pending draws".to_string()
        });
        self.device_lost = true;
        if self.draw.has_pending() {
            self.stats.dropped_batches += 1;
        }
        self.draw.device_lost();
        self.framebuffers.device_lost();
        self.presentation.device_lost();
        self.gstate.mark_all_dirty();
    }

    /// Recreate backend objects. Returns false if the device is still lost or
    /// something could not be recreated. Calling it again is harmless.
    pub fn device_restore(&mut self) -> bool {
        if self.ctx.is_device_lost() {
            return false;
        }
        self.ctx.invalidate_cached_state();
        let mut ok = self
            .framebuffers
            .device_restore(&mut self.ctx, &mut self.stats);
        ok &= self.presentation.device_restore(&mut self.ctx);
        if self.device_lost {
            self.gstate.mark_all_dirty();
            self.device_lost = false;
        }
        ok
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost
    }

    /// Power-on state: registers, lists and pending draws are dropped.
    pub fn reset_gpu(&mut self) {
        self.draw.discard();
        self.gstate.reset();
        self.lists.clear();
        self.pc = 0;
        self.downcount = 0;
        self.current_list = None;
        self.prev_prim = GePrimitive::Triangles;
    }
}

impl<D: DrawContext> System for PspGpu<D> {
    type Error = GpuError;

    fn reset(&mut self) {
        self.reset_gpu();
    }

    fn step_frame(&mut self) -> Result<Frame, GpuError> {
        self.process_dl_queue();
        self.copy_display_to_output();
        let (width, height) = self.ctx.backbuffer_size();
        let pixels = self.ctx.read_framebuffer(
            None,
            crate::backend::FbChannel::Color,
            0,
            0,
            width,
            height,
        )?;
        Ok(Frame {
            width,
            height,
            pixels,
        })
    }

    fn save_state(&self) -> Value {
        crate::savestate::save(self)
    }

    fn load_state(&mut self, v: &Value) -> Result<(), GpuError> {
        crate::savestate::load(self, v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{DrawCall, HeadlessDrawContext};
    use crate::memory::RAM_BASE;
    use std::cell::RefCell;
    use std::rc::Rc;

    const LIST: u32 = RAM_BASE + 0x1000;

    fn gpu() -> PspGpu<HeadlessDrawContext> {
        PspGpu::with_backend(HeadlessDrawContext::new(480, 272))
    }

    fn write_list(gpu: &mut PspGpu<HeadlessDrawContext>, words: &[u32]) {
        gpu.memory_mut().write_words(LIST, words).unwrap();
    }

    fn finish_end() -> [u32; 2] {
        [word(GE_CMD_FINISH, 0), word(GE_CMD_END, 0)]
    }

    #[test]
    fn test_list_runs_to_completion() {
        let mut gpu = gpu();
        let mut words = vec![
            word(GE_CMD_FOGCOLOR, 0x123456),
            word(GE_CMD_ZTEST, 4),
        ];
        words.extend(finish_end());
        write_list(&mut gpu, &words);

        let id = gpu.enqueue_list(LIST, 0).unwrap();
        assert!(gpu.lists().is_empty());
        assert_eq!(gpu.list_sync(id).unwrap(), ListState::Completed);
        assert_eq!(gpu.state().data(GE_CMD_FOGCOLOR), 0x123456);
        assert_eq!(gpu.state().data(GE_CMD_ZTEST), 4);
        assert_eq!(gpu.stats().lists_completed, 1);
    }

    #[test]
    fn test_execute_op_raises_dirty_on_change_only() {
        let mut gpu = gpu();
        gpu.state_mut().clear_dirty(DirtyFlags::all());
        gpu.execute_word(word(GE_CMD_FOGCOLOR, 0));
        assert_eq!(gpu.state().dirty(), DirtyFlags::empty());
        gpu.execute_word(word(GE_CMD_FOGCOLOR, 0xFF));
        assert_eq!(gpu.state().dirty(), DirtyFlags::FOGCOLOR);
    }

    #[test]
    fn test_unknown_opcode_is_skipped() {
        let mut gpu = gpu();
        let mut words = vec![0x0300_1234];
        for i in 0..10 {
            words.push(word(GE_CMD_MORPHWEIGHT0 + (i % 8) as u8, 0x3F8000 + i));
        }
        words.extend(finish_end());
        write_list(&mut gpu, &words);
        gpu.enqueue_list(LIST, 0).unwrap();

        assert_eq!(gpu.stats().unknown_opcodes, 1);
        assert_eq!(gpu.state().cmdmem[0x03], 0x0300_0000);
        assert_eq!(gpu.state().data(GE_CMD_MORPHWEIGHT0 + 1), 0x3F8009);
        assert_eq!(gpu.stats().commands, 12);
    }

    #[test]
    fn test_stall_and_update_stall() {
        let mut gpu = gpu();
        let mut words = vec![word(GE_CMD_FOGCOLOR, 1), word(GE_CMD_FOGCOLOR, 2)];
        words.extend(finish_end());
        write_list(&mut gpu, &words);

        let id = gpu.enqueue_list(LIST, LIST + 4).unwrap();
        let list = gpu.lists().get(id).unwrap();
        assert_eq!(list.state, ListState::Stalled);
        assert_eq!(list.pc, LIST + 4);
        assert_eq!(gpu.state().data(GE_CMD_FOGCOLOR), 1);

        gpu.update_stall(id, LIST + 16).unwrap();
        assert!(gpu.lists().is_empty());
        assert_eq!(gpu.state().data(GE_CMD_FOGCOLOR), 2);
    }

    #[test]
    fn test_call_and_ret() {
        let mut gpu = gpu();
        let sub = LIST + 0x100;
        let mut words = vec![
            word(GE_CMD_BASE, (sub >> 8) & 0x0F_0000),
            word(GE_CMD_CALL, sub & 0xFF_FFFF),
            word(GE_CMD_ZTEST, 3),
        ];
        words.extend(finish_end());
        write_list(&mut gpu, &words);
        gpu.memory_mut()
            .write_words(sub, &[word(GE_CMD_FOGCOLOR, 7), word(GE_CMD_RET, 0)])
            .unwrap();

        gpu.enqueue_list(LIST, 0).unwrap();
        assert_eq!(gpu.state().data(GE_CMD_FOGCOLOR), 7);
        assert_eq!(gpu.state().data(GE_CMD_ZTEST), 3);
        assert_eq!(gpu.stats().lists_completed, 1);
    }

    #[test]
    fn test_pause_signal_and_continue() {
        let mut gpu = gpu();
        let mut words = vec![
            word(GE_CMD_SIGNAL, 0x03_0000),
            word(GE_CMD_END, 0),
            word(GE_CMD_FOGCOLOR, 9),
        ];
        words.extend(finish_end());
        write_list(&mut gpu, &words);

        let id = gpu.enqueue_list(LIST, 0).unwrap();
        assert_eq!(gpu.lists().get(id).map(|l| l.state), Some(ListState::Paused));
        assert_eq!(gpu.state().data(GE_CMD_FOGCOLOR), 0);

        assert!(gpu.continue_list());
        assert!(gpu.lists().is_empty());
        assert_eq!(gpu.state().data(GE_CMD_FOGCOLOR), 9);
        assert!(!gpu.continue_list());
    }

    #[test]
    fn test_hook_sees_every_word() {
        let mut gpu = gpu();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        gpu.set_command_hook(Box::new(move |t: &CommandTrace| sink.borrow_mut().push(t.op)));

        let mut words = vec![word(GE_CMD_ZTEST, 2)];
        words.extend(finish_end());
        write_list(&mut gpu, &words);
        gpu.enqueue_list(LIST, 0).unwrap();

        assert_eq!(*seen.borrow(), words);
    }

    #[test]
    fn test_queue_full_and_bad_address() {
        let mut gpu = gpu();
        assert!(matches!(
            gpu.enqueue_list(0x0100_0000, 0),
            Err(GpuError::InvalidListAddress(_))
        ));
        write_list(&mut gpu, &[word(GE_CMD_NOP, 0)]);
        for _ in 0..gpu.lists().capacity() {
            gpu.enqueue_list(LIST, LIST).unwrap();
        }
        assert!(matches!(
            gpu.enqueue_list(LIST, LIST),
            Err(GpuError::ListQueueFull(_))
        ));
    }

    #[test]
    fn test_present_marks_state_dirty() {
        let mut gpu = gpu();
        gpu.state_mut().clear_dirty(DirtyFlags::all());
        gpu.set_display_framebuffer(0x0400_0000, 512, PixelFormat::Rgba8888);
        gpu.copy_display_to_output();
        assert!(gpu.state().dirty().contains(PRESENT_DIRTY));
        assert_eq!(gpu.stats().frames, 1);
        assert!(gpu
            .backend()
            .calls()
            .iter()
            .any(|c| matches!(c, DrawCall::DrawIndexed { .. })));
    }

    #[test]
    fn test_device_lost_then_restore() {
        let mut gpu = gpu();
        gpu.backend_mut().lose_device();
        gpu.copy_display_to_output();
        assert!(gpu.is_device_lost());
        assert!(!gpu.device_restore());

        gpu.backend_mut().restore_device();
        assert!(gpu.device_restore());
        assert!(gpu.device_restore());
        assert!(!gpu.is_device_lost());
        assert_eq!(gpu.state().dirty(), DirtyFlags::all());
    }
}
