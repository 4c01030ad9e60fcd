use anyhow::{bail, Context, Result};
use clap::Parser;
use emu_core::graphics::PixelFormat;
use emu_core::logging::{LogConfig, LogLevel};
use emu_core::System;
use emu_psp::debug::DebugInfo;
use emu_psp::display_list::ListState;
use emu_psp::memory::{GuestMemory, RAM_BASE, VRAM_BASE};
use emu_psp::{CommandTable, Config, HeadlessDrawContext, PspGpu};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

/// Replay a GE display-list dump on the headless backend.
#[derive(Parser)]
#[command(name = "ge-replay")]
struct Args {
    /// Raw little-endian command words
    dump: PathBuf,

    /// Guest address the dump is loaded at and executed from
    #[arg(long, default_value = "0x08100000", value_parser = parse_addr)]
    load_addr: u32,

    /// Displayed framebuffer address (defaults to the start of VRAM)
    #[arg(long, value_parser = parse_addr)]
    display_addr: Option<u32>,

    /// JSON configuration (GPU and presentation settings)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dump save-state to this file as JSON
    #[arg(long)]
    save: Option<PathBuf>,

    /// Frames to present after the list completes
    #[arg(long, default_value_t = 1)]
    frames: u32,

    /// Host surface size
    #[arg(long, default_value_t = 480)]
    width: u32,
    #[arg(long, default_value_t = 272)]
    height: u32,

    /// Print every executed command word
    #[arg(long, default_value_t = false)]
    trace: bool,

    /// Core log level: off, error, warn, info, debug, trace
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn parse_addr(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

fn print_debug(info: &DebugInfo) {
    println!(
        "pc {:08x} | lists queued {} | pending draws {} | framebuffers {} | backend {}",
        info.pc, info.queued_lists, info.pending_draws, info.framebuffer_count, info.backend
    );
    if !info.post_shaders.is_empty() {
        println!("post shaders: {}", info.post_shaders.join(" -> "));
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let Some(level) = LogLevel::from_str(&args.log_level) else {
        bail!("Unknown log level: {}", args.log_level);
    };
    LogConfig::global().set_global_level(level);

    let config = match args.config.as_ref() {
        Some(path) => Config::load_from_path(path),
        None => Config::default(),
    };

    let bytes = std::fs::read(&args.dump)
        .with_context(|| format!("reading {}", args.dump.display()))?;
    if bytes.len() % 4 != 0 {
        log::warn!(
            "Dump is {} bytes; trailing {} bytes ignored",
            bytes.len(),
            bytes.len() % 4
        );
    }
    if args.load_addr < RAM_BASE {
        log::warn!("Load address {:08x} is below main RAM", args.load_addr);
    }
    let mut mem = GuestMemory::new();
    mem.write_bytes(args.load_addr, &bytes[..bytes.len() & !3])
        .context("dump does not fit in guest memory")?;
    log::info!(
        "Loaded {} command words at {:08x}",
        bytes.len() / 4,
        args.load_addr
    );

    let ctx = HeadlessDrawContext::new(args.width, args.height);
    let mut gpu = PspGpu::new(CommandTable::new(), ctx, mem, config);
    if let Some(err) = gpu.presentation_error() {
        log::warn!("{}", err);
    }
    if args.trace {
        let names = CommandTable::<HeadlessDrawContext>::new();
        gpu.set_command_hook(Box::new(move |t| {
            let op = (t.op >> 24) as u8;
            println!("{:08x}: {:08x} {}", t.pc, t.op, names.name(op));
        }));
    }
    gpu.set_display_framebuffer(
        args.display_addr.unwrap_or(VRAM_BASE),
        512,
        PixelFormat::Rgba8888,
    );

    let id = gpu.enqueue_list(args.load_addr, 0)?;
    match gpu.list_sync(id)? {
        ListState::Completed => log::info!("List {} completed", id),
        state => log::warn!("List {} stopped in state {:?}", id, state),
    }

    for n in 1..=args.frames {
        let frame = gpu.step_frame()?;
        let lit = frame.pixels.iter().filter(|&&p| p & 0x00FF_FFFF != 0).count();
        println!(
            "Frame {}: {}x{}, {} non-black pixels",
            n, frame.width, frame.height, lit
        );
    }
    print_debug(&gpu.get_debug_info());

    if let Some(path) = args.save.as_ref() {
        let state = gpu.save_state();
        let mut f = File::create(path)?;
        write!(f, "{}", serde_json::to_string_pretty(&state)?)?;
        log::info!("Save state written to {}", path.display());
    }

    println!("{}", serde_json::to_string_pretty(gpu.stats())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addr() {
        assert_eq!(parse_addr("0x08100000"), Ok(0x0810_0000));
        assert_eq!(parse_addr("4096"), Ok(4096));
        assert!(parse_addr("0xzz").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["ge-replay", "dump.bin", "--frames", "3", "--trace"]).unwrap();
        assert_eq!(args.frames, 3);
        assert!(args.trace);
        assert_eq!(args.load_addr, 0x0810_0000);
    }
}
