//! `gemmini` — command-line interface for the GemminiDevA accelerator.
//!
//! ```text
//! USAGE:
//!   gemmini opcodes                       List operation kinds
//!   gemmini regs                          Print the register map
//!   gemmini plan <opcode> <m> [-k K]      Show buffer sizes for a request
//!   gemmini run [opcode] [-m M] [-k K]    Submit one request and print the output
//! ```
//!
//! `run` fills every input with 1, 2, 3, … and prints the output as a
//! matrix. `--backend mmio` drives the real device through `/dev/mem`
//! (root, gem5 full-system guest); the default software backend only
//! exercises the submission path and leaves the output zeroed.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gemmini_driver::backends::{self, CompletionMode, SoftwareDevice};
use gemmini_driver::{ioctl, platform, regs, DeviceSession, DriverConfig, Opcode, ProcessMemory, Request};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gemmini", about = "GemminiDevA accelerator CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List the operation kinds with their ordinals.
    Opcodes,
    /// Print the register block layout.
    Regs,
    /// Show the buffer sizes a request would use.
    Plan {
        /// Operation (e.g. mm, conv2d-gemm, maxpool).
        opcode: Opcode,
        /// M size parameter.
        m_size: u32,
        /// K size parameter.
        #[arg(short, long, default_value_t = 0)]
        k_size: u32,
    },
    /// Submit one request and print the result.
    Run(RunArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// Simulated device (no hardware)
    Software,
    /// Physical registers and DMA carve-out through /dev/mem
    Mmio,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Operation.
    #[arg(default_value = "mm")]
    opcode: Opcode,
    /// M size parameter.
    #[arg(short, long, default_value_t = 2)]
    m_size: u32,
    /// K size parameter.
    #[arg(short, long, default_value_t = 0)]
    k_size: u32,
    /// Device backend.
    #[arg(short, long, value_enum, default_value_t = Backend::Software)]
    backend: Backend,
    /// Physical base of the register window (overrides GEMMINI_MMIO_BASE).
    #[arg(long, value_parser = parse_addr)]
    mmio_base: Option<u64>,
    /// Physical base of the DMA carve-out (overrides GEMMINI_DMA_BASE).
    #[arg(long, value_parser = parse_addr)]
    dma_base: Option<u64>,
    /// Size of the DMA carve-out (overrides GEMMINI_DMA_SIZE).
    #[arg(long, value_parser = parse_addr)]
    dma_size: Option<u64>,
    /// Completion timeout in milliseconds (overrides GEMMINI_TIMEOUT_MS).
    #[arg(long)]
    timeout_ms: Option<u64>,
}

fn parse_addr(s: &str) -> std::result::Result<u64, String> {
    let v = s.replace('_', "");
    match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => v.parse(),
    }
    .map_err(|e| format!("{s}: {e}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Opcodes => cmd_opcodes(),
        Cmd::Regs => cmd_regs(),
        Cmd::Plan {
            opcode,
            m_size,
            k_size,
        } => cmd_plan(opcode, m_size, k_size)?,
        Cmd::Run(args) => cmd_run(&args)?,
    }

    Ok(())
}

fn cmd_opcodes() {
    println!("{:<4} {:<14} k_size", "ord", "name");
    for op in Opcode::ALL {
        let k = if op.requires_k_size() { "required" } else { "-" };
        println!("{:<4} {:<14} {k}", op.ordinal(), op.name());
    }
}

fn cmd_regs() {
    for (i, name) in regs::NAMES.iter().enumerate() {
        println!("{:#06x}  {name}", i * regs::REGISTER_WIDTH);
    }
    println!();
    println!("RUN ioctl     : {:#010x}", ioctl::RUN);
    println!("Request size  : {} bytes", ioctl::REQUEST_SIZE);
    println!("DT compatible : {}", platform::DT_COMPATIBLE);
    println!("Device node   : /dev/{}", platform::DEVICE_NAME);
    println!(
        "MMIO default  : {:#x} + {:#x}",
        platform::DEFAULT_MMIO_BASE,
        platform::DEFAULT_MMIO_SIZE
    );
}

fn cmd_plan(opcode: Opcode, m_size: u32, k_size: u32) -> Result<()> {
    let plan = gemmini_driver::plan(opcode, m_size, k_size)
        .with_context(|| format!("{opcode} m={m_size} k={k_size}"))?;
    println!("{opcode} m_size={m_size} k_size={k_size}");
    println!("  m : {:>12} bytes", plan.m_bytes());
    if plan.has_k() {
        println!("  k : {:>12} bytes", plan.k_bytes());
    } else {
        println!("  k : {:>12}", "-");
    }
    println!("  o : {:>12} bytes", plan.o_bytes());
    println!("  Σ : {:>12} bytes", plan.total_bytes());
    Ok(())
}

fn config_for(args: &RunArgs) -> Result<DriverConfig> {
    let mut cfg = DriverConfig::from_env().context("reading GEMMINI_* environment")?;
    if let Some(base) = args.mmio_base {
        let mmio_size = cfg.mmio_size;
        cfg = cfg.with_mmio(base, mmio_size);
    }
    if args.dma_base.is_some() || args.dma_size.is_some() {
        let dma_base = args.dma_base.unwrap_or(cfg.dma_base);
        let dma_size = args.dma_size.unwrap_or(cfg.dma_size);
        cfg = cfg.with_dma_window(dma_base, dma_size);
    }
    if let Some(ms) = args.timeout_ms {
        cfg = cfg.with_timeout(Duration::from_millis(ms));
    }
    cfg.validate()?;
    Ok(cfg)
}

fn open(backend: Backend, cfg: DriverConfig) -> Result<DeviceSession> {
    Ok(match backend {
        Backend::Software => SoftwareDevice::new(CompletionMode::Immediate).session(cfg),
        Backend::Mmio => backends::open_physical(cfg).context("opening GemminiDevA through /dev/mem")?,
    })
}

#[allow(clippy::cast_precision_loss)]
fn sequence(bytes: usize) -> Vec<f32> {
    (0..bytes / 4).map(|i| (i + 1) as f32).collect()
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let plan = gemmini_driver::plan(args.opcode, args.m_size, args.k_size)?;
    let cfg = config_for(args)?;
    let session = Arc::new(open(args.backend, cfg)?);
    let handle = session.open();

    let m = sequence(plan.m_bytes());
    let k = sequence(plan.k_bytes());
    let mut o = vec![0f32; plan.o_bytes() / 4];

    let req = Request::new(args.opcode, args.m_size, args.k_size).with_operands(
        m.as_ptr() as u64,
        if plan.has_k() { k.as_ptr() as u64 } else { 0 },
        o.as_mut_ptr() as u64,
    );
    let raw = req.to_raw();

    let done = handle
        .ioctl(ioctl::RUN, std::ptr::addr_of!(raw) as u64, &ProcessMemory::new())
        .with_context(|| format!("{} m={} k={}", args.opcode, args.m_size, args.k_size))?;
    tracing::info!("Completed after {} polls in {:?}", done.polls, done.device_time);

    if matches!(args.backend, Backend::Software) {
        eprintln!("note: the software backend does not compute; output is zeroed");
    }
    println!("GemminiDevA {} result (m_size={}):", args.opcode, args.m_size);
    print_matrix(&o)?;
    Ok(())
}

fn print_matrix(values: &[f32]) -> Result<()> {
    if values.is_empty() {
        bail!("empty output");
    }
    let side = (1..=values.len())
        .find(|s| s * s >= values.len())
        .filter(|s| s * s == values.len())
        .unwrap_or(values.len());
    for row in values.chunks(side) {
        let line: Vec<String> = row.iter().map(|v| format!("{v:6.1}")).collect();
        println!("{}", line.join(" "));
    }
    Ok(())
}
