//! midsched - VLIW bundle scheduler for Midgard-style shaders
//!
//! Reads an instruction-selected program from JSON or TOML, schedules it into
//! bundles and prints the result.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};

use ms_core::{logging, Config, MidschedError};
use ms_sched::{schedule_program, AllocationStatus, PressureAllocator, Program};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "midsched", version, about = "Schedule shader programs into VLIW bundles")]
struct Args {
    /// Program to schedule (.json or .toml)
    input: PathBuf,

    /// Configuration file; defaults to the user configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Work registers available to the allocator
    #[arg(long)]
    work_registers: Option<u32>,

    /// Scheduler lookback window
    #[arg(long)]
    lookback: Option<usize>,

    /// Also print the unscheduled program, including spill code
    #[arg(long)]
    print_program: bool,
}

fn load_program(path: &Path) -> Result<Program> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let program: Program = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&text).map_err(|e| MidschedError::Parse(e.to_string()))?,
        _ => serde_json::from_str(&text).map_err(|e| MidschedError::Parse(e.to_string()))?,
    };

    program.validate().map_err(MidschedError::from)?;
    Ok(program)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => Config::load_from(path).map_err(anyhow::Error::from),
        None => Config::load().map_err(anyhow::Error::from),
    };

    let (mut config, config_error) = match loaded {
        Ok(config) => (config, None),
        Err(e) if args.config.is_none() => (Config::default(), Some(e)),
        Err(e) => return Err(e.context("Failed to load configuration")),
    };

    logging::init(config.debug.log_level);

    if let Some(e) = config_error {
        tracing::warn!("Using default configuration: {}", e);
    }

    if let Some(registers) = args.work_registers {
        config.registers.work_registers = registers;
    }
    if let Some(lookback) = args.lookback {
        config.scheduler.lookback_window = lookback;
    }
    config.debug.print_program |= args.print_program;

    let program = load_program(&args.input)
        .with_context(|| format!("Invalid program {}", args.input.display()))?;

    tracing::info!(
        "Scheduling {} ({} blocks, {} work registers)",
        args.input.display(),
        program.blocks.len(),
        config.registers.work_registers
    );

    let mut allocator = PressureAllocator::new(config.registers.work_registers);
    let compiled = schedule_program(&program, &config.scheduler, &mut allocator);

    let status = match &compiled.status {
        AllocationStatus::Allocated => "allocated".to_string(),
        AllocationStatus::Degraded(e) => format!("degraded: {}", e),
    };

    match args.format {
        Format::Json => {
            let mut output = serde_json::json!({
                "status": status,
                "stats": compiled.stats,
                "scheduled": compiled.scheduled,
            });
            if config.debug.print_program {
                output["program"] = serde_json::to_value(&compiled.program)?;
            }
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Format::Text => {
            if config.debug.print_program {
                println!("{}", compiled.program);
            }
            if config.debug.print_bundles {
                print!("{}", compiled.scheduled);
            }
            println!(
                "{} bundles, {} quadwords, {} spills, {} fills, {} bytes TLS ({})",
                compiled.scheduled.bundle_count(),
                compiled.scheduled.quadword_count,
                compiled.stats.spills,
                compiled.stats.fills,
                compiled.stats.tls_size,
                status
            );
        }
    }

    Ok(())
}
