#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pm4_dump::{
    disassemble, format_registers, optimize, replay, words_from_bytes, words_to_bytes, DumpConfig,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "pm4-dump",
    about = "Disassemble, compact and replay a dumped PM4 command block."
)]
struct Args {
    /// Command block as raw little-endian dwords.
    input: PathBuf,

    /// Run the redundant register write pass over the block and print the result.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    optimize: bool,

    /// Write the (optimized) block to this path.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// JSON file with the register table and user-data table.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Execute the block and print the final register values.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    replay: bool,

    /// GPU VA the block is assumed to live at when replaying.
    #[arg(long, value_name = "VA", default_value_t = 0x1000)]
    va: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => DumpConfig::load(path)?,
        None => DumpConfig::default(),
    };

    let bytes = std::fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let mut words = words_from_bytes(&bytes)?;

    if args.optimize {
        let before = words.len();
        words = optimize(&words, config.registers.clone())?;
        info!(before, after = words.len(), "optimized block");
        println!(
            "; {before} -> {} words ({} saved)",
            words.len(),
            before - words.len()
        );
    }

    print!("{}", disassemble(&words)?);

    if args.replay {
        let regs = replay(&words, args.va, &config.user_data)?;
        println!("; final register state");
        print!("{}", format_registers(&regs));
    }

    if let Some(path) = &args.output {
        std::fs::write(path, words_to_bytes(&words))
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}
