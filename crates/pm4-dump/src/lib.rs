#![forbid(unsafe_code)]

//! Inspect dumped PM4 command blocks: disassemble, compact and replay them.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use pm4_protocol::PacketIter;
use pm4_stream::{RegisterFile, RegisterTable, RegisterWriteOptimizer, ReplayMemory, Replayer};
use serde::Deserialize;
use tracing::debug;

/// Optional `--config` file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    pub registers: RegisterTable,
    /// Indirect user-data table read by `SET_SH_REG_OFFSET` during replay.
    pub user_data: Vec<u32>,
}

impl DumpConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

/// Split a little-endian dump into command words.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        bail!("dump is {} bytes, not a whole number of dwords", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// One line (or block of lines) per packet.
pub fn disassemble(words: &[u32]) -> Result<String> {
    let mut out = String::new();
    for packet in PacketIter::new(words) {
        let packet = packet.context("failed to decode command block")?;
        writeln!(out, "{packet}")?;
    }
    Ok(out)
}

/// Run the whole-block optimizer over `words` and return the compacted block.
pub fn optimize(words: &[u32], registers: RegisterTable) -> Result<Vec<u32>> {
    // The optimizer treats malformed input as fatal, so reject it up front.
    for packet in PacketIter::new(words) {
        packet.context("failed to decode command block")?;
    }
    let mut optimizer = RegisterWriteOptimizer::new(Arc::new(registers));
    let mut block = words.to_vec();
    let len = optimizer.optimize_in_place(&mut block);
    block.truncate(len);
    let stats = optimizer.stats();
    debug!(
        packets_in = stats.packets_in,
        packets_out = stats.packets_out,
        regs_elided = stats.regs_elided,
        "optimized dump"
    );
    Ok(block)
}

/// Execute the block as if it were mapped at `va` and return the final register state.
pub fn replay(words: &[u32], va: u64, user_data: &[u32]) -> Result<RegisterFile> {
    let mut memory = ReplayMemory::new();
    memory.add_buffer(va, words.to_vec());
    let mut regs = RegisterFile::new();
    Replayer::new(&memory)
        .with_user_data(user_data)
        .execute(&mut regs, va, words.len())
        .context("replay failed")?;
    Ok(regs)
}

pub fn format_registers(regs: &RegisterFile) -> String {
    let mut out = String::new();
    for (reg, value) in regs.iter() {
        // Writing to a String cannot fail.
        let _ = writeln!(out, "0x{reg:04x} = 0x{value:08x}");
    }
    out
}
