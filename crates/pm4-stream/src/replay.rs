//! Software model of the command processor's register effects.
//!
//! [`Replayer`] walks recorded command memory the way the hardware would (following chained and
//! called indirect buffers, evaluating conditional branches) and applies every register write to
//! a [`RegisterFile`]. Two streams are equivalent when they leave identical register files.

use std::collections::BTreeMap;

use pm4_protocol::packet::{
    COND_IB_COMPARE_HI, COND_IB_COMPARE_LO, COND_IB_IB1_BASE, COND_IB_IB1_SIZE, COND_IB_IB2_BASE,
    COND_IB_IB2_SIZE, COND_IB_IMM_CHAIN, COND_IB_IMM_FUNC_MASK, COND_IB_MASK_HI, COND_IB_MASK_LO,
    COND_IB_REFERENCE_HI, COND_IB_REFERENCE_LO, COPY_DATA_COUNT_64, COPY_DATA_DST_SEL_MASK,
    COPY_DATA_SRC_SEL_MASK, COPY_DATA_SRC_SEL_SHIFT,
};
use pm4_protocol::{CompareFunc, CopyDataDst, CopyDataSrc, Opcode, Packet, PacketIter};
use tracing::trace;

use crate::chunk::CmdAllocator;
use crate::cmd_stream::CmdStream;
use crate::error::ReplayError;

pub const DEFAULT_MAX_IB_DEPTH: usize = 8;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterFile {
    regs: BTreeMap<u32, u32>,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reg: u32) -> Option<u32> {
        self.regs.get(&reg).copied()
    }

    pub fn set(&mut self, reg: u32, value: u32) {
        self.regs.insert(reg, value);
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.regs.iter().map(|(&r, &v)| (r, v))
    }
}

/// GPU memory visible to the replayer, keyed by VA.
#[derive(Clone, Debug, Default)]
pub struct ReplayMemory {
    buffers: BTreeMap<u64, Vec<u32>>,
}

impl ReplayMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_buffer(&mut self, va: u64, words: Vec<u32>) {
        self.buffers.insert(va, words);
    }

    /// Map the recorded part of every chunk of `stream`.
    pub fn add_stream<A: CmdAllocator>(&mut self, stream: &CmdStream<A>) {
        for chunk in stream.chunks() {
            self.add_buffer(chunk.va(), chunk.words().to_vec());
        }
    }

    /// Store a 64-bit value, e.g. a predicate read by a conditional branch.
    pub fn write_u64(&mut self, va: u64, value: u64) {
        self.add_buffer(va, vec![value as u32, (value >> 32) as u32]);
    }

    pub fn words(&self, va: u64, size_words: usize) -> Result<&[u32], ReplayError> {
        let unmapped = ReplayError::UnmappedAddress { va, size_words };
        if va & 0x3 != 0 {
            return Err(unmapped);
        }
        let Some((&base, buf)) = self.buffers.range(..=va).next_back() else {
            return Err(unmapped);
        };
        let start = ((va - base) / 4) as usize;
        buf.get(start..start + size_words).ok_or(unmapped)
    }

    pub fn read_u32(&self, va: u64) -> Result<u32, ReplayError> {
        Ok(self.words(va, 1)?[0])
    }

    pub fn read_u64(&self, va: u64) -> Result<u64, ReplayError> {
        let w = self.words(va, 2)?;
        Ok(u64::from(w[0]) | (u64::from(w[1]) << 32))
    }
}

/// Destination of a control-flow packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Branch {
    va: u64,
    size_words: usize,
    chain: bool,
}

fn join_u64(lo: u32, hi: u32) -> u64 {
    u64::from(lo) | (u64::from(hi) << 32)
}

pub struct Replayer<'a> {
    memory: &'a ReplayMemory,
    user_data: &'a [u32],
    max_depth: usize,
}

impl<'a> Replayer<'a> {
    pub fn new(memory: &'a ReplayMemory) -> Self {
        Self {
            memory,
            user_data: &[],
            max_depth: DEFAULT_MAX_IB_DEPTH,
        }
    }

    /// Table read by `SET_SH_REG_OFFSET`.
    pub fn with_user_data(mut self, table: &'a [u32]) -> Self {
        self.user_data = table;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Execute the buffer at `va` as a top-level submission.
    pub fn execute(&self, regs: &mut RegisterFile, va: u64, size_words: usize) -> Result<(), ReplayError> {
        self.run(regs, va, size_words, 0)
    }

    /// Execute an ended stream the way it would be submitted.
    pub fn execute_stream<A: CmdAllocator>(
        &self,
        regs: &mut RegisterFile,
        stream: &CmdStream<A>,
    ) -> Result<(), ReplayError> {
        let chunks = stream.chunks();
        if stream.config().chain_size_words() > 0 {
            if let Some(first) = chunks.first() {
                self.execute(regs, first.va(), first.used())?;
            }
        } else {
            for chunk in chunks {
                self.execute(regs, chunk.va(), chunk.used())?;
            }
        }
        Ok(())
    }

    fn run(
        &self,
        regs: &mut RegisterFile,
        mut va: u64,
        mut size_words: usize,
        depth: usize,
    ) -> Result<(), ReplayError> {
        if depth > self.max_depth {
            return Err(ReplayError::NestingTooDeep {
                max_depth: self.max_depth,
            });
        }

        loop {
            trace!(va, size_words, depth, "replaying buffer");
            let words = self.memory.words(va, size_words)?;
            let mut chained = None;

            for packet in PacketIter::new(words) {
                let packet = packet.map_err(|source| ReplayError::Decode { va, source })?;
                let packet_va = va + packet.offset as u64 * 4;
                let Some(branch) = self.apply(regs, &packet, packet_va)? else {
                    continue;
                };
                if branch.chain {
                    chained = Some(branch);
                    break;
                }
                self.run(regs, branch.va, branch.size_words, depth + 1)?;
            }

            match chained {
                Some(next) => {
                    va = next.va;
                    size_words = next.size_words;
                }
                None => return Ok(()),
            }
        }
    }

    /// Apply one packet. Returns the branch target for control-flow packets.
    fn apply(
        &self,
        regs: &mut RegisterFile,
        packet: &Packet<'_>,
        packet_va: u64,
    ) -> Result<Option<Branch>, ReplayError> {
        let imm = packet.header.imm;
        let body = packet.body;
        match packet.opcode {
            Opcode::Nop => {}
            Opcode::SetConfigReg | Opcode::SetContextReg | Opcode::SetShReg | Opcode::SetUconfigReg => {
                let first = packet.first_reg().unwrap_or(0);
                for (i, &value) in body.iter().enumerate() {
                    regs.set(first + i as u32, value);
                }
            }
            Opcode::ContextRegRmw => {
                let reg = packet.first_reg().unwrap_or(0);
                let (mask, data) = (body[0], body[1]);
                let old = regs.get(reg).unwrap_or(0);
                regs.set(reg, (old & !mask) | (data & mask));
            }
            Opcode::SetShRegOffset => {
                let offset = body[0];
                let value = *self
                    .user_data
                    .get(offset as usize)
                    .ok_or(ReplayError::UserDataOutOfRange { offset })?;
                regs.set(packet.first_reg().unwrap_or(0), value);
            }
            Opcode::CopyData => {
                let src_sel = ((imm & COPY_DATA_SRC_SEL_MASK) >> COPY_DATA_SRC_SEL_SHIFT) as u8;
                let dst_sel = (imm & COPY_DATA_DST_SEL_MASK) as u8;
                let count_64 = imm & COPY_DATA_COUNT_64 != 0;
                let src = join_u64(body[0], body[1]);
                let value = match CopyDataSrc::from_u8(src_sel) {
                    Some(CopyDataSrc::Immediate) => src,
                    Some(CopyDataSrc::Register) => u64::from(regs.get(src as u32).unwrap_or(0)),
                    Some(CopyDataSrc::Memory) if count_64 => self.memory.read_u64(src)?,
                    Some(CopyDataSrc::Memory) => u64::from(self.memory.read_u32(src)?),
                    None => return Ok(None),
                };
                if matches!(
                    CopyDataDst::from_u8(dst_sel),
                    Some(CopyDataDst::Register | CopyDataDst::SysPerfCounter)
                ) {
                    let dst = body[2];
                    regs.set(dst, value as u32);
                    if count_64 {
                        regs.set(dst + 1, (value >> 32) as u32);
                    }
                }
            }
            Opcode::IndirectBuffer | Opcode::IndirectBufferConst => {
                if let Some((va, size, chain)) = packet.indirect_buffer_target() {
                    return Ok(Some(Branch {
                        va,
                        size_words: size as usize,
                        chain,
                    }));
                }
            }
            Opcode::CondIndirectBuffer | Opcode::CondIndirectBufferConst => {
                let func = CompareFunc::from_u8((imm & COND_IB_IMM_FUNC_MASK) as u8);
                let compare_va = join_u64(body[COND_IB_COMPARE_LO], body[COND_IB_COMPARE_HI]);
                let reference = join_u64(body[COND_IB_REFERENCE_LO], body[COND_IB_REFERENCE_HI]);
                let mask = join_u64(body[COND_IB_MASK_LO], body[COND_IB_MASK_HI]);
                let value = self.memory.read_u64(compare_va)? & mask;

                let (base, size) = if func.evaluate(value, reference) {
                    (body[COND_IB_IB1_BASE], body[COND_IB_IB1_SIZE])
                } else {
                    (body[COND_IB_IB2_BASE], body[COND_IB_IB2_SIZE])
                };
                if size == 0 {
                    return Err(ReplayError::UnresolvedBranch { va: packet_va });
                }
                return Ok(Some(Branch {
                    va: u64::from(base) << 2,
                    size_words: size as usize,
                    chain: imm & COND_IB_IMM_CHAIN != 0,
                }));
            }
        }
        Ok(None)
    }
}
