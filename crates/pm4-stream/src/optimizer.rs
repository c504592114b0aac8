//! Redundant register write elimination.
//!
//! [`RegisterWriteOptimizer`] shadows the context and SH register spaces. A write is kept when
//! the register's value is unknown, differs from the shadow, or the register has write side
//! effects; otherwise it is dropped. Sequential writes are split into the smallest set of
//! packets covering only the kept registers.

use std::sync::Arc;

use pm4_protocol::packet::{COND_IB_IMM_CHAIN, COPY_DATA_COUNT_64, COPY_DATA_DST_SEL_MASK};
use pm4_protocol::{
    build_set_sh_reg_data_offset, decode_packet, set_seq_header, CopyDataDst, Opcode, Packet,
    RegisterSpace, ShaderType, MAX_PACKET_WORDS,
};
use tracing::{debug, trace};

use crate::registers::RegisterTable;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct RegState {
    value: u32,
    valid: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptimizerStats {
    pub packets_in: u64,
    pub packets_out: u64,
    pub regs_elided: u64,
}

pub struct RegisterWriteOptimizer {
    registers: Arc<RegisterTable>,
    context: Box<[RegState]>,
    sh: Box<[RegState]>,
    stats: OptimizerStats,
}

impl std::fmt::Debug for RegisterWriteOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterWriteOptimizer")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn malformed(err: impl std::fmt::Display) -> ! {
    panic!("malformed command stream: {err}")
}

impl RegisterWriteOptimizer {
    pub fn new(registers: Arc<RegisterTable>) -> Self {
        Self {
            registers,
            context: vec![RegState::default(); RegisterSpace::Context.len()].into_boxed_slice(),
            sh: vec![RegState::default(); RegisterSpace::Sh.len()].into_boxed_slice(),
            stats: OptimizerStats::default(),
        }
    }

    pub fn stats(&self) -> OptimizerStats {
        self.stats
    }

    fn slot(&mut self, space: RegisterSpace, reg: u32) -> Option<&mut RegState> {
        let idx = reg.checked_sub(space.base())? as usize;
        match space {
            RegisterSpace::Context => self.context.get_mut(idx),
            RegisterSpace::Sh => self.sh.get_mut(idx),
            RegisterSpace::Config | RegisterSpace::Uconfig => None,
        }
    }

    /// Core keep/elide decision. Updates the shadow on keep.
    fn must_keep(&mut self, space: RegisterSpace, reg: u32, value: u32) -> bool {
        let non_cacheable = self.registers.is_non_cacheable(reg);
        let Some(slot) = self.slot(space, reg) else {
            return true;
        };
        if non_cacheable {
            slot.valid = false;
            return true;
        }
        if slot.valid && slot.value == value {
            self.stats.regs_elided += 1;
            return false;
        }
        *slot = RegState { value, valid: true };
        true
    }

    fn count_single(&mut self, keep: bool) -> bool {
        self.stats.packets_in += 1;
        if keep {
            self.stats.packets_out += 1;
        }
        keep
    }

    pub fn must_keep_set_context_reg(&mut self, reg: u32, value: u32) -> bool {
        assert!(
            RegisterSpace::Context.contains(reg),
            "0x{reg:x} is not a context register"
        );
        let keep = self.must_keep(RegisterSpace::Context, reg, value);
        self.count_single(keep)
    }

    pub fn must_keep_set_sh_reg(&mut self, reg: u32, value: u32) -> bool {
        assert!(RegisterSpace::Sh.contains(reg), "0x{reg:x} is not an SH register");
        let keep = self.must_keep(RegisterSpace::Sh, reg, value);
        self.count_single(keep)
    }

    /// `reg = (reg & !mask) | (data & mask)` is redundant only if the current value is known and
    /// already satisfies it.
    pub fn must_keep_context_reg_rmw(&mut self, reg: u32, mask: u32, data: u32) -> bool {
        assert!(
            RegisterSpace::Context.contains(reg),
            "0x{reg:x} is not a context register"
        );
        let keep = self.rmw_keep(reg, mask, data);
        self.count_single(keep)
    }

    fn rmw_keep(&mut self, reg: u32, mask: u32, data: u32) -> bool {
        let non_cacheable = self.registers.is_non_cacheable(reg);
        match self.slot(RegisterSpace::Context, reg) {
            Some(slot) if slot.valid && !non_cacheable => {
                let new = (slot.value & !mask) | (data & mask);
                if new == slot.value {
                    self.stats.regs_elided += 1;
                    false
                } else {
                    slot.value = new;
                    true
                }
            }
            _ => true,
        }
    }

    /// Write `values` to `start_reg..` as the fewest `SET_*` packets that skip every redundant
    /// register. Returns the number of words written to `out`; zero if nothing changed.
    pub fn write_optimized_set_seq_regs(
        &mut self,
        space: RegisterSpace,
        shader: ShaderType,
        start_reg: u32,
        values: &[u32],
        out: &mut [u32],
    ) -> usize {
        self.stats.packets_in += 1;
        self.split_set_regs(space, shader, start_reg, values, out)
    }

    fn split_set_regs(
        &mut self,
        space: RegisterSpace,
        shader: ShaderType,
        start_reg: u32,
        values: &[u32],
        out: &mut [u32],
    ) -> usize {
        let mut written = 0;
        let mut run_start = None;
        for (i, &value) in values.iter().enumerate() {
            let keep = self.must_keep(space, start_reg + i as u32, value);
            match (keep, run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(start)) => {
                    let run = &values[start..i];
                    let first = start_reg + start as u32;
                    written += self.emit_run(space, shader, first, run, &mut out[written..]);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            let first = start_reg + start as u32;
            written += self.emit_run(space, shader, first, &values[start..], &mut out[written..]);
        }
        written
    }

    fn emit_run(
        &mut self,
        space: RegisterSpace,
        shader: ShaderType,
        first_reg: u32,
        run: &[u32],
        out: &mut [u32],
    ) -> usize {
        let hdr = set_seq_header(space, first_reg, first_reg + run.len() as u32 - 1, shader);
        let size = hdr.size_words();
        out[0] = hdr.encode();
        out[1..size].copy_from_slice(run);
        self.stats.packets_out += 1;
        size
    }

    /// `SET_SH_REG_OFFSET` is always kept; its value comes from memory so the shadow is dropped.
    pub fn write_optimized_set_sh_reg_offset(
        &mut self,
        reg: u32,
        shader: ShaderType,
        data_offset: u32,
        out: &mut [u32],
    ) -> usize {
        self.set_sh_reg_invalid(reg);
        self.stats.packets_in += 1;
        self.stats.packets_out += 1;
        build_set_sh_reg_data_offset(reg, shader, data_offset, out)
    }

    pub fn set_sh_reg_invalid(&mut self, reg: u32) {
        if let Some(slot) = self.slot(RegisterSpace::Sh, reg) {
            slot.valid = false;
        }
    }

    pub fn set_context_reg_invalid(&mut self, reg: u32) {
        if let Some(slot) = self.slot(RegisterSpace::Context, reg) {
            slot.valid = false;
        }
    }

    fn invalidate(&mut self, reg: u32) {
        match RegisterSpace::of(reg) {
            Some(RegisterSpace::Sh) => self.set_sh_reg_invalid(reg),
            Some(RegisterSpace::Context) => self.set_context_reg_invalid(reg),
            _ => {}
        }
    }

    /// Forget every shadowed value.
    pub fn reset(&mut self) {
        self.context.fill(RegState::default());
        self.sh.fill(RegState::default());
        trace!("register shadow reset");
    }

    fn optimize_packet(&mut self, packet: &Packet<'_>, out: &mut [u32]) -> usize {
        self.stats.packets_in += 1;
        let size = packet.size_words();
        let keep = match packet.opcode {
            Opcode::SetContextReg | Opcode::SetShReg => {
                let space = packet.opcode.set_space().unwrap_or(RegisterSpace::Context);
                let first = packet.first_reg().unwrap_or_else(|| space.base());
                return self.split_set_regs(space, packet.shader_type(), first, packet.body, out);
            }
            Opcode::ContextRegRmw => {
                let reg = packet.first_reg().unwrap_or(RegisterSpace::CONTEXT_BASE);
                self.rmw_keep(reg, packet.body[0], packet.body[1])
            }
            Opcode::SetShRegOffset => {
                if let Some(reg) = packet.first_reg() {
                    self.set_sh_reg_invalid(reg);
                }
                true
            }
            Opcode::CopyData => {
                let imm = packet.header.imm;
                let dst_sel = (imm & COPY_DATA_DST_SEL_MASK) as u8;
                if matches!(
                    CopyDataDst::from_u8(dst_sel),
                    Some(CopyDataDst::Register | CopyDataDst::SysPerfCounter)
                ) {
                    let dst = packet.body[2];
                    self.invalidate(dst);
                    // A 64-bit copy also lands in the next register.
                    if imm & COPY_DATA_COUNT_64 != 0 {
                        self.invalidate(dst.wrapping_add(1));
                    }
                }
                true
            }
            Opcode::IndirectBuffer | Opcode::IndirectBufferConst => {
                if packet.indirect_buffer_target().is_some_and(|(_, _, chain)| !chain) {
                    // Called buffers may write anything.
                    self.reset();
                }
                true
            }
            Opcode::CondIndirectBuffer | Opcode::CondIndirectBufferConst => {
                if packet.header.imm & COND_IB_IMM_CHAIN == 0 {
                    self.reset();
                }
                true
            }
            Opcode::Nop | Opcode::SetConfigReg | Opcode::SetUconfigReg => true,
        };

        if !keep {
            return 0;
        }
        out[0] = packet.header.encode();
        out[1..size].copy_from_slice(packet.body);
        self.stats.packets_out += 1;
        size
    }

    /// Optimize a pre-built packet image from `src` into `dst`. Returns the words written.
    pub fn optimize_pm4_commands(&mut self, src: &[u32], dst: &mut [u32]) -> usize {
        let mut read = 0;
        let mut written = 0;
        while read < src.len() {
            let packet = decode_packet(src, read).unwrap_or_else(|err| malformed(err));
            read += packet.size_words();
            written += self.optimize_packet(&packet, &mut dst[written..]);
        }
        written
    }

    /// Optimize a complete block in place. Returns the compacted length.
    pub fn optimize_in_place(&mut self, words: &mut [u32]) -> usize {
        let mut scratch = [0u32; MAX_PACKET_WORDS];
        let mut read = 0;
        let mut written = 0;
        while read < words.len() {
            let size = decode_packet(words, read)
                .unwrap_or_else(|err| malformed(err))
                .size_words();
            scratch[..size].copy_from_slice(&words[read..read + size]);
            read += size;

            let packet = decode_packet(&scratch[..size], 0).unwrap_or_else(|err| malformed(err));
            // Output never outgrows input, so the write head stays behind the read head.
            written += self.optimize_packet(&packet, &mut words[written..read]);
        }
        debug!(
            words_in = words.len(),
            words_out = written,
            "optimized command block"
        );
        written
    }
}
