use core::fmt;

use crate::packet::{
    CompareFunc, CopyDataDst, CopyDataSrc, Opcode, Packet, COND_IB_IB1_BASE, COND_IB_IB1_SIZE,
    COND_IB_IB2_BASE, COND_IB_IB2_SIZE, COND_IB_IMM_CHAIN, COND_IB_IMM_FUNC_MASK,
    COPY_DATA_COUNT_64, COPY_DATA_DST_SEL_MASK, COPY_DATA_SRC_SEL_MASK, COPY_DATA_SRC_SEL_SHIFT,
};

fn join_u64(lo: u32, hi: u32) -> u64 {
    u64::from(lo) | (u64::from(hi) << 32)
}

impl fmt::Display for Packet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:6}: ", self.offset)?;
        match self.opcode {
            Opcode::Nop => write!(f, "NOP ({} words)", self.size_words()),
            Opcode::SetConfigReg
            | Opcode::SetContextReg
            | Opcode::SetShReg
            | Opcode::SetUconfigReg => {
                let first = self.first_reg().unwrap_or(0);
                write!(f, "{:?} 0x{first:04x}", self.opcode)?;
                if self.opcode == Opcode::SetShReg {
                    write!(f, " ({:?})", self.shader_type())?;
                }
                for (i, v) in self.body.iter().enumerate() {
                    write!(f, "\n          [0x{:04x}] = 0x{v:08x}", first + i as u32)?;
                }
                Ok(())
            }
            Opcode::SetShRegOffset => write!(
                f,
                "SetShRegOffset 0x{:04x} ({:?}) <- user data +{}",
                self.first_reg().unwrap_or(0),
                self.shader_type(),
                self.body[0]
            ),
            Opcode::ContextRegRmw => write!(
                f,
                "ContextRegRmw 0x{:04x} mask=0x{:08x} data=0x{:08x}",
                self.first_reg().unwrap_or(0),
                self.body[0],
                self.body[1]
            ),
            Opcode::CopyData => {
                let imm = self.header.imm;
                let dst = CopyDataDst::from_u8((imm & COPY_DATA_DST_SEL_MASK) as u8);
                let src = CopyDataSrc::from_u8(
                    ((imm & COPY_DATA_SRC_SEL_MASK) >> COPY_DATA_SRC_SEL_SHIFT) as u8,
                );
                write!(
                    f,
                    "CopyData {:?} 0x{:x} -> {:?} 0x{:x}{}",
                    src,
                    join_u64(self.body[0], self.body[1]),
                    dst,
                    join_u64(self.body[2], self.body[3]),
                    if imm & COPY_DATA_COUNT_64 != 0 { " (64-bit)" } else { "" }
                )
            }
            Opcode::IndirectBuffer | Opcode::IndirectBufferConst => {
                let (va, size, chain) = self.indirect_buffer_target().unwrap_or_default();
                write!(
                    f,
                    "{:?} va=0x{va:x} size={size}{}",
                    self.opcode,
                    if chain { " chain" } else { "" }
                )
            }
            Opcode::CondIndirectBuffer | Opcode::CondIndirectBufferConst => {
                let imm = self.header.imm;
                let func = CompareFunc::from_u8((imm & COND_IB_IMM_FUNC_MASK) as u8);
                let b = self.body;
                write!(
                    f,
                    "{:?} (mem[0x{:x}] & 0x{:x}) {:?} 0x{:x} ? 0x{:x}/{} : 0x{:x}/{}{}",
                    self.opcode,
                    join_u64(b[0], b[1]),
                    join_u64(b[4], b[5]),
                    func,
                    join_u64(b[2], b[3]),
                    u64::from(b[COND_IB_IB1_BASE]) << 2,
                    b[COND_IB_IB1_SIZE],
                    u64::from(b[COND_IB_IB2_BASE]) << 2,
                    b[COND_IB_IB2_SIZE],
                    if imm & COND_IB_IMM_CHAIN != 0 { " chain" } else { "" }
                )
            }
        }
    }
}
