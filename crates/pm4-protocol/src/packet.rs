//! PM4 packet layouts.
//!
//! Every packet starts with one header word:
//!
//! ```text
//! [31:24] opcode | [23:16] body length in words | [15:0] opcode-specific immediate
//! ```
//!
//! The packet occupies `1 + body_len` words. All words are little-endian `u32`s.

use thiserror::Error;

/// Largest body a single packet can carry.
pub const MAX_BODY_WORDS: usize = 0xFF;

/// Largest packet (header plus body).
pub const MAX_PACKET_WORDS: usize = MAX_BODY_WORDS + 1;

/// Size of every indirect-buffer packet (header + target VA).
pub const INDIRECT_BUFFER_SIZE_WORDS: usize = 2;

/// Size of every conditional indirect-buffer packet.
pub const COND_INDIRECT_BUFFER_SIZE_WORDS: usize = 11;

/// Largest buffer an indirect-buffer packet can address.
pub const MAX_IB_SIZE_WORDS: u32 = 0x3FFF;

/// Bit 15 of a `SET_SH_REG`/`SET_SH_REG_OFFSET` immediate: register belongs to the compute pipe.
pub const SH_IMM_COMPUTE: u16 = 1 << 15;

pub const IB_IMM_CHAIN: u16 = 1 << 15;
pub const IB_IMM_PREEMPTION: u16 = 1 << 14;
pub const IB_IMM_SIZE_MASK: u16 = 0x3FFF;

pub const COND_IB_IMM_CHAIN: u16 = 1 << 15;
pub const COND_IB_IMM_FUNC_MASK: u16 = 0x7;

// COND_INDIRECT_BUFFER body word indices.
pub const COND_IB_COMPARE_LO: usize = 0;
pub const COND_IB_COMPARE_HI: usize = 1;
pub const COND_IB_REFERENCE_LO: usize = 2;
pub const COND_IB_REFERENCE_HI: usize = 3;
pub const COND_IB_MASK_LO: usize = 4;
pub const COND_IB_MASK_HI: usize = 5;
pub const COND_IB_IB1_BASE: usize = 6;
pub const COND_IB_IB1_SIZE: usize = 7;
pub const COND_IB_IB2_BASE: usize = 8;
pub const COND_IB_IB2_SIZE: usize = 9;

// COPY_DATA immediate fields.
pub const COPY_DATA_DST_SEL_MASK: u16 = 0xF;
pub const COPY_DATA_SRC_SEL_SHIFT: u16 = 4;
pub const COPY_DATA_SRC_SEL_MASK: u16 = 0xF << COPY_DATA_SRC_SEL_SHIFT;
pub const COPY_DATA_COUNT_64: u16 = 1 << 8;
pub const COPY_DATA_WR_CONFIRM: u16 = 1 << 9;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop = 0x10,
    CondIndirectBufferConst = 0x2E,
    CondIndirectBuffer = 0x2F,
    IndirectBufferConst = 0x33,
    IndirectBuffer = 0x3F,
    CopyData = 0x40,
    ContextRegRmw = 0x51,
    SetConfigReg = 0x68,
    SetContextReg = 0x69,
    SetShReg = 0x76,
    SetShRegOffset = 0x77,
    SetUconfigReg = 0x79,
}

impl Opcode {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x10 => Some(Self::Nop),
            0x2E => Some(Self::CondIndirectBufferConst),
            0x2F => Some(Self::CondIndirectBuffer),
            0x33 => Some(Self::IndirectBufferConst),
            0x3F => Some(Self::IndirectBuffer),
            0x40 => Some(Self::CopyData),
            0x51 => Some(Self::ContextRegRmw),
            0x68 => Some(Self::SetConfigReg),
            0x69 => Some(Self::SetContextReg),
            0x76 => Some(Self::SetShReg),
            0x77 => Some(Self::SetShRegOffset),
            0x79 => Some(Self::SetUconfigReg),
            _ => None,
        }
    }

    /// Register space written by a `SET_*` opcode.
    pub const fn set_space(self) -> Option<RegisterSpace> {
        match self {
            Self::SetConfigReg => Some(RegisterSpace::Config),
            Self::SetContextReg => Some(RegisterSpace::Context),
            Self::SetShReg => Some(RegisterSpace::Sh),
            Self::SetUconfigReg => Some(RegisterSpace::Uconfig),
            _ => None,
        }
    }

    pub const fn is_indirect_buffer(self) -> bool {
        matches!(self, Self::IndirectBuffer | Self::IndirectBufferConst)
    }

    pub const fn is_cond_indirect_buffer(self) -> bool {
        matches!(self, Self::CondIndirectBuffer | Self::CondIndirectBufferConst)
    }

    /// Body length for opcodes with a fixed layout.
    pub const fn fixed_body_len(self) -> Option<usize> {
        match self {
            Self::IndirectBuffer | Self::IndirectBufferConst => Some(INDIRECT_BUFFER_SIZE_WORDS - 1),
            Self::CondIndirectBuffer | Self::CondIndirectBufferConst => {
                Some(COND_INDIRECT_BUFFER_SIZE_WORDS - 1)
            }
            Self::CopyData => Some(4),
            Self::ContextRegRmw => Some(2),
            Self::SetShRegOffset => Some(1),
            _ => None,
        }
    }
}

/// Hardware register address spaces, in word addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegisterSpace {
    Config,
    Sh,
    Context,
    Uconfig,
}

impl RegisterSpace {
    pub const CONFIG_BASE: u32 = 0x2000;
    pub const CONFIG_END: u32 = 0x2C00;
    pub const SH_BASE: u32 = 0x2C00;
    pub const SH_END: u32 = 0x3000;
    pub const CONTEXT_BASE: u32 = 0xA000;
    pub const CONTEXT_END: u32 = 0xA400;
    pub const UCONFIG_BASE: u32 = 0xC000;
    pub const UCONFIG_END: u32 = 0x1_0000;

    pub const fn of(reg: u32) -> Option<Self> {
        if Self::Config.contains(reg) {
            Some(Self::Config)
        } else if Self::Sh.contains(reg) {
            Some(Self::Sh)
        } else if Self::Context.contains(reg) {
            Some(Self::Context)
        } else if Self::Uconfig.contains(reg) {
            Some(Self::Uconfig)
        } else {
            None
        }
    }

    pub const fn base(self) -> u32 {
        match self {
            Self::Config => Self::CONFIG_BASE,
            Self::Sh => Self::SH_BASE,
            Self::Context => Self::CONTEXT_BASE,
            Self::Uconfig => Self::UCONFIG_BASE,
        }
    }

    pub const fn end(self) -> u32 {
        match self {
            Self::Config => Self::CONFIG_END,
            Self::Sh => Self::SH_END,
            Self::Context => Self::CONTEXT_END,
            Self::Uconfig => Self::UCONFIG_END,
        }
    }

    /// Number of registers in the space.
    pub const fn len(self) -> usize {
        (self.end() - self.base()) as usize
    }

    pub const fn contains(self, reg: u32) -> bool {
        reg >= self.base() && reg < self.end()
    }

    pub const fn set_opcode(self) -> Opcode {
        match self {
            Self::Config => Opcode::SetConfigReg,
            Self::Sh => Opcode::SetShReg,
            Self::Context => Opcode::SetContextReg,
            Self::Uconfig => Opcode::SetUconfigReg,
        }
    }
}

/// Which pipe a shader register belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ShaderType {
    #[default]
    Graphics,
    Compute,
}

/// Engine an indirect buffer is executed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IbEngine {
    Draw,
    Constant,
}

/// Comparison applied by a conditional indirect buffer: `(mem & mask) <func> reference`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareFunc {
    Never = 0,
    Less = 1,
    Equal = 2,
    LessEqual = 3,
    Greater = 4,
    NotEqual = 5,
    GreaterEqual = 6,
    #[default]
    Always = 7,
}

impl CompareFunc {
    pub const fn from_u8(v: u8) -> Self {
        match v & 0x7 {
            0 => Self::Never,
            1 => Self::Less,
            2 => Self::Equal,
            3 => Self::LessEqual,
            4 => Self::Greater,
            5 => Self::NotEqual,
            6 => Self::GreaterEqual,
            _ => Self::Always,
        }
    }

    pub fn evaluate(self, value: u64, reference: u64) -> bool {
        match self {
            Self::Never => false,
            Self::Less => value < reference,
            Self::Equal => value == reference,
            Self::LessEqual => value <= reference,
            Self::Greater => value > reference,
            Self::NotEqual => value != reference,
            Self::GreaterEqual => value >= reference,
            Self::Always => true,
        }
    }
}

/// `COPY_DATA` destination select.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CopyDataDst {
    Register = 0,
    Memory = 1,
    SysPerfCounter = 4,
}

impl CopyDataDst {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Register),
            1 => Some(Self::Memory),
            4 => Some(Self::SysPerfCounter),
            _ => None,
        }
    }
}

/// `COPY_DATA` source select.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CopyDataSrc {
    Register = 0,
    Memory = 1,
    Immediate = 5,
}

impl CopyDataSrc {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Register),
            1 => Some(Self::Memory),
            5 => Some(Self::Immediate),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub opcode: u8,
    pub body_len: u8,
    pub imm: u16,
}

impl PacketHeader {
    pub const fn new(opcode: Opcode, body_len: usize, imm: u16) -> Self {
        assert!(body_len <= MAX_BODY_WORDS, "packet body too large");
        Self {
            opcode: opcode as u8,
            body_len: body_len as u8,
            imm,
        }
    }

    pub const fn decode(word: u32) -> Self {
        Self {
            opcode: (word >> 24) as u8,
            body_len: (word >> 16) as u8,
            imm: word as u16,
        }
    }

    pub const fn encode(self) -> u32 {
        ((self.opcode as u32) << 24) | ((self.body_len as u32) << 16) | self.imm as u32
    }

    pub const fn size_words(self) -> usize {
        1 + self.body_len as usize
    }

    pub const fn opcode(self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PacketDecodeError {
    #[error("packet at word {offset} needs {needed} words but only {available} remain")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("unknown opcode 0x{opcode:02x} at word {offset}")]
    UnknownOpcode { offset: usize, opcode: u8 },
    #[error("{opcode:?} at word {offset} has body length {found}, expected {expected}")]
    BadBodyLength {
        offset: usize,
        opcode: Opcode,
        expected: usize,
        found: usize,
    },
    #[error("{opcode:?} at word {offset} writes registers outside of its space")]
    RegisterOutOfSpace { offset: usize, opcode: Opcode },
}

/// One decoded packet borrowed from a word buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Packet<'a> {
    /// Word offset of the header inside the decoded buffer.
    pub offset: usize,
    pub header: PacketHeader,
    pub opcode: Opcode,
    pub body: &'a [u32],
}

impl Packet<'_> {
    pub fn size_words(&self) -> usize {
        self.header.size_words()
    }

    /// First register written by a `SET_*`, `SET_SH_REG_OFFSET` or `CONTEXT_REG_RMW` packet.
    pub fn first_reg(&self) -> Option<u32> {
        let space = match self.opcode {
            Opcode::SetShRegOffset => RegisterSpace::Sh,
            Opcode::ContextRegRmw => RegisterSpace::Context,
            op => op.set_space()?,
        };
        let offset = match space {
            RegisterSpace::Sh => self.header.imm & !SH_IMM_COMPUTE,
            _ => self.header.imm,
        };
        Some(space.base() + offset as u32)
    }

    pub fn shader_type(&self) -> ShaderType {
        if self.header.imm & SH_IMM_COMPUTE != 0 {
            ShaderType::Compute
        } else {
            ShaderType::Graphics
        }
    }

    /// Target of an indirect-buffer packet as `(va, size_words, chain)`.
    pub fn indirect_buffer_target(&self) -> Option<(u64, u32, bool)> {
        if !self.opcode.is_indirect_buffer() {
            return None;
        }
        let imm = self.header.imm;
        Some((
            u64::from(self.body[0]) << 2,
            u32::from(imm & IB_IMM_SIZE_MASK),
            imm & IB_IMM_CHAIN != 0,
        ))
    }
}

/// Decode one packet at `offset`.
pub fn decode_packet(words: &[u32], offset: usize) -> Result<Packet<'_>, PacketDecodeError> {
    let Some(&hdr_word) = words.get(offset) else {
        return Err(PacketDecodeError::Truncated {
            offset,
            needed: 1,
            available: 0,
        });
    };
    let header = PacketHeader::decode(hdr_word);
    let opcode = header.opcode().ok_or(PacketDecodeError::UnknownOpcode {
        offset,
        opcode: header.opcode,
    })?;

    let size = header.size_words();
    let available = words.len() - offset;
    if size > available {
        return Err(PacketDecodeError::Truncated {
            offset,
            needed: size,
            available,
        });
    }

    let body_len = header.body_len as usize;
    if let Some(expected) = opcode.fixed_body_len() {
        if body_len != expected {
            return Err(PacketDecodeError::BadBodyLength {
                offset,
                opcode,
                expected,
                found: body_len,
            });
        }
    }

    let packet = Packet {
        offset,
        header,
        opcode,
        body: &words[offset + 1..offset + size],
    };

    if let Some(space) = opcode.set_space() {
        if body_len == 0 {
            return Err(PacketDecodeError::BadBodyLength {
                offset,
                opcode,
                expected: 1,
                found: 0,
            });
        }
        // first_reg() is always Some for set opcodes.
        let first = packet.first_reg().unwrap_or(0);
        if !space.contains(first) || !space.contains(first + body_len as u32 - 1) {
            return Err(PacketDecodeError::RegisterOutOfSpace { offset, opcode });
        }
    }

    Ok(packet)
}

/// Iterates the packets of a word buffer. Stops after the first error.
pub struct PacketIter<'a> {
    words: &'a [u32],
    offset: usize,
    done: bool,
}

impl<'a> PacketIter<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self {
            words,
            offset: 0,
            done: false,
        }
    }

    /// Word offset of the next packet.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for PacketIter<'a> {
    type Item = Result<Packet<'a>, PacketDecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.words.len() {
            return None;
        }

        match decode_packet(self.words, self.offset) {
            Ok(packet) => {
                self.offset += packet.size_words();
                Some(Ok(packet))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
