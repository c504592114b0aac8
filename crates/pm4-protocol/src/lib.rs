#![forbid(unsafe_code)]

//! PM4 command-packet encoding.
//!
//! This crate owns the wire layout of the packets emitted by `pm4-stream`: header packing,
//! register-space classification, packet builders and a borrowing decoder.
//!
//! Wire format (all words little-endian `u32`):
//!
//! ```text
//!  31      24 23     16 15                0
//! +----------+---------+------------------+
//! |  opcode  | bodylen |    immediate     |  header word
//! +----------+---------+------------------+
//! | body[0] .. body[bodylen - 1]          |
//! +---------------------------------------+
//! ```

pub mod builder;
mod disasm;
pub mod packet;

pub use builder::{
    build_cond_indirect_buffer, build_context_reg_rmw, build_copy_data, build_indirect_buffer,
    build_nop, build_set_one_reg, build_set_seq_regs, build_set_seq_regs_with_data,
    build_set_sh_reg_data_offset, patch_cond_indirect_buffer_fail,
    patch_cond_indirect_buffer_pass, patch_indirect_buffer, set_seq_header, CondIndirectBufferArgs,
    CopyDataArgs, IndirectBufferArgs,
};
pub use packet::{
    decode_packet, CompareFunc, CopyDataDst, CopyDataSrc, IbEngine, Opcode, Packet,
    PacketDecodeError, PacketHeader, PacketIter, RegisterSpace, ShaderType,
    COND_INDIRECT_BUFFER_SIZE_WORDS, INDIRECT_BUFFER_SIZE_WORDS, MAX_BODY_WORDS,
    MAX_IB_SIZE_WORDS, MAX_PACKET_WORDS,
};
