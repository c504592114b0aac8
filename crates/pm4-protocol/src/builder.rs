//! Packet builders.
//!
//! Each `build_*` function writes one complete packet at the start of `out` and returns its size
//! in words. Callers own placement; these helpers never allocate.

use crate::packet::{
    CompareFunc, CopyDataDst, CopyDataSrc, IbEngine, Opcode, PacketHeader, RegisterSpace,
    ShaderType, COND_IB_COMPARE_HI, COND_IB_COMPARE_LO, COND_IB_IB1_BASE, COND_IB_IB1_SIZE,
    COND_IB_IB2_BASE, COND_IB_IB2_SIZE, COND_IB_IMM_CHAIN, COND_IB_MASK_HI, COND_IB_MASK_LO,
    COND_IB_REFERENCE_HI, COND_IB_REFERENCE_LO, COND_INDIRECT_BUFFER_SIZE_WORDS,
    COPY_DATA_COUNT_64, COPY_DATA_SRC_SEL_SHIFT, COPY_DATA_WR_CONFIRM, IB_IMM_CHAIN,
    IB_IMM_PREEMPTION, INDIRECT_BUFFER_SIZE_WORDS, MAX_BODY_WORDS, MAX_IB_SIZE_WORDS,
    SH_IMM_COMPUTE,
};

fn low_part(v: u64) -> u32 {
    v as u32
}

fn high_part(v: u64) -> u32 {
    (v >> 32) as u32
}

/// Encode a buffer VA for an indirect-buffer field.
fn ib_base(va: u64) -> u32 {
    assert!(va & 0x3 == 0, "indirect buffer VA 0x{va:x} is not dword aligned");
    let base = va >> 2;
    assert!(
        base <= u64::from(u32::MAX),
        "indirect buffer VA 0x{va:x} is outside the addressable range"
    );
    base as u32
}

fn ib_size(size_words: u32) -> u32 {
    assert!(
        size_words <= MAX_IB_SIZE_WORDS,
        "indirect buffer of {size_words} words exceeds the {MAX_IB_SIZE_WORDS}-word limit"
    );
    size_words
}

/// Immediate of a set packet for `reg`.
fn set_imm(space: RegisterSpace, reg: u32, shader: ShaderType) -> u16 {
    assert!(
        space.contains(reg),
        "register 0x{reg:x} is not in the {space:?} space"
    );
    let mut imm = (reg - space.base()) as u16;
    if space == RegisterSpace::Sh && shader == ShaderType::Compute {
        imm |= SH_IMM_COMPUTE;
    }
    imm
}

/// Header word of a `SET_*` packet covering `start_reg..=end_reg`.
///
/// The optimizer keeps this around to re-split the range without touching command memory.
pub fn set_seq_header(
    space: RegisterSpace,
    start_reg: u32,
    end_reg: u32,
    shader: ShaderType,
) -> PacketHeader {
    assert!(end_reg >= start_reg, "register range is reversed");
    assert!(
        space.contains(end_reg),
        "register 0x{end_reg:x} is not in the {space:?} space"
    );
    let count = (end_reg - start_reg + 1) as usize;
    assert!(
        count <= MAX_BODY_WORDS,
        "{count} registers do not fit in one packet"
    );
    PacketHeader::new(space.set_opcode(), count, set_imm(space, start_reg, shader))
}

/// Header of a `SET_*` packet for `start_reg..=end_reg`. The caller fills the data words.
pub fn build_set_seq_regs(
    space: RegisterSpace,
    start_reg: u32,
    end_reg: u32,
    shader: ShaderType,
    out: &mut [u32],
) -> usize {
    let hdr = set_seq_header(space, start_reg, end_reg, shader);
    out[0] = hdr.encode();
    hdr.size_words()
}

/// A complete `SET_*` packet for one register.
pub fn build_set_one_reg(
    space: RegisterSpace,
    reg: u32,
    shader: ShaderType,
    value: u32,
    out: &mut [u32],
) -> usize {
    let size = build_set_seq_regs(space, reg, reg, shader, out);
    out[1] = value;
    size
}

/// A complete `SET_*` packet for `start_reg..start_reg + values.len()`.
pub fn build_set_seq_regs_with_data(
    space: RegisterSpace,
    start_reg: u32,
    shader: ShaderType,
    values: &[u32],
    out: &mut [u32],
) -> usize {
    assert!(!values.is_empty(), "set packet needs at least one value");
    let end_reg = start_reg + values.len() as u32 - 1;
    let size = build_set_seq_regs(space, start_reg, end_reg, shader, out);
    out[1..size].copy_from_slice(values);
    size
}

/// `SET_SH_REG_OFFSET`: load `reg` from the indirect user-data table at `data_offset`.
pub fn build_set_sh_reg_data_offset(
    reg: u32,
    shader: ShaderType,
    data_offset: u32,
    out: &mut [u32],
) -> usize {
    let hdr = PacketHeader::new(
        Opcode::SetShRegOffset,
        1,
        set_imm(RegisterSpace::Sh, reg, shader),
    );
    out[0] = hdr.encode();
    out[1] = data_offset;
    hdr.size_words()
}

/// `CONTEXT_REG_RMW`: `reg = (reg & !mask) | (data & mask)`.
pub fn build_context_reg_rmw(reg: u32, mask: u32, data: u32, out: &mut [u32]) -> usize {
    let hdr = PacketHeader::new(
        Opcode::ContextRegRmw,
        2,
        set_imm(RegisterSpace::Context, reg, ShaderType::Graphics),
    );
    out[0] = hdr.encode();
    out[1] = mask;
    out[2] = data;
    hdr.size_words()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyDataArgs {
    pub dst_sel: CopyDataDst,
    pub dst_addr: u64,
    pub src_sel: CopyDataSrc,
    pub src: u64,
    pub count_64: bool,
    pub wr_confirm: bool,
}

pub fn build_copy_data(args: &CopyDataArgs, out: &mut [u32]) -> usize {
    let mut imm = args.dst_sel as u16 | ((args.src_sel as u16) << COPY_DATA_SRC_SEL_SHIFT);
    if args.count_64 {
        imm |= COPY_DATA_COUNT_64;
    }
    if args.wr_confirm {
        imm |= COPY_DATA_WR_CONFIRM;
    }
    let hdr = PacketHeader::new(Opcode::CopyData, 4, imm);
    out[0] = hdr.encode();
    out[1] = low_part(args.src);
    out[2] = high_part(args.src);
    out[3] = low_part(args.dst_addr);
    out[4] = high_part(args.dst_addr);
    hdr.size_words()
}

/// Fill `size_words` with NOP packets. Sizes beyond one packet are split.
pub fn build_nop(size_words: usize, out: &mut [u32]) -> usize {
    let mut offset = 0;
    while offset < size_words {
        let chunk = (size_words - offset).min(MAX_BODY_WORDS + 1);
        let hdr = PacketHeader::new(Opcode::Nop, chunk - 1, 0);
        out[offset] = hdr.encode();
        out[offset + 1..offset + chunk].fill(0);
        offset += chunk;
    }
    size_words
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndirectBufferArgs {
    pub va: u64,
    pub size_words: u32,
    pub chain: bool,
    pub engine: IbEngine,
    pub preemption_enabled: bool,
}

pub fn build_indirect_buffer(args: &IndirectBufferArgs, out: &mut [u32]) -> usize {
    let opcode = match args.engine {
        IbEngine::Draw => Opcode::IndirectBuffer,
        IbEngine::Constant => Opcode::IndirectBufferConst,
    };
    let mut imm = ib_size(args.size_words) as u16;
    if args.chain {
        imm |= IB_IMM_CHAIN;
    }
    if args.preemption_enabled {
        imm |= IB_IMM_PREEMPTION;
    }
    let hdr = PacketHeader::new(opcode, INDIRECT_BUFFER_SIZE_WORDS - 1, imm);
    out[0] = hdr.encode();
    out[1] = ib_base(args.va);
    INDIRECT_BUFFER_SIZE_WORDS
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CondIndirectBufferArgs {
    pub compare_func: CompareFunc,
    pub compare_va: u64,
    pub reference: u64,
    pub mask: u64,
    pub chain: bool,
    pub engine: IbEngine,
}

/// `COND_INDIRECT_BUFFER` with both branch targets zeroed; fill them with the patch helpers.
pub fn build_cond_indirect_buffer(args: &CondIndirectBufferArgs, out: &mut [u32]) -> usize {
    let opcode = match args.engine {
        IbEngine::Draw => Opcode::CondIndirectBuffer,
        IbEngine::Constant => Opcode::CondIndirectBufferConst,
    };
    let mut imm = args.compare_func as u16;
    if args.chain {
        imm |= COND_IB_IMM_CHAIN;
    }
    let hdr = PacketHeader::new(opcode, COND_INDIRECT_BUFFER_SIZE_WORDS - 1, imm);
    let body = &mut out[1..COND_INDIRECT_BUFFER_SIZE_WORDS];
    body.fill(0);
    body[COND_IB_COMPARE_LO] = low_part(args.compare_va);
    body[COND_IB_COMPARE_HI] = high_part(args.compare_va);
    body[COND_IB_REFERENCE_LO] = low_part(args.reference);
    body[COND_IB_REFERENCE_HI] = high_part(args.reference);
    body[COND_IB_MASK_LO] = low_part(args.mask);
    body[COND_IB_MASK_HI] = high_part(args.mask);
    out[0] = hdr.encode();
    COND_INDIRECT_BUFFER_SIZE_WORDS
}

/// Replace the placeholder in `packet` with an indirect buffer to `va`.
pub fn patch_indirect_buffer(
    packet: &mut [u32],
    va: u64,
    size_words: u32,
    chain: bool,
    engine: IbEngine,
    preemption_enabled: bool,
) {
    build_indirect_buffer(
        &IndirectBufferArgs {
            va,
            size_words,
            chain,
            engine,
            preemption_enabled,
        },
        packet,
    );
}

fn cond_ib_header(packet: &[u32]) {
    let op = PacketHeader::decode(packet[0]).opcode();
    assert!(
        op.is_some_and(Opcode::is_cond_indirect_buffer),
        "patch target is not a conditional indirect buffer (header 0x{:08x})",
        packet[0]
    );
}

/// Fill the branch taken when the comparison passes.
pub fn patch_cond_indirect_buffer_pass(packet: &mut [u32], va: u64, size_words: u32) {
    cond_ib_header(packet);
    packet[1 + COND_IB_IB1_BASE] = ib_base(va);
    packet[1 + COND_IB_IB1_SIZE] = ib_size(size_words);
}

/// Fill the branch taken when the comparison fails.
pub fn patch_cond_indirect_buffer_fail(packet: &mut [u32], va: u64, size_words: u32) {
    cond_ib_header(packet);
    packet[1 + COND_IB_IB2_BASE] = ib_base(va);
    packet[1 + COND_IB_IB2_SIZE] = ib_size(size_words);
}
