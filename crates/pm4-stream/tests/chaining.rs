use std::cell::Cell;
use std::sync::Arc;

use pm4_protocol::{decode_packet, CompareFunc, Opcode, ShaderType};
use pm4_stream::{
    AllocError, BeginFlags, ChainPatchKind, CmdAllocator, CmdChunk, CmdStream, CmdStreamConfig,
    CmdStreamError, CondCompare, IbTarget, LinearCmdAllocator, OptimizationMode, PacketLocation,
    RegisterFile, RegisterTable, ReplayError, ReplayMemory, Replayer,
};
use pretty_assertions::assert_eq;

const PREDICATE_VA: u64 = 0x1000;
const MODES: [OptimizationMode; 3] = [
    OptimizationMode::None,
    OptimizationMode::Immediate,
    OptimizationMode::Finalized,
];

/// Linear allocator that can be told to fail the next request.
#[derive(Debug)]
struct FlakyAllocator {
    inner: LinearCmdAllocator,
    fail_next: Cell<bool>,
}

impl FlakyAllocator {
    fn new(base_va: u64) -> Self {
        Self {
            inner: LinearCmdAllocator::new(base_va),
            fail_next: Cell::new(false),
        }
    }
}

impl CmdAllocator for FlakyAllocator {
    fn allocate_chunk(&mut self, size_words: usize) -> Result<CmdChunk, AllocError> {
        if self.fail_next.take() {
            return Err(AllocError {
                requested_words: size_words,
            });
        }
        self.inner.allocate_chunk(size_words)
    }

    fn release_chunk(&mut self, chunk: CmdChunk) {
        self.inner.release_chunk(chunk)
    }
}

fn new_stream(config: CmdStreamConfig) -> CmdStream<LinearCmdAllocator> {
    CmdStream::new(
        config,
        Arc::new(RegisterTable::new()),
        LinearCmdAllocator::new(0x40_0000),
    )
    .unwrap()
}

fn small(mode: OptimizationMode) -> CmdStreamConfig {
    CmdStreamConfig::default()
        .optimization(mode)
        .chunk_size_words(32)
        .reserve_limit_words(8)
}

fn write_ctx<A: CmdAllocator>(stream: &mut CmdStream<A>, reg: u32, value: u32) {
    let cursor = stream.reserve_commands().unwrap();
    let cursor = stream.write_set_one_context_reg(reg, value, cursor);
    stream.commit_commands(cursor);
}

fn replay_with_predicate<A: CmdAllocator>(stream: &CmdStream<A>, predicate: u64) -> RegisterFile {
    let mut memory = ReplayMemory::new();
    memory.add_stream(stream);
    memory.write_u64(PREDICATE_VA, predicate);
    let mut regs = RegisterFile::new();
    Replayer::new(&memory)
        .execute_stream(&mut regs, stream)
        .unwrap();
    regs
}

fn if_equal_one() -> CondCompare {
    CondCompare {
        func: CompareFunc::Equal,
        compare_va: PREDICATE_VA,
        reference: 1,
        mask: u64::MAX,
    }
}

#[test]
fn four_word_blocks_end_to_end() {
    let config = CmdStreamConfig::default()
        .optimization(OptimizationMode::Immediate)
        .chunk_size_words(4)
        .reserve_limit_words(2);
    let mut s = new_stream(config);
    s.begin(BeginFlags::OPTIMIZE_COMMANDS).unwrap();

    let cursor = s.reserve_commands().unwrap();
    let cursor = s.write_set_one_context_reg(0xA000, 1, cursor);
    assert_eq!(cursor.offset(), 2);
    let cursor = s.write_set_one_context_reg(0xA000, 1, cursor);
    assert_eq!(cursor.offset(), 2);
    s.commit_commands(cursor);

    // Two words left: exactly the chain trailer. The next reservation seals the block.
    let cursor = s.reserve_commands().unwrap();
    assert_eq!(s.chunk_count(), 2);
    assert_eq!(s.chunks()[0].used(), 4);
    assert_eq!(
        s.pending_chain_patches()
            .iter()
            .map(|p| (p.kind, p.location))
            .collect::<Vec<_>>(),
        vec![(
            ChainPatchKind::IndirectBuffer,
            PacketLocation { chunk: 0, offset: 2 }
        )]
    );
    // Until resolved, the trailer is a NOP.
    assert_eq!(
        decode_packet(s.chunks()[0].words(), 2).unwrap().opcode,
        Opcode::Nop
    );

    let block2 = s.chunks()[1].va();
    s.resolve_chain_patches(block2, 2);
    assert!(s.pending_chain_patches().is_empty());
    assert_eq!(
        decode_packet(s.chunks()[0].words(), 2)
            .unwrap()
            .indirect_buffer_target(),
        Some((block2, 2, true))
    );

    s.commit_commands(cursor);
    s.end();
    assert_eq!(s.stats().chain_patches_resolved, 1);
}

#[test]
fn every_block_chains_to_the_next() {
    let mut s = new_stream(small(OptimizationMode::None));
    s.begin(BeginFlags::empty()).unwrap();
    for i in 0..40 {
        write_ctx(&mut s, 0xA000 + i, i);
    }
    s.end();
    assert!(s.chunk_count() > 3);

    let chunks = s.chunks();
    for (block, next) in chunks.iter().zip(&chunks[1..]) {
        let trailer = decode_packet(block.words(), block.used() - 2).unwrap();
        assert_eq!(
            trailer.indirect_buffer_target(),
            Some((next.va(), next.used() as u32, true))
        );
    }
    let tail = s.tail_chain_location().unwrap();
    assert_eq!(tail.chunk, chunks.len() - 1);
    let last = chunks.last().unwrap();
    assert_eq!(decode_packet(last.words(), tail.offset).unwrap().opcode, Opcode::Nop);

    let regs = replay_with_predicate(&s, 0);
    assert_eq!(regs.len(), 40);
    assert_eq!(regs.get(0xA027), Some(39));
}

#[test]
fn chain_patches_apply_in_any_order() {
    // Record placeholders only, then resolve them by hand both ways.
    let mut s = new_stream(small(OptimizationMode::None));
    s.begin(BeginFlags::empty()).unwrap();
    let mut cursor = s.reserve_commands().unwrap();
    cursor = s.write_indirect_buffer(IbTarget::Deferred, false, cursor);
    cursor = s.write_cond_indirect_buffer(&if_equal_one(), IbTarget::Deferred, IbTarget::Deferred, cursor);
    cursor = s.write_indirect_buffer(IbTarget::Deferred, true, cursor);
    s.commit_commands(cursor);
    let patches = s.pending_chain_patches().to_vec();
    assert_eq!(patches.len(), 4);

    let targets = [(0x10_0000u64, 16u32), (0x20_0000, 32), (0x30_0000, 48), (0x40_0000, 64)];
    let mut forward: Vec<CmdChunk> = s.chunks().to_vec();
    let mut reverse: Vec<CmdChunk> = s.chunks().to_vec();
    for (patch, &(va, size)) in patches.iter().zip(&targets) {
        patch.apply(&mut forward, va, size);
    }
    for (patch, &(va, size)) in patches.iter().zip(&targets).rev() {
        patch.apply(&mut reverse, va, size);
    }
    assert_eq!(forward[0].words(), reverse[0].words());

    let words = forward[0].words();
    assert_eq!(
        decode_packet(words, 0).unwrap().indirect_buffer_target(),
        Some((0x10_0000, 16, false))
    );
    let cond = decode_packet(words, 2).unwrap();
    assert_eq!(cond.opcode, Opcode::CondIndirectBuffer);
    assert_eq!(&cond.body[6..10], &[0x20_0000 >> 2, 32, 0x30_0000 >> 2, 48]);
    assert_eq!(
        decode_packet(words, 13).unwrap().indirect_buffer_target(),
        Some((0x40_0000, 64, true))
    );
}

#[test]
fn stream_resolution_matches_reverse_application() {
    let mut s = new_stream(small(OptimizationMode::None));
    s.begin(BeginFlags::empty()).unwrap();
    let mut cursor = s.reserve_commands().unwrap();
    cursor = s.write_indirect_buffer(IbTarget::Deferred, false, cursor);
    cursor = s.write_cond_indirect_buffer(&if_equal_one(), IbTarget::Deferred, IbTarget::Deferred, cursor);
    s.commit_commands(cursor);
    s.end_current_block(false).unwrap();
    write_ctx(&mut s, 0xA000, 1);

    // Three deferred targets plus the block 0 trailer, all waiting on block 1.
    let patches = s.pending_chain_patches().to_vec();
    assert_eq!(patches.len(), 4);
    let mut reverse: Vec<CmdChunk> = s.chunks().to_vec();

    let (va, size) = (0x50_0000u64, 12u32);
    s.resolve_chain_patches(va, size);
    assert!(s.pending_chain_patches().is_empty());
    for patch in patches.iter().rev() {
        patch.apply(&mut reverse, va, size);
    }
    assert_eq!(s.chunks()[0].words(), reverse[0].words());
    assert_eq!(s.chunks()[1].words(), reverse[1].words());

    let trailer = decode_packet(s.chunks()[0].words(), 13).unwrap();
    assert_eq!(trailer.indirect_buffer_target(), Some((va, size, true)));
    assert_eq!(s.stats().chain_patches_resolved, 4);
    s.end();
}

#[test]
fn deferred_call_resolves_to_the_next_block() {
    let mut s = new_stream(small(OptimizationMode::None));
    s.begin(BeginFlags::empty()).unwrap();
    let mut cursor = s.reserve_commands().unwrap();
    cursor = s.write_indirect_buffer(IbTarget::Deferred, false, cursor);
    s.commit_commands(cursor);
    s.end_current_block(false).unwrap();
    write_ctx(&mut s, 0xA050, 8);
    s.end();

    let next = &s.chunks()[1];
    assert_eq!(
        decode_packet(s.chunks()[0].words(), 0)
            .unwrap()
            .indirect_buffer_target(),
        Some((next.va(), next.used() as u32, false))
    );
}

fn record_if_else(mode: OptimizationMode, with_else: bool) -> CmdStream<LinearCmdAllocator> {
    let mut s = new_stream(small(mode));
    s.begin(BeginFlags::OPTIMIZE_COMMANDS).unwrap();
    write_ctx(&mut s, 0xA000, 1);
    s.begin_if(if_equal_one()).unwrap();
    write_ctx(&mut s, 0xA000, 2);
    write_ctx(&mut s, 0xA001, 10);
    if with_else {
        s.begin_else().unwrap();
        write_ctx(&mut s, 0xA001, 20);
    }
    s.end_if().unwrap();
    write_ctx(&mut s, 0xA002, 3);
    s.end();
    s
}

#[test]
fn conditional_section_takes_the_right_branch() {
    for mode in MODES {
        let s = record_if_else(mode, true);
        assert!(s.pending_chain_patches().is_empty());
        assert_eq!(s.chunk_count(), 4, "{mode:?}");

        let taken = replay_with_predicate(&s, 1);
        assert_eq!(taken.get(0xA000), Some(2), "{mode:?}");
        assert_eq!(taken.get(0xA001), Some(10), "{mode:?}");
        assert_eq!(taken.get(0xA002), Some(3), "{mode:?}");

        let skipped = replay_with_predicate(&s, 0);
        assert_eq!(skipped.get(0xA000), Some(1), "{mode:?}");
        assert_eq!(skipped.get(0xA001), Some(20), "{mode:?}");
        assert_eq!(skipped.get(0xA002), Some(3), "{mode:?}");
    }
}

#[test]
fn conditional_without_else_skips_to_the_merge_block() {
    for mode in MODES {
        let s = record_if_else(mode, false);
        assert_eq!(s.chunk_count(), 3, "{mode:?}");

        let taken = replay_with_predicate(&s, 1);
        assert_eq!(taken.get(0xA000), Some(2), "{mode:?}");
        assert_eq!(taken.get(0xA001), Some(10), "{mode:?}");

        let skipped = replay_with_predicate(&s, 5);
        assert_eq!(skipped.get(0xA000), Some(1), "{mode:?}");
        assert_eq!(skipped.get(0xA001), None, "{mode:?}");
        assert_eq!(skipped.get(0xA002), Some(3), "{mode:?}");
    }
}

#[test]
fn write_after_end_if_is_not_elided() {
    for mode in MODES {
        let mut s = new_stream(small(mode));
        s.begin(BeginFlags::OPTIMIZE_COMMANDS).unwrap();
        write_ctx(&mut s, 0xA000, 1);
        s.begin_if(if_equal_one()).unwrap();
        write_ctx(&mut s, 0xA000, 2);
        s.end_if().unwrap();
        // Only the taken branch leaves 2 behind, so the merge block must write it again.
        write_ctx(&mut s, 0xA000, 2);
        s.end();

        assert_eq!(replay_with_predicate(&s, 1).get(0xA000), Some(2), "{mode:?}");
        assert_eq!(replay_with_predicate(&s, 0).get(0xA000), Some(2), "{mode:?}");
    }
}

#[test]
fn else_section_does_not_inherit_then_state() {
    for mode in MODES {
        let mut s = new_stream(small(mode));
        s.begin(BeginFlags::OPTIMIZE_COMMANDS).unwrap();
        s.begin_if(if_equal_one()).unwrap();
        write_ctx(&mut s, 0xA001, 10);
        s.begin_else().unwrap();
        // Same value as the then-section, which the else path never ran.
        write_ctx(&mut s, 0xA001, 10);
        s.end_if().unwrap();
        s.end();

        assert_eq!(replay_with_predicate(&s, 1).get(0xA001), Some(10), "{mode:?}");
        assert_eq!(replay_with_predicate(&s, 0).get(0xA001), Some(10), "{mode:?}");
    }
}

#[test]
#[should_panic(expected = "end_if() without a matching begin_if()")]
fn unbalanced_end_if_is_fatal() {
    let mut s = new_stream(small(OptimizationMode::None));
    s.begin(BeginFlags::empty()).unwrap();
    let _ = s.end_if();
}

#[test]
fn unresolved_branch_is_a_replay_error() {
    let mut s = new_stream(small(OptimizationMode::None));
    s.begin(BeginFlags::empty()).unwrap();
    let mut cursor = s.reserve_commands().unwrap();
    cursor = s.write_cond_indirect_buffer(
        &if_equal_one(),
        IbTarget::Known {
            va: 0x9000,
            size_words: 2,
        },
        IbTarget::Known {
            va: 0,
            size_words: 0,
        },
        cursor,
    );
    s.commit_commands(cursor);
    s.end();

    let mut memory = ReplayMemory::new();
    memory.add_stream(&s);
    memory.write_u64(PREDICATE_VA, 0);
    let err = Replayer::new(&memory)
        .execute_stream(&mut RegisterFile::new(), &s)
        .unwrap_err();
    assert_eq!(
        err,
        ReplayError::UnresolvedBranch {
            va: s.chunks()[0].va()
        }
    );
}

#[test]
fn allocation_failure_is_reported_to_the_writer() {
    let config = small(OptimizationMode::None);
    let mut s = CmdStream::new(
        config,
        Arc::new(RegisterTable::new()),
        LinearCmdAllocator::new(0).with_max_chunks(1),
    )
    .unwrap();
    s.begin(BeginFlags::empty()).unwrap();
    let result = (0..20).try_for_each(|i| {
        let cursor = s.reserve_commands()?;
        let cursor = s.write_set_one_context_reg(0xA000 + i, i, cursor);
        s.commit_commands(cursor);
        Ok::<_, CmdStreamError>(())
    });
    assert_eq!(
        result,
        Err(CmdStreamError::OutOfMemory {
            requested_words: 32
        })
    );
}

#[test]
fn failed_chunk_allocation_leaves_the_block_open() {
    for mode in MODES {
        let mut s = CmdStream::new(
            small(mode),
            Arc::new(RegisterTable::new()),
            FlakyAllocator::new(0x40_0000),
        )
        .unwrap();
        s.begin(BeginFlags::OPTIMIZE_COMMANDS).unwrap();
        // Twelve two-word writes leave 8 words, less than the reservation plus the trailer.
        for i in 0..12 {
            write_ctx(&mut s, 0xA000 + i, i);
        }
        let used = s.chunks()[0].used();
        assert_eq!(used, 24);

        s.allocator().fail_next.set(true);
        assert_eq!(
            s.reserve_commands().unwrap_err(),
            CmdStreamError::OutOfMemory {
                requested_words: 32
            },
            "{mode:?}"
        );
        assert_eq!(s.chunk_count(), 1);
        assert_eq!(s.chunks()[0].used(), used);
        assert!(s.pending_chain_patches().is_empty());
        assert_eq!(s.stats().blocks_sealed, 0);

        // Retrying once memory is back seals the block exactly once.
        write_ctx(&mut s, 0xA020, 5);
        s.end();
        assert_eq!(s.chunk_count(), 2, "{mode:?}");
        assert_eq!(s.chunks()[0].used(), used + 2);
        assert_eq!(s.stats().blocks_sealed, 2);

        let regs = replay_with_predicate(&s, 0);
        assert_eq!(regs.len(), 13, "{mode:?}");
        assert_eq!(regs.get(0xA00B), Some(11));
        assert_eq!(regs.get(0xA020), Some(5));
    }
}

#[test]
fn conditional_section_survives_allocation_failures() {
    for mode in MODES {
        let mut s = CmdStream::new(
            small(mode),
            Arc::new(RegisterTable::new()),
            FlakyAllocator::new(0x40_0000),
        )
        .unwrap();
        s.begin(BeginFlags::OPTIMIZE_COMMANDS).unwrap();
        write_ctx(&mut s, 0xA000, 1);

        s.allocator().fail_next.set(true);
        assert!(s.begin_if(if_equal_one()).is_err());
        assert_eq!(s.chunk_count(), 1);
        assert_eq!(s.chunks()[0].used(), 2);
        s.begin_if(if_equal_one()).unwrap();
        write_ctx(&mut s, 0xA000, 2);

        s.allocator().fail_next.set(true);
        assert!(s.begin_else().is_err());
        s.begin_else().unwrap();
        write_ctx(&mut s, 0xA001, 20);

        s.allocator().fail_next.set(true);
        assert!(s.end_if().is_err());
        assert_eq!(s.chunk_count(), 3);
        s.end_if().unwrap();
        write_ctx(&mut s, 0xA002, 3);
        s.end();
        assert_eq!(s.chunk_count(), 4, "{mode:?}");

        let taken = replay_with_predicate(&s, 1);
        assert_eq!(taken.get(0xA000), Some(2), "{mode:?}");
        assert_eq!(taken.get(0xA001), None, "{mode:?}");
        let skipped = replay_with_predicate(&s, 0);
        assert_eq!(skipped.get(0xA000), Some(1), "{mode:?}");
        assert_eq!(skipped.get(0xA001), Some(20), "{mode:?}");
        assert_eq!(skipped.get(0xA002), Some(3), "{mode:?}");
    }
}

#[test]
fn begin_fails_without_memory() {
    let mut s = CmdStream::new(
        small(OptimizationMode::None),
        Arc::new(RegisterTable::new()),
        LinearCmdAllocator::new(0).with_max_chunks(0),
    )
    .unwrap();
    assert!(matches!(
        s.begin(BeginFlags::empty()),
        Err(CmdStreamError::OutOfMemory { .. })
    ));
}

#[test]
fn invalid_config_is_rejected() {
    let err = CmdStream::new(
        CmdStreamConfig::default().chunk_size_words(4).reserve_limit_words(4),
        Arc::new(RegisterTable::new()),
        LinearCmdAllocator::new(0),
    )
    .unwrap_err();
    assert!(matches!(err, CmdStreamError::InvalidConfig(_)));
}

#[test]
fn tail_chain_links_two_streams() {
    let mut first = new_stream(small(OptimizationMode::None));
    first.begin(BeginFlags::empty()).unwrap();
    write_ctx(&mut first, 0xA000, 1);
    first.end();

    let mut second = CmdStream::new(
        small(OptimizationMode::None),
        Arc::new(RegisterTable::new()),
        LinearCmdAllocator::new(0x80_0000),
    )
    .unwrap();
    second.begin(BeginFlags::empty()).unwrap();
    write_ctx(&mut second, 0xA001, 2);
    second.end();

    let head = &second.chunks()[0];
    first.patch_tail_chain(head.va(), head.used() as u32);

    let mut memory = ReplayMemory::new();
    memory.add_stream(&first);
    memory.add_stream(&second);
    let mut regs = RegisterFile::new();
    Replayer::new(&memory)
        .execute_stream(&mut regs, &first)
        .unwrap();
    assert_eq!(regs.get(0xA000), Some(1));
    assert_eq!(regs.get(0xA001), Some(2));
}

fn record_nested(ib2_chaining: bool) -> CmdStream<LinearCmdAllocator> {
    let config = small(OptimizationMode::None)
        .nested(true)
        .ib2_chaining_supported(ib2_chaining);
    let mut nested = CmdStream::new(
        config,
        Arc::new(RegisterTable::new()),
        LinearCmdAllocator::new(0x100_0000),
    )
    .unwrap();
    nested.begin(BeginFlags::empty()).unwrap();
    for i in 0..30 {
        write_ctx(&mut nested, 0xA100 + i, 100 + i);
    }
    nested.end();
    nested
}

#[test]
fn nested_stream_is_called_and_invalidates_the_caller() {
    for ib2_chaining in [true, false] {
        let nested = record_nested(ib2_chaining);
        assert!(nested.chunk_count() > 1);

        let mut s = new_stream(small(OptimizationMode::Immediate));
        s.begin(BeginFlags::OPTIMIZE_COMMANDS).unwrap();
        write_ctx(&mut s, 0xA100, 7);
        let mut cursor = s.reserve_commands().unwrap();
        cursor = s.execute_nested(&nested, cursor);
        s.commit_commands(cursor);
        // The nested stream overwrote 0xA100, so this write must survive.
        write_ctx(&mut s, 0xA100, 7);
        s.end();

        let calls = if ib2_chaining { 1 } else { nested.chunk_count() };
        let call_count = pm4_protocol::PacketIter::new(s.chunks()[0].words())
            .filter_map(Result::ok)
            .filter(|p| p.indirect_buffer_target().is_some_and(|(_, _, chain)| !chain))
            .count();
        assert_eq!(call_count, calls);

        let mut memory = ReplayMemory::new();
        memory.add_stream(&s);
        memory.add_stream(&nested);
        let mut regs = RegisterFile::new();
        Replayer::new(&memory).execute_stream(&mut regs, &s).unwrap();
        assert_eq!(regs.get(0xA100), Some(7));
        assert_eq!(regs.get(0xA11D), Some(129));
    }
}

#[test]
fn sh_writes_survive_block_boundaries() {
    let mut s = new_stream(small(OptimizationMode::None));
    s.begin(BeginFlags::empty()).unwrap();
    for i in 0..20 {
        let cursor = s.reserve_commands().unwrap();
        let cursor = s.write_set_one_sh_reg(0x2C00 + i, i, ShaderType::Compute, cursor);
        s.commit_commands(cursor);
    }
    s.end();
    let regs = replay_with_predicate(&s, 0);
    assert_eq!(regs.len(), 20);
}
