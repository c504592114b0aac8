//! Chunked, chained command recording.
//!
//! A [`CmdStream`] records packets into fixed-capacity chunks obtained from a [`CmdAllocator`].
//! Every chunk holds one command block. When a block is sealed its trailer becomes an
//! indirect-buffer packet chaining to the next block; since the next block's address and size
//! are unknown at that point, the trailer starts out as a NOP placeholder and a [`ChainPatch`]
//! is recorded. Pending patches are resolved as soon as their destination block is sealed.
//!
//! Writes are threaded through an explicit [`CmdCursor`]:
//!
//! ```ignore
//! let mut cursor = stream.reserve_commands()?;
//! cursor = stream.write_set_one_context_reg(reg, value, cursor);
//! cursor = stream.write_set_one_sh_reg(other, value, ShaderType::Graphics, cursor);
//! stream.commit_commands(cursor);
//! ```

use std::sync::Arc;

use pm4_protocol::{
    build_copy_data, build_nop, build_set_one_reg, build_set_seq_regs_with_data,
    build_set_sh_reg_data_offset, CompareFunc, CondIndirectBufferArgs, CopyDataArgs, CopyDataDst,
    CopyDataSrc, IndirectBufferArgs, RegisterSpace, ShaderType, COND_INDIRECT_BUFFER_SIZE_WORDS,
    INDIRECT_BUFFER_SIZE_WORDS,
};
use tracing::{debug, trace, warn};

use crate::chain::{ChainPatch, ChainPatchKind, PacketLocation};
use crate::chunk::{CmdAllocator, CmdChunk};
use crate::config::{BeginFlags, CmdStreamConfig, EngineType, OptimizationMode};
use crate::error::{CmdStreamError, Result};
use crate::optimizer::{OptimizerStats, RegisterWriteOptimizer};
use crate::registers::RegisterTable;

/// Next free word of the current block plus the end of the reserved space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdCursor {
    chunk: usize,
    offset: usize,
    limit: usize,
}

impl CmdCursor {
    pub fn chunk(&self) -> usize {
        self.chunk
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Words that can still be written before the cursor runs into the chain trailer.
    pub fn remaining(&self) -> usize {
        self.limit - self.offset
    }

    fn advance(self, words: usize) -> Self {
        Self {
            offset: self.offset + words,
            ..self
        }
    }

    fn location(&self) -> PacketLocation {
        PacketLocation {
            chunk: self.chunk,
            offset: self.offset,
        }
    }
}

/// Destination of an indirect buffer written into the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IbTarget {
    Known { va: u64, size_words: u32 },
    /// Filled in with the next block once it is sealed.
    Deferred,
}

/// `(mem64[compare_va] & mask) <func> reference`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CondCompare {
    pub func: CompareFunc,
    pub compare_va: u64,
    pub reference: u64,
    pub mask: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CmdStreamStats {
    pub blocks_sealed: u64,
    pub chain_patches_resolved: u64,
    /// Words removed by the finalized whole-block pass.
    pub finalized_words_saved: u64,
    pub optimizer: OptimizerStats,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamState {
    Idle,
    Recording,
    Ended,
}

enum Trailer {
    Chain,
    Tail,
    CondChain(CondCompare),
}

/// Branch records of an open `begin_if` waiting for their destination block.
#[derive(Debug)]
struct IfFrame {
    fail: Option<ChainPatch>,
    then_exit: Option<ChainPatch>,
}

pub struct CmdStream<A: CmdAllocator> {
    config: CmdStreamConfig,
    registers: Arc<RegisterTable>,
    allocator: A,
    chunks: Vec<CmdChunk>,
    optimizer: RegisterWriteOptimizer,
    mode: OptimizationMode,
    state: StreamState,
    pending: Vec<ChainPatch>,
    if_stack: Vec<IfFrame>,
    tail_chain: Option<PacketLocation>,
    stats: CmdStreamStats,
}

impl<A: CmdAllocator> std::fmt::Debug for CmdStream<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmdStream")
            .field("config", &self.config)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("chunks", &self.chunks.len())
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

/// Reserved command space behind `cursor`, checked against `words`.
fn cmd_space(chunks: &mut [CmdChunk], cursor: CmdCursor, words: usize) -> &mut [u32] {
    assert!(
        cursor.offset + words <= cursor.limit,
        "{words}-word write overruns the reserved command space ({} words left)",
        cursor.remaining()
    );
    &mut chunks[cursor.chunk].storage_mut()[cursor.offset..cursor.limit]
}

impl<A: CmdAllocator> CmdStream<A> {
    pub fn new(config: CmdStreamConfig, registers: Arc<RegisterTable>, allocator: A) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            optimizer: RegisterWriteOptimizer::new(Arc::clone(&registers)),
            registers,
            allocator,
            chunks: Vec::new(),
            mode: OptimizationMode::None,
            state: StreamState::Idle,
            pending: Vec::new(),
            if_stack: Vec::new(),
            tail_chain: None,
            stats: CmdStreamStats::default(),
        })
    }

    pub fn config(&self) -> &CmdStreamConfig {
        &self.config
    }

    pub fn registers(&self) -> &Arc<RegisterTable> {
        &self.registers
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Start recording. Allocates the first block.
    pub fn begin(&mut self, flags: BeginFlags) -> Result<()> {
        assert!(
            self.state == StreamState::Idle,
            "begin() on a stream that was not reset"
        );

        self.mode = if !flags.contains(BeginFlags::OPTIMIZE_COMMANDS) {
            OptimizationMode::None
        } else if self.config.engine == EngineType::Constant {
            if self.config.optimization != OptimizationMode::None {
                debug!("register write optimization disabled on the constant engine");
            }
            OptimizationMode::None
        } else {
            self.config.optimization
        };

        debug!(mode = ?self.mode, engine = ?self.config.engine, "command stream begin");
        let chunk = self.allocate_block()?;
        self.start_block(chunk);
        self.state = StreamState::Recording;
        Ok(())
    }

    /// Seal the last block as the stream's tail. Every chain patch must be resolved by now.
    pub fn end(&mut self) {
        self.assert_recording();
        assert!(
            self.if_stack.is_empty(),
            "{} conditional block(s) still open at end of stream",
            self.if_stack.len()
        );
        let created = self.seal_current_block(Trailer::Tail);
        debug_assert!(created.is_empty());
        if let Some(patch) = self.pending.first() {
            panic!(
                "unresolved chain patch at end of stream: {patch:?} ({} pending)",
                self.pending.len()
            );
        }
        self.state = StreamState::Ended;
        debug!(
            chunks = self.chunks.len(),
            blocks_sealed = self.stats.blocks_sealed,
            "command stream end"
        );
    }

    /// Drop all recorded commands and return the chunks to the allocator.
    pub fn reset(&mut self) {
        for chunk in self.chunks.drain(..) {
            self.allocator.release_chunk(chunk);
        }
        self.pending.clear();
        self.if_stack.clear();
        self.tail_chain = None;
        self.optimizer.reset();
        self.mode = OptimizationMode::None;
        self.state = StreamState::Idle;
    }

    pub fn optimization_mode(&self) -> OptimizationMode {
        self.mode
    }

    pub fn chunks(&self) -> &[CmdChunk] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn pending_chain_patches(&self) -> &[ChainPatch] {
        &self.pending
    }

    /// Trailer of the last block, left as a NOP for submit-time chaining.
    pub fn tail_chain_location(&self) -> Option<PacketLocation> {
        self.tail_chain
    }

    pub fn stats(&self) -> CmdStreamStats {
        CmdStreamStats {
            optimizer: self.optimizer.stats(),
            ..self.stats
        }
    }

    pub fn is_ended(&self) -> bool {
        self.state == StreamState::Ended
    }

    fn assert_recording(&self) {
        assert!(
            self.state == StreamState::Recording,
            "command stream is not recording ({:?})",
            self.state
        );
    }

    fn check_cursor(&self, cursor: CmdCursor) {
        self.assert_recording();
        assert!(
            cursor.chunk + 1 == self.chunks.len(),
            "stale command cursor for chunk {} (current chunk is {})",
            cursor.chunk,
            self.chunks.len() - 1
        );
    }

    fn current_chunk(&self) -> &CmdChunk {
        let Some(chunk) = self.chunks.last() else {
            panic!("command stream has no current chunk");
        };
        chunk
    }

    /// Allocate the chunk for the next block. Called before the current block is sealed so a
    /// failed allocation leaves the stream untouched.
    fn allocate_block(&mut self) -> Result<CmdChunk> {
        let size = self.config.chunk_size_words;
        self.allocator.allocate_chunk(size).map_err(|err| {
            warn!(requested_words = err.requested_words, "command chunk allocation failed");
            CmdStreamError::OutOfMemory {
                requested_words: err.requested_words,
            }
        })
    }

    fn start_block(&mut self, chunk: CmdChunk) {
        trace!(chunk = self.chunks.len(), va = chunk.va(), "started command block");
        self.chunks.push(chunk);
    }

    /// Guarantee `reserve_limit_words` of space in the current block.
    pub fn reserve_commands(&mut self) -> Result<CmdCursor> {
        self.assert_recording();
        let chain = self.config.chain_size_words();
        let chunk = self.current_chunk();
        if chunk.free() < self.config.reserve_limit_words + chain {
            self.end_current_block(false)?;
        }

        let chunk = self.current_chunk();
        Ok(CmdCursor {
            chunk: self.chunks.len() - 1,
            offset: chunk.used(),
            limit: chunk.capacity() - chain,
        })
    }

    /// Publish everything written up to `cursor`.
    pub fn commit_commands(&mut self, cursor: CmdCursor) {
        self.check_cursor(cursor);
        let chunk = &mut self.chunks[cursor.chunk];
        assert!(
            cursor.offset >= chunk.used() && cursor.offset <= cursor.limit,
            "commit outside of the reserved command space"
        );
        chunk.set_used(cursor.offset);
    }

    /// Seal the current block. Unless this is the end of the stream, a new block is started and
    /// the sealed one chains to it.
    pub fn end_current_block(&mut self, at_end_of_stream: bool) -> Result<()> {
        if at_end_of_stream {
            self.end();
            return Ok(());
        }
        let next = self.allocate_block()?;
        let created = self.seal_current_block(Trailer::Chain);
        self.pending.extend(created);
        self.start_block(next);
        Ok(())
    }

    /// Finish the current block and return the patches its trailer created.
    fn seal_current_block(&mut self, trailer: Trailer) -> Vec<ChainPatch> {
        self.assert_recording();
        let idx = self.chunks.len() - 1;
        let engine = self.config.engine.ib_engine();
        let preemption_enabled = self.config.preemption_enabled;

        if self.mode == OptimizationMode::Finalized {
            // Compaction moves packets, which would strand any placeholder inside this block.
            assert!(
                !self.pending.iter().any(|p| p.location.chunk == idx),
                "finalized optimization with a chain patch pending inside the block"
            );
            let chunk = &mut self.chunks[idx];
            let used = chunk.used();
            let compacted = self.optimizer.optimize_in_place(&mut chunk.storage_mut()[..used]);
            chunk.set_used(compacted);
            self.stats.finalized_words_saved += (used - compacted) as u64;
        }

        let chain_size = self.config.chain_size_words();
        let chunk = &mut self.chunks[idx];
        let location = PacketLocation {
            chunk: idx,
            offset: chunk.used(),
        };
        let patch = |kind| ChainPatch {
            kind,
            location,
            chain: true,
            engine,
            preemption_enabled,
        };

        let mut created = Vec::new();
        match trailer {
            Trailer::Tail | Trailer::Chain if chain_size == 0 => {}
            Trailer::Tail => {
                build_nop(chain_size, &mut chunk.storage_mut()[location.offset..]);
                chunk.set_used(location.offset + chain_size);
                self.tail_chain = Some(location);
            }
            Trailer::Chain => {
                build_nop(chain_size, &mut chunk.storage_mut()[location.offset..]);
                chunk.set_used(location.offset + chain_size);
                created.push(patch(ChainPatchKind::IndirectBuffer));
            }
            Trailer::CondChain(compare) => {
                assert!(
                    chunk.free() >= COND_INDIRECT_BUFFER_SIZE_WORDS,
                    "no room for a conditional chain trailer"
                );
                pm4_protocol::build_cond_indirect_buffer(
                    &CondIndirectBufferArgs {
                        compare_func: compare.func,
                        compare_va: compare.compare_va,
                        reference: compare.reference,
                        mask: compare.mask,
                        chain: true,
                        engine,
                    },
                    &mut chunk.storage_mut()[location.offset..],
                );
                chunk.set_used(location.offset + COND_INDIRECT_BUFFER_SIZE_WORDS);
                created.push(patch(ChainPatchKind::CondIndirectBufferPass));
                created.push(patch(ChainPatchKind::CondIndirectBufferFail));
            }
        }

        let va = chunk.va();
        let used = chunk.used();
        self.stats.blocks_sealed += 1;
        debug!(chunk = idx, va, used_words = used, trailer = created.len(), "sealed command block");

        // This block's extent is final, so everything waiting on it can be resolved.
        self.resolve_chain_patches(va, used as u32);
        created
    }

    /// Resolve every pending patch recorded in a block before the current one.
    pub fn resolve_chain_patches(&mut self, va: u64, size_words: u32) {
        let current = self.chunks.len().saturating_sub(1);
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.location.chunk < current);
        self.pending = waiting;
        if ready.is_empty() {
            return;
        }

        for patch in &ready {
            patch.apply(&mut self.chunks, va, size_words);
        }
        self.stats.chain_patches_resolved += ready.len() as u64;
        debug!(va, size_words, resolved = ready.len(), "resolved chain patches");
    }

    /// Point the ended stream's tail trailer at another command buffer.
    pub fn patch_tail_chain(&mut self, va: u64, size_words: u32) {
        assert!(self.is_ended(), "tail chain patched before end()");
        let Some(location) = self.tail_chain else {
            panic!("stream has no tail chain trailer");
        };
        let patch = ChainPatch {
            kind: ChainPatchKind::IndirectBuffer,
            location,
            chain: true,
            engine: self.config.engine.ib_engine(),
            preemption_enabled: self.config.preemption_enabled,
        };
        patch.apply(&mut self.chunks, va, size_words);
    }

    // ---------------------------------------------------------------------------------------------
    // Register writes
    // ---------------------------------------------------------------------------------------------

    /// Copy a pre-built packet image. In immediate mode the image is filtered by the optimizer.
    pub fn write_pm4_image(&mut self, image: &[u32], cursor: CmdCursor) -> CmdCursor {
        self.check_cursor(cursor);
        let out = cmd_space(&mut self.chunks, cursor, image.len());
        let written = if self.mode == OptimizationMode::Immediate {
            self.optimizer.optimize_pm4_commands(image, out)
        } else {
            out[..image.len()].copy_from_slice(image);
            image.len()
        };
        cursor.advance(written)
    }

    fn write_set_one(
        &mut self,
        space: RegisterSpace,
        reg: u32,
        value: u32,
        shader: ShaderType,
        cursor: CmdCursor,
    ) -> CmdCursor {
        self.check_cursor(cursor);
        if self.mode == OptimizationMode::Immediate {
            let keep = match space {
                RegisterSpace::Context => self.optimizer.must_keep_set_context_reg(reg, value),
                RegisterSpace::Sh => self.optimizer.must_keep_set_sh_reg(reg, value),
                RegisterSpace::Config | RegisterSpace::Uconfig => true,
            };
            if !keep {
                return cursor;
            }
        }
        let out = cmd_space(&mut self.chunks, cursor, 2);
        cursor.advance(build_set_one_reg(space, reg, shader, value, out))
    }

    fn write_set_seq(
        &mut self,
        space: RegisterSpace,
        start_reg: u32,
        end_reg: u32,
        shader: ShaderType,
        values: &[u32],
        cursor: CmdCursor,
    ) -> CmdCursor {
        self.check_cursor(cursor);
        assert!(
            end_reg >= start_reg && values.len() == (end_reg - start_reg + 1) as usize,
            "register range 0x{start_reg:x}..=0x{end_reg:x} does not match {} values",
            values.len()
        );
        let out = cmd_space(&mut self.chunks, cursor, values.len() + 1);
        let written = match (self.mode, space) {
            (OptimizationMode::Immediate, RegisterSpace::Context | RegisterSpace::Sh) => self
                .optimizer
                .write_optimized_set_seq_regs(space, shader, start_reg, values, out),
            _ => build_set_seq_regs_with_data(space, start_reg, shader, values, out),
        };
        cursor.advance(written)
    }

    pub fn write_set_one_context_reg(&mut self, reg: u32, value: u32, cursor: CmdCursor) -> CmdCursor {
        self.write_set_one(RegisterSpace::Context, reg, value, ShaderType::Graphics, cursor)
    }

    pub fn write_set_seq_context_regs(
        &mut self,
        start_reg: u32,
        end_reg: u32,
        values: &[u32],
        cursor: CmdCursor,
    ) -> CmdCursor {
        self.write_set_seq(
            RegisterSpace::Context,
            start_reg,
            end_reg,
            ShaderType::Graphics,
            values,
            cursor,
        )
    }

    pub fn write_context_reg_rmw(
        &mut self,
        reg: u32,
        mask: u32,
        data: u32,
        cursor: CmdCursor,
    ) -> CmdCursor {
        self.check_cursor(cursor);
        if self.mode == OptimizationMode::Immediate
            && !self.optimizer.must_keep_context_reg_rmw(reg, mask, data)
        {
            return cursor;
        }
        let out = cmd_space(&mut self.chunks, cursor, 3);
        cursor.advance(pm4_protocol::build_context_reg_rmw(reg, mask, data, out))
    }

    pub fn write_set_one_sh_reg(
        &mut self,
        reg: u32,
        value: u32,
        shader: ShaderType,
        cursor: CmdCursor,
    ) -> CmdCursor {
        self.write_set_one(RegisterSpace::Sh, reg, value, shader, cursor)
    }

    pub fn write_set_seq_sh_regs(
        &mut self,
        start_reg: u32,
        end_reg: u32,
        shader: ShaderType,
        values: &[u32],
        cursor: CmdCursor,
    ) -> CmdCursor {
        self.write_set_seq(RegisterSpace::Sh, start_reg, end_reg, shader, values, cursor)
    }

    /// Load `reg` from the user-data table at `data_offset`.
    pub fn write_set_sh_reg_data_offset(
        &mut self,
        reg: u32,
        shader: ShaderType,
        data_offset: u32,
        cursor: CmdCursor,
    ) -> CmdCursor {
        self.check_cursor(cursor);
        let out = cmd_space(&mut self.chunks, cursor, 2);
        let written = if self.mode == OptimizationMode::Immediate {
            self.optimizer
                .write_optimized_set_sh_reg_offset(reg, shader, data_offset, out)
        } else {
            build_set_sh_reg_data_offset(reg, shader, data_offset, out)
        };
        cursor.advance(written)
    }

    fn config_space(reg: u32) -> RegisterSpace {
        match RegisterSpace::of(reg) {
            Some(space @ (RegisterSpace::Config | RegisterSpace::Uconfig)) => space,
            _ => panic!("0x{reg:x} is not a config register"),
        }
    }

    /// Write a config or uconfig register, chosen by address. Never optimized.
    pub fn write_set_one_config_reg(&mut self, reg: u32, value: u32, cursor: CmdCursor) -> CmdCursor {
        let space = Self::config_space(reg);
        self.write_set_one(space, reg, value, ShaderType::Graphics, cursor)
    }

    pub fn write_set_seq_config_regs(
        &mut self,
        start_reg: u32,
        end_reg: u32,
        values: &[u32],
        cursor: CmdCursor,
    ) -> CmdCursor {
        let space = Self::config_space(start_reg);
        self.write_set_seq(space, start_reg, end_reg, ShaderType::Graphics, values, cursor)
    }

    /// Write a config register through `COPY_DATA`, the only path to registers that reject
    /// `SET_*` packets.
    pub fn write_set_one_privileged_config_reg(
        &mut self,
        reg: u32,
        value: u32,
        cursor: CmdCursor,
    ) -> CmdCursor {
        Self::config_space(reg);
        self.check_cursor(cursor);
        let dst_sel = if self.registers.is_privileged_config(reg) {
            CopyDataDst::SysPerfCounter
        } else {
            CopyDataDst::Register
        };
        let out = cmd_space(&mut self.chunks, cursor, 5);
        let written = build_copy_data(
            &CopyDataArgs {
                dst_sel,
                dst_addr: u64::from(reg),
                src_sel: CopyDataSrc::Immediate,
                src: u64::from(value),
                count_64: false,
                wr_confirm: false,
            },
            out,
        );
        cursor.advance(written)
    }

    /// Performance counter registers: privileged ones go through `COPY_DATA`, the rest are plain
    /// config writes.
    pub fn write_set_one_perf_ctr_reg(&mut self, reg: u32, value: u32, cursor: CmdCursor) -> CmdCursor {
        if self.registers.is_privileged_config(reg) {
            self.write_set_one_privileged_config_reg(reg, value, cursor)
        } else {
            self.write_set_one_config_reg(reg, value, cursor)
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Control flow
    // ---------------------------------------------------------------------------------------------

    /// Encode an indirect buffer for this stream's engine into `out`.
    pub fn build_indirect_buffer(&self, va: u64, size_words: u32, chain: bool, out: &mut [u32]) -> usize {
        pm4_protocol::build_indirect_buffer(
            &IndirectBufferArgs {
                va,
                size_words,
                chain,
                engine: self.config.engine.ib_engine(),
                preemption_enabled: self.config.preemption_enabled,
            },
            out,
        )
    }

    /// Encode a conditional indirect buffer with both branches unset.
    pub fn build_cond_indirect_buffer(&self, compare: &CondCompare, chain: bool, out: &mut [u32]) -> usize {
        pm4_protocol::build_cond_indirect_buffer(
            &CondIndirectBufferArgs {
                compare_func: compare.func,
                compare_va: compare.compare_va,
                reference: compare.reference,
                mask: compare.mask,
                chain,
                engine: self.config.engine.ib_engine(),
            },
            out,
        )
    }

    fn deferred_patch(&self, kind: ChainPatchKind, location: PacketLocation, chain: bool) -> ChainPatch {
        ChainPatch {
            kind,
            location,
            chain,
            engine: self.config.engine.ib_engine(),
            preemption_enabled: self.config.preemption_enabled,
        }
    }

    /// Write an indirect buffer. A deferred target leaves a placeholder that is resolved with the
    /// next block.
    pub fn write_indirect_buffer(&mut self, target: IbTarget, chain: bool, cursor: CmdCursor) -> CmdCursor {
        self.check_cursor(cursor);
        cmd_space(&mut self.chunks, cursor, INDIRECT_BUFFER_SIZE_WORDS);
        let written = match target {
            IbTarget::Known { va, size_words } => {
                let mut packet = [0u32; INDIRECT_BUFFER_SIZE_WORDS];
                let n = self.build_indirect_buffer(va, size_words, chain, &mut packet);
                cmd_space(&mut self.chunks, cursor, n)[..n].copy_from_slice(&packet);
                n
            }
            IbTarget::Deferred => {
                let patch = self.deferred_patch(ChainPatchKind::IndirectBuffer, cursor.location(), chain);
                self.pending.push(patch);
                build_nop(
                    INDIRECT_BUFFER_SIZE_WORDS,
                    cmd_space(&mut self.chunks, cursor, INDIRECT_BUFFER_SIZE_WORDS),
                )
            }
        };
        cursor.advance(written)
    }

    /// Write a conditional indirect buffer that calls `pass` or `fail` depending on the comparison.
    pub fn write_cond_indirect_buffer(
        &mut self,
        compare: &CondCompare,
        pass: IbTarget,
        fail: IbTarget,
        cursor: CmdCursor,
    ) -> CmdCursor {
        self.check_cursor(cursor);
        let mut packet = [0u32; COND_INDIRECT_BUFFER_SIZE_WORDS];
        let n = self.build_cond_indirect_buffer(compare, false, &mut packet);

        for (target, kind) in [
            (pass, ChainPatchKind::CondIndirectBufferPass),
            (fail, ChainPatchKind::CondIndirectBufferFail),
        ] {
            match target {
                IbTarget::Known { va, size_words } => match kind {
                    ChainPatchKind::CondIndirectBufferPass => {
                        pm4_protocol::patch_cond_indirect_buffer_pass(&mut packet, va, size_words)
                    }
                    _ => pm4_protocol::patch_cond_indirect_buffer_fail(&mut packet, va, size_words),
                },
                IbTarget::Deferred => {
                    let patch = self.deferred_patch(kind, cursor.location(), false);
                    self.pending.push(patch);
                }
            }
        }

        cmd_space(&mut self.chunks, cursor, n)[..n].copy_from_slice(&packet);
        cursor.advance(n)
    }

    /// Open a conditional section. The current block ends with a conditional chain: the pass
    /// branch continues into the next block, the fail branch skips to the matching
    /// `begin_else` / `end_if`.
    pub fn begin_if(&mut self, compare: CondCompare) -> Result<()> {
        self.assert_recording();
        assert!(
            self.config.chain_size_words() > 0,
            "conditional sections need chaining between blocks"
        );
        assert!(
            self.config.chunk_size_words >= COND_INDIRECT_BUFFER_SIZE_WORDS,
            "chunks are too small for a conditional chain"
        );
        if self.current_chunk().free() < COND_INDIRECT_BUFFER_SIZE_WORDS {
            self.end_current_block(false)?;
        }

        let next = self.allocate_block()?;
        let created = self.seal_current_block(Trailer::CondChain(compare));
        let mut fail = None;
        for patch in created {
            match patch.kind {
                ChainPatchKind::CondIndirectBufferFail => fail = Some(patch),
                _ => self.pending.push(patch),
            }
        }
        self.if_stack.push(IfFrame {
            fail,
            then_exit: None,
        });
        self.start_block(next);
        Ok(())
    }

    /// Switch from the then-section to the else-section of the innermost `begin_if`.
    pub fn begin_else(&mut self) -> Result<()> {
        self.assert_recording();
        assert!(
            self.if_stack.last().is_some_and(|f| f.fail.is_some()),
            "begin_else() without a matching begin_if()"
        );

        let next = self.allocate_block()?;
        let then_exit = self.seal_current_block(Trailer::Chain).pop();
        if let Some(frame) = self.if_stack.last_mut() {
            frame.then_exit = then_exit;
            self.pending.extend(frame.fail.take());
        }
        // The else-section starts from the state before the if.
        self.optimizer.reset();
        self.start_block(next);
        Ok(())
    }

    /// Close the innermost conditional section. Both paths merge into the next block.
    pub fn end_if(&mut self) -> Result<()> {
        self.assert_recording();
        assert!(
            !self.if_stack.is_empty(),
            "end_if() without a matching begin_if()"
        );

        let next = self.allocate_block()?;
        let exit = self.seal_current_block(Trailer::Chain);
        self.pending.extend(exit);
        if let Some(frame) = self.if_stack.pop() {
            self.pending.extend(frame.fail);
            self.pending.extend(frame.then_exit);
        }
        self.optimizer.reset();
        self.start_block(next);
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // External state changes
    // ---------------------------------------------------------------------------------------------

    /// An SH register was written by something the optimizer cannot see.
    pub fn notify_indirect_sh_reg_write(&mut self, reg: u32) {
        if self.mode == OptimizationMode::Immediate {
            self.optimizer.set_sh_reg_invalid(reg);
        }
    }

    /// A nested command buffer ran; any register may have changed.
    pub fn notify_nested_cmd_buffer_execute(&mut self) {
        if self.mode == OptimizationMode::Immediate {
            self.optimizer.reset();
        }
    }

    /// Call into an ended nested stream. Streams whose chunks cannot chain are called chunk by
    /// chunk.
    pub fn execute_nested<B: CmdAllocator>(&mut self, nested: &CmdStream<B>, cursor: CmdCursor) -> CmdCursor {
        self.check_cursor(cursor);
        assert!(nested.config.is_nested, "only nested streams can be executed from another stream");
        assert!(nested.is_ended(), "nested stream must be ended before it is executed");

        let targets: Vec<&CmdChunk> = if nested.config.chain_size_words() > 0 {
            nested.chunks.first().into_iter().collect()
        } else {
            nested.chunks.iter().collect()
        };

        let mut cursor = cursor;
        for chunk in targets {
            cursor = self.write_indirect_buffer(
                IbTarget::Known {
                    va: chunk.va(),
                    size_words: chunk.used() as u32,
                },
                false,
                cursor,
            );
        }
        self.notify_nested_cmd_buffer_execute();
        cursor
    }
}

impl<A: CmdAllocator> Drop for CmdStream<A> {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            self.allocator.release_chunk(chunk);
        }
    }
}
