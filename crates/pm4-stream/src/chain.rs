use pm4_protocol::{
    patch_cond_indirect_buffer_fail, patch_cond_indirect_buffer_pass, patch_indirect_buffer,
    IbEngine,
};

use crate::chunk::CmdChunk;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainPatchKind {
    /// Unconditional chain from the end of a block.
    IndirectBuffer,
    /// Branch of a conditional indirect buffer taken when the comparison passes.
    CondIndirectBufferPass,
    /// Branch of a conditional indirect buffer taken when the comparison fails.
    CondIndirectBufferFail,
}

/// Position of a packet inside a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketLocation {
    pub chunk: usize,
    pub offset: usize,
}

/// A control-flow packet whose destination is not known yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainPatch {
    pub kind: ChainPatchKind,
    pub location: PacketLocation,
    /// Execution does not return from the target. Only meaningful for `IndirectBuffer`.
    pub chain: bool,
    pub engine: IbEngine,
    pub preemption_enabled: bool,
}

impl ChainPatch {
    /// Overwrite the placeholder with the final destination.
    ///
    /// Each record only touches its own packet, so records may be applied in any order.
    pub fn apply(&self, chunks: &mut [CmdChunk], va: u64, size_words: u32) {
        let chunk = &mut chunks[self.location.chunk];
        let packet = &mut chunk.storage_mut()[self.location.offset..];
        match self.kind {
            ChainPatchKind::IndirectBuffer => patch_indirect_buffer(
                packet,
                va,
                size_words,
                self.chain,
                self.engine,
                self.preemption_enabled,
            ),
            ChainPatchKind::CondIndirectBufferPass => {
                patch_cond_indirect_buffer_pass(packet, va, size_words)
            }
            ChainPatchKind::CondIndirectBufferFail => {
                patch_cond_indirect_buffer_fail(packet, va, size_words)
            }
        }
    }
}
