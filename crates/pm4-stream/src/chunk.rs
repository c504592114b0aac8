//! Command memory chunks and the allocator interface that hands them out.

use thiserror::Error;
use tracing::{debug, warn};

/// GPU VA alignment of every chunk handed out by [`LinearCmdAllocator`].
pub const CHUNK_VA_ALIGNMENT: u64 = 0x1000;

/// One fixed-capacity block of command memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmdChunk {
    va: u64,
    words: Box<[u32]>,
    used: usize,
}

impl CmdChunk {
    pub fn new(va: u64, capacity_words: usize) -> Self {
        assert!(va & 0x3 == 0, "chunk VA 0x{va:x} is not dword aligned");
        Self {
            va,
            words: vec![0; capacity_words].into_boxed_slice(),
            used: 0,
        }
    }

    pub fn va(&self) -> u64 {
        self.va
    }

    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free(&self) -> usize {
        self.words.len() - self.used
    }

    /// Recorded commands.
    pub fn words(&self) -> &[u32] {
        &self.words[..self.used]
    }

    /// Recorded commands as raw bytes in host order, ready for upload.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.words())
    }

    pub(crate) fn storage_mut(&mut self) -> &mut [u32] {
        &mut self.words
    }

    pub(crate) fn set_used(&mut self, used: usize) {
        assert!(used <= self.words.len(), "chunk overrun");
        self.used = used;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no command memory left for a {requested_words}-word chunk")]
pub struct AllocError {
    pub requested_words: usize,
}

/// Source of command chunks for a stream.
pub trait CmdAllocator {
    fn allocate_chunk(&mut self, size_words: usize) -> Result<CmdChunk, AllocError>;

    fn release_chunk(&mut self, chunk: CmdChunk);
}

impl<A: CmdAllocator + ?Sized> CmdAllocator for &mut A {
    fn allocate_chunk(&mut self, size_words: usize) -> Result<CmdChunk, AllocError> {
        (**self).allocate_chunk(size_words)
    }

    fn release_chunk(&mut self, chunk: CmdChunk) {
        (**self).release_chunk(chunk)
    }
}

/// Bump allocator over a flat VA range. Released chunks are recycled before new VA is handed out.
#[derive(Debug)]
pub struct LinearCmdAllocator {
    next_va: u64,
    max_chunks: Option<usize>,
    live_chunks: usize,
    free: Vec<CmdChunk>,
}

impl LinearCmdAllocator {
    pub fn new(base_va: u64) -> Self {
        assert!(
            base_va % CHUNK_VA_ALIGNMENT == 0,
            "allocator base 0x{base_va:x} is not page aligned"
        );
        Self {
            next_va: base_va,
            max_chunks: None,
            live_chunks: 0,
            free: Vec::new(),
        }
    }

    /// Cap the number of chunks that may be live at once.
    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = Some(max_chunks);
        self
    }

    pub fn live_chunks(&self) -> usize {
        self.live_chunks
    }
}

impl CmdAllocator for LinearCmdAllocator {
    fn allocate_chunk(&mut self, size_words: usize) -> Result<CmdChunk, AllocError> {
        if self.max_chunks.is_some_and(|max| self.live_chunks >= max) {
            warn!(
                size_words,
                live_chunks = self.live_chunks,
                "command chunk budget exhausted"
            );
            return Err(AllocError {
                requested_words: size_words,
            });
        }

        let recycled = self
            .free
            .iter()
            .position(|c| c.capacity() == size_words)
            .map(|idx| self.free.swap_remove(idx));
        let chunk = match recycled {
            Some(mut chunk) => {
                chunk.words.fill(0);
                chunk.used = 0;
                chunk
            }
            None => {
                let va = self.next_va;
                let bytes = (size_words as u64 * 4).next_multiple_of(CHUNK_VA_ALIGNMENT);
                self.next_va = va.checked_add(bytes).ok_or(AllocError {
                    requested_words: size_words,
                })?;
                CmdChunk::new(va, size_words)
            }
        };

        self.live_chunks += 1;
        debug!(
            va = chunk.va(),
            capacity_words = chunk.capacity(),
            "allocated command chunk"
        );
        Ok(chunk)
    }

    fn release_chunk(&mut self, chunk: CmdChunk) {
        self.live_chunks = self.live_chunks.saturating_sub(1);
        self.free.push(chunk);
    }
}
