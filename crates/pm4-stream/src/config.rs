use bitflags::bitflags;
use pm4_protocol::{IbEngine, MAX_IB_SIZE_WORDS};
use serde::{Deserialize, Serialize};

use crate::error::{CmdStreamError, Result};

/// Queue engine a stream records for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    #[default]
    Universal,
    Compute,
    Constant,
}

impl EngineType {
    pub fn ib_engine(self) -> IbEngine {
        match self {
            Self::Constant => IbEngine::Constant,
            Self::Universal | Self::Compute => IbEngine::Draw,
        }
    }
}

/// How redundant register writes are removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMode {
    /// Packets are copied verbatim.
    #[default]
    None,
    /// Each write is checked against the register cache as it is recorded.
    Immediate,
    /// Writes are recorded verbatim and each block is compacted when it is sealed.
    Finalized,
}

bitflags! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct BeginFlags: u32 {
        const OPTIMIZE_COMMANDS = 1 << 0;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmdStreamConfig {
    pub engine: EngineType,
    pub optimization: OptimizationMode,
    /// Capacity of each command chunk.
    pub chunk_size_words: usize,
    /// Space guaranteed by every `reserve_commands` call.
    pub reserve_limit_words: usize,
    /// The stream is executed from another stream rather than submitted directly.
    pub is_nested: bool,
    /// Whether the hardware can chain between the chunks of a nested (IB2) stream.
    pub ib2_chaining_supported: bool,
    pub preemption_enabled: bool,
}

impl Default for CmdStreamConfig {
    fn default() -> Self {
        Self {
            engine: EngineType::Universal,
            optimization: OptimizationMode::None,
            chunk_size_words: 8192,
            reserve_limit_words: 256,
            is_nested: false,
            ib2_chaining_supported: true,
            preemption_enabled: true,
        }
    }
}

impl CmdStreamConfig {
    pub fn new(engine: EngineType) -> Self {
        Self {
            engine,
            ..Self::default()
        }
    }

    pub fn optimization(mut self, mode: OptimizationMode) -> Self {
        self.optimization = mode;
        self
    }

    pub fn chunk_size_words(mut self, words: usize) -> Self {
        self.chunk_size_words = words;
        self
    }

    pub fn reserve_limit_words(mut self, words: usize) -> Self {
        self.reserve_limit_words = words;
        self
    }

    pub fn nested(mut self, is_nested: bool) -> Self {
        self.is_nested = is_nested;
        self
    }

    pub fn ib2_chaining_supported(mut self, supported: bool) -> Self {
        self.ib2_chaining_supported = supported;
        self
    }

    pub fn preemption_enabled(mut self, enabled: bool) -> Self {
        self.preemption_enabled = enabled;
        self
    }

    /// Words reserved at the end of every chunk for the chain trailer.
    pub fn chain_size_words(&self) -> usize {
        if self.is_nested && !self.ib2_chaining_supported {
            // Each chunk of the nested stream gets its own indirect buffer from the caller.
            0
        } else {
            pm4_protocol::INDIRECT_BUFFER_SIZE_WORDS
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_words == 0 {
            return Err(CmdStreamError::InvalidConfig("chunk_size_words must be non-zero"));
        }
        if self.chunk_size_words > MAX_IB_SIZE_WORDS as usize {
            return Err(CmdStreamError::InvalidConfig(
                "chunk_size_words exceeds the indirect buffer size limit",
            ));
        }
        if self.reserve_limit_words == 0 {
            return Err(CmdStreamError::InvalidConfig(
                "reserve_limit_words must be non-zero",
            ));
        }
        if self.reserve_limit_words + self.chain_size_words() > self.chunk_size_words {
            return Err(CmdStreamError::InvalidConfig(
                "reserve_limit_words plus the chain trailer must fit in one chunk",
            ));
        }
        Ok(())
    }
}
