use pm4_protocol::PacketDecodeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CmdStreamError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CmdStreamError {
    #[error("out of command memory allocating a {requested_words}-word chunk")]
    OutOfMemory { requested_words: usize },

    #[error("invalid command stream config: {0}")]
    InvalidConfig(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("no command memory mapped at 0x{va:x} ({size_words} words)")]
    UnmappedAddress { va: u64, size_words: usize },

    #[error("branch placeholder at 0x{va:x} was never resolved")]
    UnresolvedBranch { va: u64 },

    #[error("decode failed in buffer 0x{va:x}: {source}")]
    Decode {
        va: u64,
        #[source]
        source: PacketDecodeError,
    },

    #[error("indirect buffer nesting exceeds {max_depth} levels")]
    NestingTooDeep { max_depth: usize },

    #[error("user-data table offset {offset} is out of range")]
    UserDataOutOfRange { offset: u32 },
}
