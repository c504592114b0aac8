#![forbid(unsafe_code)]

//! PM4 command stream recording.
//!
//! - [`CmdStream`] records packets into chained chunks of command memory.
//! - [`RegisterWriteOptimizer`] drops register writes that would not change GPU state, either as
//!   they are recorded or when a block is sealed.
//! - [`Replayer`] executes recorded memory against a [`RegisterFile`] so two streams can be
//!   compared by their effect.

mod chain;
mod chunk;
mod cmd_stream;
mod config;
mod error;
mod optimizer;
mod registers;
mod replay;
mod user_data;

pub use chain::{ChainPatch, ChainPatchKind, PacketLocation};
pub use chunk::{AllocError, CmdAllocator, CmdChunk, LinearCmdAllocator, CHUNK_VA_ALIGNMENT};
pub use cmd_stream::{CmdCursor, CmdStream, CmdStreamStats, CondCompare, IbTarget};
pub use config::{BeginFlags, CmdStreamConfig, EngineType, OptimizationMode};
pub use error::{CmdStreamError, ReplayError, Result};
pub use optimizer::{OptimizerStats, RegisterWriteOptimizer};
pub use registers::RegisterTable;
pub use replay::{RegisterFile, ReplayMemory, Replayer, DEFAULT_MAX_IB_DEPTH};
pub use user_data::{UserDataArgs, UserDataEntryMap, MAX_USER_DATA_ENTRIES};
