#![forbid(unsafe_code)]

//! PM4 command-stream encoder.
//!
//! Re-exports the packet layer ([`protocol`]) and the recording layer ([`stream`]) so embedders
//! can depend on a single crate.

pub use pm4_protocol as protocol;
pub use pm4_stream as stream;

pub use pm4_protocol::{CompareFunc, Opcode, RegisterSpace, ShaderType};
pub use pm4_stream::{
    BeginFlags, CmdAllocator, CmdCursor, CmdStream, CmdStreamConfig, CmdStreamError, CondCompare,
    EngineType, IbTarget, LinearCmdAllocator, OptimizationMode, RegisterTable,
};
