//! # GridKV Shared Types
//!
//! Wire messages, framing, id types, and the error type shared by the
//! table engine, the peer proxy, and the worker process.

pub mod error;
pub mod frame;
pub mod protocol;
pub mod types;

pub use error::{GkvError, GkvResult};
pub use protocol::{
    IteratorBatch, PluginSpec, Request, Response, RunKernelOutcome, ShardAssignment, TableData,
    WorkerStatus, NEW_ITERATOR,
};
pub use types::{HostPort, KvPair, ShardId, TableId, WorkerId, UNASSIGNED};
