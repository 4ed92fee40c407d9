//! # Wire Messages
//!
//! Request/response messages exchanged between the master and workers and
//! between peer workers. One `Request` per frame, answered by exactly one
//! `Response` frame; see `frame` for the framing itself.
//!
//! Field semantics:
//! - `TableData` carries both `Get` replies (with `missing_key`) and `Put`
//!   batches (where `missing_key` is unused and left false).
//! - Iterator requests use `id = NEW_ITERATOR` to open a server-side
//!   cursor; every response echoes the id to refill against.
//! - `row_count` on iterator batches mirrors `results.len()` and is
//!   advisory only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{HostPort, KvPair, ShardId, TableId, WorkerId};

/// Iterator id value that asks the server to allocate a new iterator.
pub const NEW_ITERATOR: i64 = -1;

/// Names a pluggable component and its opaque configuration string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub type_id: String,
    #[serde(default)]
    pub opts: String,
}

impl PluginSpec {
    pub fn new(type_id: impl Into<String>) -> Self {
        PluginSpec {
            type_id: type_id.into(),
            opts: String::new(),
        }
    }

    pub fn with_opts(type_id: impl Into<String>, opts: impl Into<String>) -> Self {
        PluginSpec {
            type_id: type_id.into(),
            opts: opts.into(),
        }
    }
}

/// One row of a shard assignment broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub table: TableId,
    pub shard: ShardId,
    pub worker: WorkerId,
}

/// Batch of key/value data scoped to one shard.
///
/// Serves double duty: the reply to `Get` (zero or one pair plus
/// `missing_key`) and the payload of `Put` (the drained pending buffer of
/// a non-owner, applied on the owner through the table's reducer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableData {
    pub source: WorkerId,
    pub table: TableId,
    pub shard: ShardId,
    pub done: bool,
    #[serde(default)]
    pub missing_key: bool,
    pub kv: Vec<KvPair>,
}

impl TableData {
    /// Builds a put batch for one shard.
    pub fn put(source: WorkerId, table: TableId, shard: ShardId, kv: Vec<KvPair>) -> Self {
        TableData {
            source,
            table,
            shard,
            done: true,
            missing_key: false,
            kv,
        }
    }

    /// Builds a `Get` reply carrying a single hit.
    pub fn hit(source: WorkerId, table: TableId, shard: ShardId, pair: KvPair) -> Self {
        TableData {
            source,
            table,
            shard,
            done: true,
            missing_key: false,
            kv: vec![pair],
        }
    }

    /// Builds a `Get` reply for an absent key.
    pub fn miss(source: WorkerId, table: TableId, shard: ShardId) -> Self {
        TableData {
            source,
            table,
            shard,
            done: true,
            missing_key: true,
            kv: Vec::new(),
        }
    }
}

/// One batch of a server-side iterator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IteratorBatch {
    pub id: u32,
    pub results: Vec<KvPair>,
    pub row_count: u32,
    pub done: bool,
}

/// Result of a kernel run. `error` is empty on success; `elapsed` is
/// always set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunKernelOutcome {
    pub elapsed: f64,
    pub error: String,
}

impl RunKernelOutcome {
    pub fn ok(elapsed: f64) -> Self {
        RunKernelOutcome {
            elapsed,
            error: String::new(),
        }
    }

    pub fn failed(elapsed: f64, error: impl Into<String>) -> Self {
        RunKernelOutcome {
            elapsed,
            error: error.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

/// Point-in-time operational summary of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub tables: u32,
    pub live_iterators: u32,
    pub requests: u64,
    pub errors: u64,
    pub kernels: u64,
    pub flushed_entries: u64,
    pub iterator_batches: u64,
}

/// Every message a worker accepts. `Register` is only ever sent, worker to
/// master, and listed here so the master side speaks the same frame type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Worker -> master, announcing its listening address.
    Register { host: String, port: u16 },
    /// Master -> worker: identity plus the full peer address map.
    Initialize {
        id: WorkerId,
        workers: BTreeMap<WorkerId, HostPort>,
    },
    /// Master -> worker, broadcast to every worker with identical content.
    CreateTable {
        id: TableId,
        num_shards: i32,
        sharder: PluginSpec,
        combiner: Option<PluginSpec>,
        reducer: Option<PluginSpec>,
        selector: Option<PluginSpec>,
    },
    /// Master -> worker, broadcast; replaces the routing table wholesale.
    AssignShards { assign: Vec<ShardAssignment> },
    /// Peer -> owner: read one key from an owned shard.
    Get {
        table: TableId,
        shard: ShardId,
        key: Vec<u8>,
    },
    /// Peer -> owner: apply a drained pending batch through the reducer.
    Put(TableData),
    /// Peer -> owner: open or refill a server-side iterator.
    GetIterator {
        table: TableId,
        shard: ShardId,
        id: i64,
        count: u32,
    },
    /// Master -> owning worker: run a registered kernel against one shard.
    RunKernel {
        table: TableId,
        shard: ShardId,
        kernel: String,
        kernel_args: BTreeMap<String, String>,
        task_args: BTreeMap<String, String>,
    },
    /// Master -> worker: ship every pending buffer to its owner.
    Flush,
    /// Master -> worker: drop the table, its shards, and its iterators.
    DestroyTable { table: TableId },
    /// Master -> worker: quiesce and release everything.
    Shutdown,
    /// Operational probe.
    Status,
}

/// Reply to a `Request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ack,
    TableData(TableData),
    Iterator(IteratorBatch),
    RunKernel(RunKernelOutcome),
    Status(WorkerStatus),
    Error { message: String },
}

impl Response {
    /// Maps an error frame back into a typed error; other variants pass
    /// through unchanged.
    pub fn into_result(self) -> crate::error::GkvResult<Response> {
        match self {
            Response::Error { message } => Err(crate::error::GkvError::Remote(message)),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_data_miss_sets_flag() {
        let miss = TableData::miss(0, 1, 2);
        assert!(miss.missing_key);
        assert!(miss.kv.is_empty());

        let hit = TableData::hit(0, 1, 2, KvPair::new(b"k".to_vec(), b"v".to_vec()));
        assert!(!hit.missing_key);
        assert_eq!(hit.kv.len(), 1);
    }

    #[test]
    fn run_kernel_outcome_ok_when_error_empty() {
        assert!(RunKernelOutcome::ok(0.5).is_ok());
        assert!(!RunKernelOutcome::failed(0.5, "boom").is_ok());
    }

    #[test]
    fn request_roundtrips_through_json() {
        let req = Request::GetIterator {
            table: 4,
            shard: 2,
            id: NEW_ITERATOR,
            count: 128,
        };
        let encoded = serde_json::to_vec(&req).unwrap();
        let decoded: Request = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn error_response_maps_to_remote_error() {
        let resp = Response::Error {
            message: "unknown table 9".to_string(),
        };
        let err = resp.into_result().unwrap_err();
        assert!(err.to_string().contains("unknown table 9"));
    }
}
