//! # Error Type
//!
//! One error enum shared by every crate in the workspace. Handler-local
//! failures are encoded into response frames; routing violations are fatal
//! by policy and only reported before the worker stops.

use thiserror::Error;

use crate::types::{ShardId, TableId, WorkerId};

/// Result alias used throughout the workspace.
pub type GkvResult<T> = Result<T, GkvError>;

/// Errors surfaced by the table engine, the peer proxy, and the worker.
#[derive(Debug, Error)]
pub enum GkvError {
    /// Operation referenced a table this worker does not know.
    #[error("unknown table {0}")]
    UnknownTable(TableId),

    /// Shard index outside `[0, num_shards)` or not usable for the request.
    #[error("invalid shard {shard} for table {table}")]
    InvalidShard { table: TableId, shard: ShardId },

    /// Iterator id not present in the server-side registry.
    #[error("invalid iterator {0}")]
    InvalidIterator(u32),

    /// A kernel or put arrived for a shard this worker does not own.
    /// Fatal: the master's routing table and ours disagree.
    #[error("routing violation: table {table} shard {shard} is owned by worker {owner}, not {me}")]
    RoutingViolation {
        table: TableId,
        shard: ShardId,
        owner: WorkerId,
        me: WorkerId,
    },

    /// Structured failure raised by user kernel code. The worker stays
    /// healthy; the message is returned to the master.
    #[error("kernel failed: {0}")]
    Kernel(String),

    /// Network or I/O failure while talking to a peer or the master.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// Frame or message decoding failure.
    #[error("protocol: {0}")]
    Protocol(String),

    /// A peer answered with an error frame.
    #[error("peer error: {0}")]
    Remote(String),

    /// No factory registered under this id.
    #[error("unknown {kind} plugin {id:?}")]
    UnknownPlugin { kind: &'static str, id: String },

    /// An accumulator could not decode a value it was asked to merge.
    #[error("bad value: {0}")]
    Value(String),

    /// The worker has not received `Initialize` from the master yet.
    #[error("worker is not initialized")]
    NotInitialized,

    /// No peer proxy for the requested worker id.
    #[error("unknown peer worker {0}")]
    UnknownPeer(WorkerId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_violation_names_both_workers() {
        let err = GkvError::RoutingViolation {
            table: 3,
            shard: 1,
            owner: 2,
            me: 0,
        };
        let text = err.to_string();
        assert!(text.contains("owned by worker 2"));
        assert!(text.contains("not 0"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: GkvError = io.into();
        assert!(matches!(err, GkvError::Transport(_)));
    }
}
