//! # Core Id and Pair Types
//!
//! Identifiers shared across the cluster plus the key/value pair that
//! travels in batches. Keys and values are opaque byte strings; the engine
//! never interprets them outside a table's configured plug-ins.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a table cluster-wide. Assigned by the master.
pub type TableId = i32;

/// Index of a shard within its table, in `[0, num_shards)`.
pub type ShardId = i32;

/// Identifies a worker cluster-wide. Assigned by the master on `Initialize`.
pub type WorkerId = i32;

/// Owner value for a shard that has not been assigned yet.
pub const UNASSIGNED: WorkerId = -1;

/// Network location of a worker or the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        HostPort {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One key/value entry inside a batch message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KvPair {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        KvPair {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Debug for KvPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KvPair({:?} => {})",
            String::from_utf8_lossy(&self.key),
            if self.value.len() <= 32 {
                format!("{:?}", String::from_utf8_lossy(&self.value))
            } else {
                format!("{}B", self.value.len())
            }
        )
    }
}
