//! # GridKV Table Engine
//!
//! Sharded in-memory tables: per-shard storage with pending buffers for
//! writes to remote shards, pluggable sharding/merge/read-view behavior,
//! and local plus remote iteration. The engine is transport-agnostic; it
//! reaches peers through the `Router` seam implemented by the worker.

pub mod iter;
pub mod plugin;
pub mod registry;
pub mod shard;
pub mod table;

pub use iter::{LocalIterator, RemoteIterator, TableIter, DEFAULT_FETCH};
pub use plugin::{Accumulator, Selector, Sharder};
pub use registry::{accumulators, selectors, sharders, Registry};
pub use shard::Shard;
pub use table::{Router, Table, TablePlugins, DEFAULT_PENDING_LIMIT};
