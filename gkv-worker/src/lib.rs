//! # GridKV Worker
//!
//! The worker process of a GridKV cluster: hosts shards of sharded
//! in-memory tables, serves peer RPCs against them, and runs user
//! kernels against the shards it owns under the master's direction.

pub mod kernel;
pub mod metrics;
pub mod server;
pub mod worker;

pub use kernel::{kernels, Kernel, KernelRegistry, KernelScope};
pub use metrics::{Metrics, MetricsSnapshot};
pub use server::serve;
pub use worker::{Worker, WorkerOptions};
