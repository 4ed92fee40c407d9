//! # GridKV Peer Proxy
//!
//! Synchronous RPC client for talking to peer workers and the master.
//! Kernel threads block on remote reads by design, so the proxy is plain
//! blocking I/O; connection reuse keeps dial setup off the hot path.

mod client;

pub use client::{PeerClient, PeerConfig};
