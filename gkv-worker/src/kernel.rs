//! # Kernel Runtime
//!
//! User-supplied computations bound to one `(table, shard)` and executed
//! on the shard's owning worker. Kernels see the cluster through a
//! `KernelScope`: reads and writes route through the tables exactly like
//! any other caller, so a kernel mutates remote shards only via pending
//! buffers and an explicit flush.
//!
//! Kernels are looked up by string id in a process-wide registry, the
//! same dispatch shape as the table plug-ins. Register before the master
//! starts issuing `RunKernel`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use gkv_common::{GkvError, GkvResult, ShardId, TableId};
use gkv_table::TableIter;
use parking_lot::RwLock;

use crate::worker::Worker;

/// A run-to-completion computation against one shard.
///
/// `run` may block on remote reads and buffers writes like any table
/// caller. Returning an error is the structured failure path: the worker
/// reports it to the master and stays healthy.
pub trait Kernel: Send {
    fn run(&mut self, scope: &mut KernelScope<'_>) -> GkvResult<()>;
}

impl std::fmt::Debug for dyn Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel").finish()
    }
}

/// Everything a kernel sees while running: its binding, its arguments,
/// and the data plane of every table this worker knows.
pub struct KernelScope<'a> {
    worker: &'a Worker,
    table: TableId,
    shard: ShardId,
    kernel_args: BTreeMap<String, String>,
    task_args: BTreeMap<String, String>,
}

impl<'a> KernelScope<'a> {
    pub(crate) fn new(
        worker: &'a Worker,
        table: TableId,
        shard: ShardId,
        kernel_args: BTreeMap<String, String>,
        task_args: BTreeMap<String, String>,
    ) -> Self {
        KernelScope {
            worker,
            table,
            shard,
            kernel_args,
            task_args,
        }
    }

    /// Table this kernel is bound to.
    pub fn table_id(&self) -> TableId {
        self.table
    }

    /// Shard this kernel is bound to; always locally owned.
    pub fn shard_id(&self) -> ShardId {
        self.shard
    }

    pub fn kernel_arg(&self, name: &str) -> Option<&str> {
        self.kernel_args.get(name).map(String::as_str)
    }

    pub fn task_arg(&self, name: &str) -> Option<&str> {
        self.task_args.get(name).map(String::as_str)
    }

    /// Reads a key from any table, local or remote.
    pub fn get(&self, table: TableId, key: &[u8]) -> GkvResult<Option<Vec<u8>>> {
        self.worker.table(table)?.get(key)
    }

    /// Writes through the table's combiner; remote shards buffer until
    /// flush.
    pub fn update(&self, table: TableId, key: &[u8], value: &[u8]) -> GkvResult<()> {
        self.worker.table(table)?.update(key, value)
    }

    /// Iterates one shard of any table, local or remote.
    pub fn iterate(&self, table: TableId, shard: ShardId) -> GkvResult<TableIter> {
        self.worker.table(table)?.iterate(shard)
    }

    /// `iterate` with an explicit remote prefetch size.
    pub fn iterate_with(&self, table: TableId, shard: ShardId, fetch: u32) -> GkvResult<TableIter> {
        self.worker.table(table)?.iterate_with(shard, fetch)
    }

    /// Ships a table's pending buffers to their owners. Blocks until
    /// every put is acked; a following `get` observes the flushed state.
    pub fn flush(&self, table: TableId) -> GkvResult<usize> {
        self.worker.table(table)?.flush()
    }
}

type KernelFactory = Arc<dyn Fn() -> Box<dyn Kernel> + Send + Sync>;

/// String-keyed kernel factories.
pub struct KernelRegistry {
    entries: RwLock<HashMap<String, KernelFactory>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        KernelRegistry {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a kernel factory under `id`, replacing any previous one.
    pub fn register<F>(&self, id: &str, factory: F)
    where
        F: Fn() -> Box<dyn Kernel> + Send + Sync + 'static,
    {
        self.entries
            .write()
            .insert(id.to_string(), Arc::new(factory));
    }

    /// Instantiates a fresh kernel for one `RunKernel` dispatch.
    pub fn create(&self, id: &str) -> GkvResult<Box<dyn Kernel>> {
        let factory = {
            let entries = self.entries.read();
            entries.get(id).cloned()
        };
        match factory {
            Some(factory) => Ok(factory()),
            None => Err(GkvError::UnknownPlugin {
                kind: "kernel",
                id: id.to_string(),
            }),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        KernelRegistry::new()
    }
}

/// Process-wide kernel registry.
pub fn kernels() -> &'static KernelRegistry {
    static REGISTRY: OnceLock<KernelRegistry> = OnceLock::new();
    REGISTRY.get_or_init(KernelRegistry::new)
}
