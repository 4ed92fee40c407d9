//! # Worker State and Handlers
//!
//! The RPC-facing side of one worker: the tables map, the server-side
//! iterator registry, the peer proxies, and the lifecycle flags. One
//! handler per request; handler-local failures are returned as errors and
//! encoded into the response frame by the server. Violations of the
//! quiescent protocol — routing violations, unknown tables, stale
//! iterators — additionally mark the worker failed: the master and this
//! worker disagree about state the protocol keeps in sync, and the
//! fail-fast policy stops the worker rather than serving from a world
//! that has diverged.
//!
//! Locking: the worker mutex covers the tables map, the iterator
//! registry, and the lifecycle flags. Routing state (self id + peer
//! proxies) lives in its own small lock so tables can hold it as their
//! router without a Worker<->Table ownership cycle. Shard data is
//! protected by per-shard mutexes inside the tables and is never touched
//! under a worker-level lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use gkv_common::{
    GkvError, GkvResult, HostPort, IteratorBatch, PluginSpec, Request, Response, RunKernelOutcome,
    ShardAssignment, ShardId, TableData, TableId, WorkerId, WorkerStatus, NEW_ITERATOR,
};
use gkv_peer::PeerClient;
use gkv_table::{Router, Table, TablePlugins, DEFAULT_PENDING_LIMIT};
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::kernel::{kernels, KernelScope};
use crate::metrics::Metrics;

/// Tunables for one worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Pending entries per shard before an inline flush.
    pub pending_limit: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            pending_limit: DEFAULT_PENDING_LIMIT,
        }
    }
}

/// Routing state shared with every table as its `Router`.
struct Routing {
    state: Mutex<RoutingState>,
}

#[derive(Default)]
struct RoutingState {
    id: Option<WorkerId>,
    peers: HashMap<WorkerId, Arc<PeerClient>>,
}

impl Router for Routing {
    fn self_id(&self) -> GkvResult<WorkerId> {
        self.state.lock().id.ok_or(GkvError::NotInitialized)
    }

    fn call(&self, worker: WorkerId, request: Request) -> GkvResult<Response> {
        let client = {
            let state = self.state.lock();
            state
                .peers
                .get(&worker)
                .cloned()
                .ok_or(GkvError::UnknownPeer(worker))?
        };
        client.call(&request)
    }
}

/// Protocol violations that poison the worker. All three mean the master
/// and this worker disagree about state a quiescent protocol keeps in
/// sync; the worker stops instead of serving from a diverged world.
fn is_fatal(err: &GkvError) -> bool {
    matches!(
        err,
        GkvError::RoutingViolation { .. }
            | GkvError::UnknownTable(_)
            | GkvError::InvalidIterator(_)
    )
}

/// Server-side iterator cursor, keyed by iterator id.
struct IteratorCursor {
    table: TableId,
    shard: ShardId,
    last_key: Option<Vec<u8>>,
}

struct WorkerState {
    tables: HashMap<TableId, Arc<Table>>,
    iterators: HashMap<u32, IteratorCursor>,
    next_iterator_id: u32,
    registered: bool,
    running: bool,
    failed: bool,
}

/// One worker process: tables, iterators, peers, lifecycle.
pub struct Worker {
    routing: Arc<Routing>,
    state: Mutex<WorkerState>,
    signal: Condvar,
    shutdown: Notify,
    metrics: Metrics,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(options: WorkerOptions) -> Arc<Self> {
        Arc::new(Worker {
            routing: Arc::new(Routing {
                state: Mutex::new(RoutingState::default()),
            }),
            state: Mutex::new(WorkerState {
                tables: HashMap::new(),
                iterators: HashMap::new(),
                next_iterator_id: 0,
                registered: false,
                running: true,
                failed: false,
            }),
            signal: Condvar::new(),
            shutdown: Notify::new(),
            metrics: Metrics::new(),
            options,
        })
    }

    /// This worker's id once `Initialize` has arrived.
    pub fn self_id(&self) -> GkvResult<WorkerId> {
        self.routing.self_id()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Signal the server loop should stop accepting.
    pub fn shutdown_signal(&self) -> &Notify {
        &self.shutdown
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn has_failed(&self) -> bool {
        self.state.lock().failed
    }

    /// Blocks until the master's `Initialize` arrives.
    pub fn wait_for_registration(&self) {
        let mut state = self.state.lock();
        while !state.registered {
            self.signal.wait(&mut state);
        }
    }

    /// Blocks until shutdown. Returns an error when the worker stopped
    /// because of a fatal violation rather than a master `Shutdown`.
    pub fn wait_for_shutdown(&self) -> GkvResult<()> {
        let mut state = self.state.lock();
        while state.running {
            self.signal.wait(&mut state);
        }
        if state.failed {
            return Err(GkvError::Protocol(
                "worker stopped after a fatal violation".to_string(),
            ));
        }
        Ok(())
    }

    /// Dispatches one request to its handler. Errors in the fatal
    /// category mark the worker failed before they are reported.
    pub fn handle(&self, request: Request) -> GkvResult<Response> {
        let result = self.dispatch(request);
        if let Err(err) = &result {
            if is_fatal(err) {
                error!(%err, "fatal protocol violation; worker stopping");
                self.mark_failed();
            }
        }
        result
    }

    fn dispatch(&self, request: Request) -> GkvResult<Response> {
        match request {
            Request::Register { .. } => Err(GkvError::Protocol(
                "register is handled by the master".to_string(),
            )),
            Request::Initialize { id, workers } => self.initialize(id, workers),
            Request::CreateTable {
                id,
                num_shards,
                sharder,
                combiner,
                reducer,
                selector,
            } => self.create_table(id, num_shards, sharder, combiner, reducer, selector),
            Request::AssignShards { assign } => self.assign_shards(assign),
            Request::Get { table, shard, key } => self.get(table, shard, &key),
            Request::Put(data) => self.put(data),
            Request::GetIterator {
                table,
                shard,
                id,
                count,
            } => self.get_iterator(table, shard, id, count),
            Request::RunKernel {
                table,
                shard,
                kernel,
                kernel_args,
                task_args,
            } => self
                .run_kernel(table, shard, &kernel, kernel_args, task_args)
                .map(Response::RunKernel),
            Request::Flush => self.flush_all(),
            Request::DestroyTable { table } => self.destroy_table(table),
            Request::Shutdown => self.shutdown(),
            Request::Status => self.status(),
        }
    }

    /// Looks up a table by id. Kernels and tests reach the data plane
    /// through this.
    pub fn table(&self, id: TableId) -> GkvResult<Arc<Table>> {
        self.state
            .lock()
            .tables
            .get(&id)
            .cloned()
            .ok_or(GkvError::UnknownTable(id))
    }

    /// Marks the worker failed and wakes everything blocked on lifecycle.
    pub(crate) fn mark_failed(&self) {
        {
            let mut state = self.state.lock();
            state.failed = true;
            state.running = false;
        }
        self.signal.notify_all();
        self.shutdown.notify_waiters();
    }

    fn initialize(
        &self,
        id: WorkerId,
        workers: BTreeMap<WorkerId, HostPort>,
    ) -> GkvResult<Response> {
        let peer_count = workers.len().saturating_sub(1);
        {
            let mut routing = self.routing.state.lock();
            routing.id = Some(id);
            routing.peers = workers
                .iter()
                .filter(|(worker, _)| **worker != id)
                .map(|(worker, addr)| {
                    (*worker, Arc::new(PeerClient::connect(addr.to_string())))
                })
                .collect();
        }
        {
            let mut state = self.state.lock();
            state.registered = true;
        }
        self.signal.notify_all();
        info!(worker = id, peers = peer_count, "worker initialized");
        Ok(Response::Ack)
    }

    fn create_table(
        &self,
        id: TableId,
        num_shards: i32,
        sharder: PluginSpec,
        combiner: Option<PluginSpec>,
        reducer: Option<PluginSpec>,
        selector: Option<PluginSpec>,
    ) -> GkvResult<Response> {
        let plugins = TablePlugins::from_specs(
            &sharder,
            combiner.as_ref(),
            reducer.as_ref(),
            selector.as_ref(),
        )?;
        let table = Table::new(
            id,
            num_shards,
            plugins,
            self.routing.clone() as Arc<dyn Router>,
            self.options.pending_limit,
        )?;

        let mut state = self.state.lock();
        if state.tables.contains_key(&id) {
            return Err(GkvError::Protocol(format!("table {id} already exists")));
        }
        state.tables.insert(id, table);
        drop(state);
        info!(table = id, shards = num_shards, "table created");
        Ok(Response::Ack)
    }

    fn assign_shards(&self, assign: Vec<ShardAssignment>) -> GkvResult<Response> {
        let rows = assign.len();
        for row in assign {
            self.table(row.table)?.set_owner(row.shard, row.worker)?;
        }
        debug!(rows, "shard assignment applied");
        Ok(Response::Ack)
    }

    fn get(&self, table: TableId, shard: ShardId, key: &[u8]) -> GkvResult<Response> {
        let me = self.self_id()?;
        let table_ref = self.table(table)?;
        let data = match table_ref.get_local(shard, key)? {
            Some(value) => TableData::hit(
                me,
                table,
                shard,
                gkv_common::KvPair::new(key.to_vec(), value),
            ),
            None => TableData::miss(me, table, shard),
        };
        Ok(Response::TableData(data))
    }

    fn put(&self, data: TableData) -> GkvResult<Response> {
        let me = self.self_id()?;
        let table = self.table(data.table)?;
        let owner = table.owner_of(data.shard)?;
        if owner != me {
            return Err(GkvError::RoutingViolation {
                table: data.table,
                shard: data.shard,
                owner,
                me,
            });
        }

        table.apply_put(&data)?;
        Ok(Response::Ack)
    }

    fn get_iterator(
        &self,
        table: TableId,
        shard: ShardId,
        id: i64,
        count: u32,
    ) -> GkvResult<Response> {
        let table_ref = self.table(table)?;

        let (iterator_id, after) = {
            let mut state = self.state.lock();
            if id == NEW_ITERATOR {
                let iterator_id = state.next_iterator_id;
                state.next_iterator_id = state
                    .next_iterator_id
                    .checked_add(1)
                    .ok_or_else(|| {
                        GkvError::Protocol("iterator id space exhausted".to_string())
                    })?;
                state.iterators.insert(
                    iterator_id,
                    IteratorCursor {
                        table,
                        shard,
                        last_key: None,
                    },
                );
                debug!(table, shard, iterator = iterator_id, "iterator allocated");
                (iterator_id, None)
            } else {
                let iterator_id = u32::try_from(id)
                    .map_err(|_| GkvError::Protocol(format!("bad iterator id {id}")))?;
                let cursor = state
                    .iterators
                    .get(&iterator_id)
                    .ok_or(GkvError::InvalidIterator(iterator_id))?;
                if cursor.table != table || cursor.shard != shard {
                    return Err(GkvError::InvalidIterator(iterator_id));
                }
                (iterator_id, cursor.last_key.clone())
            }
        };

        let (results, done) = table_ref.read_batch(shard, after.as_deref(), count as usize)?;

        {
            let mut state = self.state.lock();
            if done {
                // The client never refills a done iterator; reclaim now.
                state.iterators.remove(&iterator_id);
            } else if let Some(last) = results.last() {
                if let Some(cursor) = state.iterators.get_mut(&iterator_id) {
                    cursor.last_key = Some(last.key.clone());
                }
            }
        }

        self.metrics.record_iterator_batch();
        let row_count = results.len() as u32;
        Ok(Response::Iterator(IteratorBatch {
            id: iterator_id,
            results,
            row_count,
            done,
        }))
    }

    fn run_kernel(
        &self,
        table: TableId,
        shard: ShardId,
        kernel_id: &str,
        kernel_args: BTreeMap<String, String>,
        task_args: BTreeMap<String, String>,
    ) -> GkvResult<RunKernelOutcome> {
        let start = Instant::now();
        let me = self.self_id()?;
        let table_ref = self.table(table)?;
        let owner = table_ref.owner_of(shard)?;
        if owner != me {
            return Err(GkvError::RoutingViolation {
                table,
                shard,
                owner,
                me,
            });
        }

        let mut kernel = kernels().create(kernel_id)?;
        self.metrics.record_kernel();
        debug!(table, shard, kernel = kernel_id, "kernel starting");

        let mut scope = KernelScope::new(self, table, shard, kernel_args, task_args);
        let outcome = match kernel.run(&mut scope) {
            Ok(()) => RunKernelOutcome::ok(start.elapsed().as_secs_f64()),
            Err(err) => {
                // Structured kernel failure: reported, not fatal. The
                // kernel's already-buffered updates stay flushable.
                warn!(table, shard, kernel = kernel_id, %err, "kernel failed");
                RunKernelOutcome::failed(start.elapsed().as_secs_f64(), err.to_string())
            }
        };
        Ok(outcome)
    }

    fn flush_all(&self) -> GkvResult<Response> {
        let tables: Vec<Arc<Table>> = {
            let state = self.state.lock();
            state.tables.values().cloned().collect()
        };

        let mut total = 0u64;
        for table in tables {
            total += table.flush()? as u64;
        }
        self.metrics.record_flushed(total);
        debug!(entries = total, "flush complete");
        Ok(Response::Ack)
    }

    fn destroy_table(&self, table: TableId) -> GkvResult<Response> {
        let mut state = self.state.lock();
        if state.tables.remove(&table).is_none() {
            return Err(GkvError::UnknownTable(table));
        }
        // Live iterators over the table die with it.
        state.iterators.retain(|_, cursor| cursor.table != table);
        drop(state);
        info!(table, "table destroyed");
        Ok(Response::Ack)
    }

    fn shutdown(&self) -> GkvResult<Response> {
        {
            let mut state = self.state.lock();
            state.tables.clear();
            state.iterators.clear();
            state.running = false;
        }
        {
            let mut routing = self.routing.state.lock();
            routing.peers.clear();
        }
        self.signal.notify_all();
        self.shutdown.notify_waiters();
        info!("worker shut down");
        Ok(Response::Ack)
    }

    fn status(&self) -> GkvResult<Response> {
        let (tables, live_iterators) = {
            let state = self.state.lock();
            (state.tables.len() as u32, state.iterators.len() as u32)
        };
        let snapshot = self.metrics.snapshot();
        Ok(Response::Status(WorkerStatus {
            id: self.self_id().unwrap_or(-1),
            tables,
            live_iterators,
            requests: snapshot.requests,
            errors: snapshot.errors,
            kernels: snapshot.kernels,
            flushed_entries: snapshot.flushed_entries,
            iterator_batches: snapshot.iterator_batches,
        }))
    }
}
