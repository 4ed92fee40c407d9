//! # Sharded Table
//!
//! A named collection of shards plus the plug-ins that parameterize it.
//! The table routes every data-plane call: locally-owned shards are served
//! under their per-shard lock, everything else goes through the `Router`
//! seam to the owning peer.
//!
//! Locking: the routing vector sits behind its own `RwLock` (replaced
//! wholesale on assignment broadcasts), each shard behind its own mutex.
//! Shard locks are never held across network calls; flush drains under the
//! lock and ships after releasing it.

use std::sync::Arc;

use gkv_common::{
    GkvError, GkvResult, KvPair, PluginSpec, Request, Response, ShardId, TableData, TableId,
    WorkerId, UNASSIGNED,
};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::iter::{LocalIterator, RemoteIterator, TableIter, DEFAULT_FETCH};
use crate::plugin::{identity_selector, replace_accumulator, Accumulator, Selector, Sharder};
use crate::registry;
use crate::shard::Shard;

/// Pending entries per shard before an inline flush of that shard.
pub const DEFAULT_PENDING_LIMIT: usize = 8192;

/// The worker-facing seam the table sends RPCs through. Implemented by the
/// worker; the table holds it as a non-owning handle so the worker can own
/// its tables without a reference cycle.
pub trait Router: Send + Sync {
    /// This worker's id, once the master has assigned one.
    fn self_id(&self) -> GkvResult<WorkerId>;

    /// Sends one request to a peer worker and waits for its response.
    fn call(&self, worker: WorkerId, request: Request) -> GkvResult<Response>;
}

/// The four plug-in slots of a table, fully materialized.
pub struct TablePlugins {
    pub sharder: Arc<dyn Sharder>,
    pub combiner: Arc<dyn Accumulator>,
    pub reducer: Arc<dyn Accumulator>,
    pub selector: Arc<dyn Selector>,
}

impl TablePlugins {
    /// Resolves plug-in specs through the process registries. Absent
    /// combiner/reducer fall back to replace, absent selector to identity.
    pub fn from_specs(
        sharder: &PluginSpec,
        combiner: Option<&PluginSpec>,
        reducer: Option<&PluginSpec>,
        selector: Option<&PluginSpec>,
    ) -> GkvResult<Self> {
        let sharder = registry::sharders().create(sharder)?;
        let combiner = match combiner {
            Some(spec) => registry::accumulators().create(spec)?,
            None => replace_accumulator(),
        };
        let reducer = match reducer {
            Some(spec) => registry::accumulators().create(spec)?,
            None => replace_accumulator(),
        };
        let selector = match selector {
            Some(spec) => registry::selectors().create(spec)?,
            None => identity_selector(),
        };
        Ok(TablePlugins {
            sharder,
            combiner,
            reducer,
            selector,
        })
    }
}

/// A sharded key-value table.
pub struct Table {
    id: TableId,
    num_shards: i32,
    plugins: TablePlugins,
    owners: RwLock<Vec<WorkerId>>,
    shards: Vec<Mutex<Shard>>,
    router: Arc<dyn Router>,
    pending_limit: usize,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("num_shards", &self.num_shards)
            .finish()
    }
}

impl Table {
    pub fn new(
        id: TableId,
        num_shards: i32,
        plugins: TablePlugins,
        router: Arc<dyn Router>,
        pending_limit: usize,
    ) -> GkvResult<Arc<Self>> {
        if num_shards <= 0 {
            return Err(GkvError::Protocol(format!(
                "table {id} created with {num_shards} shards"
            )));
        }

        let shards = (0..num_shards)
            .map(|shard| Mutex::new(Shard::new(id, shard)))
            .collect();
        Ok(Arc::new(Table {
            id,
            num_shards,
            plugins,
            owners: RwLock::new(vec![UNASSIGNED; num_shards as usize]),
            shards,
            router,
            pending_limit,
        }))
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn num_shards(&self) -> i32 {
        self.num_shards
    }

    /// Shard a key routes to. Pure: every worker computes the same index.
    pub fn shard_for_key(&self, key: &[u8]) -> ShardId {
        self.plugins.sharder.shard_for(key, self.num_shards)
    }

    fn check_shard(&self, shard: ShardId) -> GkvResult<usize> {
        if shard < 0 || shard >= self.num_shards {
            return Err(GkvError::InvalidShard {
                table: self.id,
                shard,
            });
        }
        Ok(shard as usize)
    }

    /// The worker currently owning `shard`, per the routing table.
    pub fn owner_of(&self, shard: ShardId) -> GkvResult<WorkerId> {
        let idx = self.check_shard(shard)?;
        Ok(self.owners.read()[idx])
    }

    /// Records an assignment broadcast row.
    pub fn set_owner(&self, shard: ShardId, worker: WorkerId) -> GkvResult<()> {
        let idx = self.check_shard(shard)?;
        self.owners.write()[idx] = worker;
        self.shards[idx].lock().set_owner(worker);
        Ok(())
    }

    /// Whether `shard` is served from this worker.
    pub fn is_local(&self, shard: ShardId) -> GkvResult<bool> {
        Ok(self.owner_of(shard)? == self.router.self_id()?)
    }

    /// Reads a key: local shards are served directly, remote shards via a
    /// `Get` RPC to the owner. Missing keys are `Ok(None)`, not errors.
    pub fn get(&self, key: &[u8]) -> GkvResult<Option<Vec<u8>>> {
        let shard = self.shard_for_key(key);
        if self.is_local(shard)? {
            return self.get_local(shard, key);
        }

        let owner = self.owner_of(shard)?;
        let response = self
            .router
            .call(
                owner,
                Request::Get {
                    table: self.id,
                    shard,
                    key: key.to_vec(),
                },
            )?
            .into_result()?;
        match response {
            Response::TableData(data) if data.missing_key => Ok(None),
            Response::TableData(mut data) => match data.kv.pop() {
                Some(pair) => Ok(Some(pair.value)),
                None => Err(GkvError::Protocol(
                    "get reply carried neither a value nor missing_key".to_string(),
                )),
            },
            other => Err(GkvError::Protocol(format!(
                "unexpected get reply: {other:?}"
            ))),
        }
    }

    /// Serves a read from a local shard, applying the selector.
    pub fn get_local(&self, shard: ShardId, key: &[u8]) -> GkvResult<Option<Vec<u8>>> {
        let idx = self.check_shard(shard)?;
        let guard = self.shards[idx].lock();
        Ok(guard.get(key).map(|value| self.plugins.selector.select(value)))
    }

    /// Applies a write. Local shards merge immediately; remote shards
    /// buffer in pending and never block on the network here, except when
    /// the pending buffer crosses its high-water mark and the shard is
    /// flushed inline.
    pub fn update(&self, key: &[u8], value: &[u8]) -> GkvResult<()> {
        let shard = self.shard_for_key(key);
        let idx = self.check_shard(shard)?;
        let locally_owned = self.is_local(shard)?;

        let over_limit = {
            let mut guard = self.shards[idx].lock();
            guard.update(
                key.to_vec(),
                value.to_vec(),
                locally_owned,
                &*self.plugins.combiner,
            )?;
            !locally_owned && guard.pending_len() >= self.pending_limit
        };

        if over_limit {
            self.flush_shard(shard)?;
        }
        Ok(())
    }

    /// Applies an incoming put batch on the owner, entry by entry through
    /// the reducer. The whole batch lands before the caller is answered.
    pub fn apply_put(&self, data: &TableData) -> GkvResult<usize> {
        let idx = self.check_shard(data.shard)?;
        let mut guard = self.shards[idx].lock();
        for pair in &data.kv {
            guard.apply_put(pair.key.clone(), pair.value.clone(), &*self.plugins.reducer)?;
        }
        Ok(data.kv.len())
    }

    /// Ships one shard's pending buffer to its owner. Returns entries sent.
    fn flush_shard(&self, shard: ShardId) -> GkvResult<usize> {
        let idx = self.check_shard(shard)?;
        let batch = {
            let mut guard = self.shards[idx].lock();
            if !guard.dirty() {
                return Ok(0);
            }
            guard.drain_pending()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let owner = self.owner_of(shard)?;
        let count = batch.len();
        debug!(table = self.id, shard, owner, entries = count, "flushing shard");
        let response = self
            .router
            .call(
                owner,
                Request::Put(TableData::put(self.router.self_id()?, self.id, shard, batch)),
            )?
            .into_result()?;
        match response {
            Response::Ack => Ok(count),
            other => Err(GkvError::Protocol(format!(
                "unexpected put reply: {other:?}"
            ))),
        }
    }

    /// Ships every dirty pending buffer to its owner. Returns total
    /// entries sent; completes only after every put has been acked.
    pub fn flush(&self) -> GkvResult<usize> {
        let mut total = 0;
        for shard in 0..self.num_shards {
            if !self.is_local(shard)? {
                total += self.flush_shard(shard)?;
            }
        }
        Ok(total)
    }

    /// Opens an iterator over one shard: a cursor over the local map when
    /// owned here, a prefetching remote iterator otherwise.
    pub fn iterate(self: &Arc<Self>, shard: ShardId) -> GkvResult<TableIter> {
        self.iterate_with(shard, DEFAULT_FETCH)
    }

    /// `iterate` with an explicit prefetch batch size for remote shards.
    pub fn iterate_with(self: &Arc<Self>, shard: ShardId, fetch: u32) -> GkvResult<TableIter> {
        self.check_shard(shard)?;
        if self.is_local(shard)? {
            Ok(TableIter::Local(LocalIterator::new(Arc::clone(self), shard)?))
        } else {
            let owner = self.owner_of(shard)?;
            Ok(TableIter::Remote(RemoteIterator::open(
                Arc::clone(&self.router),
                owner,
                self.id,
                shard,
                fetch,
            )?))
        }
    }

    /// First entry strictly after `after`; the local cursor primitive.
    pub(crate) fn next_entry(
        &self,
        shard: ShardId,
        after: Option<&[u8]>,
    ) -> GkvResult<Option<(Vec<u8>, Vec<u8>)>> {
        let idx = self.check_shard(shard)?;
        Ok(self.shards[idx].lock().next_after(after))
    }

    /// Up to `count` entries strictly after `after`, plus end-of-shard.
    /// Serves the server side of the remote-iterator protocol.
    pub fn read_batch(
        &self,
        shard: ShardId,
        after: Option<&[u8]>,
        count: usize,
    ) -> GkvResult<(Vec<KvPair>, bool)> {
        let idx = self.check_shard(shard)?;
        Ok(self.shards[idx].lock().batch_after(after, count))
    }

    /// Entries stored in a local shard; pending buffers excluded.
    pub fn shard_len(&self, shard: ShardId) -> GkvResult<u64> {
        let idx = self.check_shard(shard)?;
        Ok(self.shards[idx].lock().len())
    }

    /// Pending entries buffered for a shard owned elsewhere.
    pub fn shard_pending(&self, shard: ShardId) -> GkvResult<usize> {
        let idx = self.check_shard(shard)?;
        Ok(self.shards[idx].lock().pending_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Router for single-worker tests: everything is local, any RPC is a
    /// test bug.
    struct LoopbackRouter;

    impl Router for LoopbackRouter {
        fn self_id(&self) -> GkvResult<WorkerId> {
            Ok(0)
        }

        fn call(&self, worker: WorkerId, request: Request) -> GkvResult<Response> {
            panic!("unexpected rpc to worker {worker}: {request:?}");
        }
    }

    /// Router that records put batches and acks them, simulating a healthy
    /// owner on the other side.
    struct RecordingRouter {
        puts: Mutex<Vec<TableData>>,
    }

    impl RecordingRouter {
        fn new() -> Arc<Self> {
            Arc::new(RecordingRouter {
                puts: Mutex::new(Vec::new()),
            })
        }
    }

    impl Router for RecordingRouter {
        fn self_id(&self) -> GkvResult<WorkerId> {
            Ok(0)
        }

        fn call(&self, _worker: WorkerId, request: Request) -> GkvResult<Response> {
            match request {
                Request::Put(data) => {
                    self.puts.lock().push(data);
                    Ok(Response::Ack)
                }
                other => panic!("unexpected rpc: {other:?}"),
            }
        }
    }

    fn plugins(combiner: &str, reducer: &str) -> TablePlugins {
        TablePlugins::from_specs(
            &PluginSpec::new("hash"),
            Some(&PluginSpec::new(combiner)),
            Some(&PluginSpec::new(reducer)),
            None,
        )
        .unwrap()
    }

    fn local_table(num_shards: i32, combiner: &str) -> Arc<Table> {
        let table = Table::new(
            7,
            num_shards,
            plugins(combiner, combiner),
            Arc::new(LoopbackRouter),
            DEFAULT_PENDING_LIMIT,
        )
        .unwrap();
        for shard in 0..num_shards {
            table.set_owner(shard, 0).unwrap();
        }
        table
    }

    #[test]
    fn routing_matches_sharder() {
        let table = local_table(8, "replace");
        for key in [&b"a"[..], b"b", b"some-longer-key"] {
            let expected = table.shard_for_key(key);
            assert!((0..8).contains(&expected));
            table.update(key, b"v").unwrap();
            // The write landed on exactly the shard the sharder names.
            assert_eq!(table.get_local(expected, key).unwrap(), Some(b"v".to_vec()));
            for shard in (0..8).filter(|shard| *shard != expected) {
                assert_eq!(table.get_local(shard, key).unwrap(), None);
            }
        }
    }

    #[test]
    fn local_update_folds_in_issue_order() {
        let table = local_table(4, "sum");
        table.update(b"a", b"1").unwrap();
        table.update(b"a", b"2").unwrap();
        assert_eq!(table.get(b"a").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn selector_applies_on_local_reads() {
        let plugins = TablePlugins::from_specs(
            &PluginSpec::new("hash"),
            None,
            None,
            Some(&PluginSpec::new("len")),
        )
        .unwrap();
        let table = Table::new(1, 2, plugins, Arc::new(LoopbackRouter), DEFAULT_PENDING_LIMIT)
            .unwrap();
        table.set_owner(0, 0).unwrap();
        table.set_owner(1, 0).unwrap();

        table.update(b"key", b"value").unwrap();
        assert_eq!(table.get(b"key").unwrap(), Some(b"5".to_vec()));
    }

    #[test]
    fn missing_key_is_none_not_error() {
        let table = local_table(2, "replace");
        assert_eq!(table.get(b"absent").unwrap(), None);
    }

    #[test]
    fn invalid_shard_is_rejected() {
        let table = local_table(2, "replace");
        assert!(matches!(
            table.owner_of(5).unwrap_err(),
            GkvError::InvalidShard { table: 7, shard: 5 }
        ));
        assert!(matches!(
            table.read_batch(-1, None, 4).unwrap_err(),
            GkvError::InvalidShard { .. }
        ));
    }

    #[test]
    fn remote_updates_buffer_then_flush_ships_them() {
        let router = RecordingRouter::new();
        let table = Table::new(
            3,
            2,
            plugins("sum", "sum"),
            router.clone(),
            DEFAULT_PENDING_LIMIT,
        )
        .unwrap();
        // Worker 0 owns shard 0, worker 1 owns shard 1.
        table.set_owner(0, 0).unwrap();
        table.set_owner(1, 1).unwrap();

        // Drive keys into the remote shard until one lands there.
        let mut remote_keys = Vec::new();
        for idx in 0..32u8 {
            let key = vec![b'k', idx];
            if table.shard_for_key(&key) == 1 {
                remote_keys.push(key);
            }
        }
        assert!(!remote_keys.is_empty());

        let key = remote_keys[0].clone();
        table.update(&key, b"1").unwrap();
        table.update(&key, b"2").unwrap();
        assert_eq!(table.shard_len(1).unwrap(), 0);
        assert_eq!(table.shard_pending(1).unwrap(), 1);

        let flushed = table.flush().unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(table.shard_pending(1).unwrap(), 0);

        let puts = router.puts.lock();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].table, 3);
        assert_eq!(puts[0].shard, 1);
        assert_eq!(puts[0].source, 0);
        // Combined locally before shipping: one entry holding the fold.
        assert_eq!(puts[0].kv, vec![KvPair::new(key, b"3".to_vec())]);
    }

    #[test]
    fn second_flush_is_a_no_op() {
        let router = RecordingRouter::new();
        let table = Table::new(3, 2, plugins("sum", "sum"), router.clone(), 16).unwrap();
        table.set_owner(0, 0).unwrap();
        table.set_owner(1, 1).unwrap();

        let key = (0..32u8)
            .map(|idx| vec![b'k', idx])
            .find(|key| table.shard_for_key(key) == 1)
            .unwrap();
        table.update(&key, b"1").unwrap();
        assert_eq!(table.flush().unwrap(), 1);
        assert_eq!(table.flush().unwrap(), 0);
        assert_eq!(router.puts.lock().len(), 1);
    }

    #[test]
    fn pending_high_water_mark_flushes_inline() {
        let router = RecordingRouter::new();
        // Tiny limit so a handful of distinct keys trips the inline flush.
        let table = Table::new(3, 1, plugins("replace", "replace"), router.clone(), 4).unwrap();
        table.set_owner(0, 1).unwrap();

        for idx in 0..4u8 {
            table.update(&[b'p', idx], b"v").unwrap();
        }
        let puts = router.puts.lock();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].kv.len(), 4);
        drop(puts);
        assert_eq!(table.shard_pending(0).unwrap(), 0);
    }

    #[test]
    fn apply_put_uses_reducer() {
        let table = local_table(2, "replace");
        // Reducer is replace here; seed then overwrite through a batch.
        let shard = table.shard_for_key(b"x");
        table.update(b"x", b"old").unwrap();
        let data = TableData::put(1, 7, shard, vec![KvPair::new(b"x".to_vec(), b"new".to_vec())]);
        assert_eq!(table.apply_put(&data).unwrap(), 1);
        assert_eq!(table.get(b"x").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn remote_get_decodes_hit_and_miss() {
        struct GetRouter;
        impl Router for GetRouter {
            fn self_id(&self) -> GkvResult<WorkerId> {
                Ok(0)
            }
            fn call(&self, worker: WorkerId, request: Request) -> GkvResult<Response> {
                assert_eq!(worker, 1);
                match request {
                    Request::Get { table, shard, key } if key == b"hit" => Ok(
                        Response::TableData(TableData::hit(
                            1,
                            table,
                            shard,
                            KvPair::new(key, b"found".to_vec()),
                        )),
                    ),
                    Request::Get { table, shard, .. } => {
                        Ok(Response::TableData(TableData::miss(1, table, shard)))
                    }
                    other => panic!("unexpected rpc: {other:?}"),
                }
            }
        }

        // One shard, owned by worker 1: every key is remote.
        let table = Table::new(
            9,
            1,
            plugins("replace", "replace"),
            Arc::new(GetRouter),
            DEFAULT_PENDING_LIMIT,
        )
        .unwrap();
        table.set_owner(0, 1).unwrap();

        assert_eq!(table.get(b"hit").unwrap(), Some(b"found".to_vec()));
        assert_eq!(table.get(b"miss").unwrap(), None);
    }
}
