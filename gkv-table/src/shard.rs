//! # Shard Storage
//!
//! The unit of storage: one ordered byte-keyed map plus an outgoing
//! pending buffer. A shard is mutated only under its table's per-shard
//! lock; nothing here synchronizes.
//!
//! Ownership discipline:
//! - Locally-owned shards accumulate writes in `data` (merged through the
//!   table's combiner) and absorb incoming put batches through the
//!   reducer.
//! - Non-owned shards keep `data` empty; every write lands in `pending`
//!   and is shipped to the owner at flush time.

use std::collections::BTreeMap;
use std::ops::Bound;

use gkv_common::{GkvResult, KvPair, ShardId, TableId, WorkerId, UNASSIGNED};

use crate::plugin::Accumulator;

/// One shard of a table.
#[derive(Debug)]
pub struct Shard {
    table: TableId,
    shard: ShardId,
    owner: WorkerId,
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    pending: BTreeMap<Vec<u8>, Vec<u8>>,
    dirty: bool,
}

impl Shard {
    pub fn new(table: TableId, shard: ShardId) -> Self {
        Shard {
            table,
            shard,
            owner: UNASSIGNED,
            data: BTreeMap::new(),
            pending: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn owner(&self) -> WorkerId {
        self.owner
    }

    pub fn set_owner(&mut self, owner: WorkerId) {
        self.owner = owner;
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    /// Number of stored entries (pending excluded).
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Applies a local write. Owned shards merge into `data`; non-owned
    /// shards merge into `pending` and mark the shard dirty.
    pub fn update(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        locally_owned: bool,
        combiner: &dyn Accumulator,
    ) -> GkvResult<()> {
        if locally_owned {
            merge_into(&mut self.data, key, value, combiner)
        } else {
            merge_into(&mut self.pending, key, value, combiner)?;
            self.dirty = true;
            Ok(())
        }
    }

    /// Applies one entry of an incoming put batch on the owner.
    pub fn apply_put(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        reducer: &dyn Accumulator,
    ) -> GkvResult<()> {
        merge_into(&mut self.data, key, value, reducer)
    }

    /// Snapshot-and-clear of the pending buffer, in key order.
    pub fn drain_pending(&mut self) -> Vec<KvPair> {
        self.dirty = false;
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(key, value)| KvPair { key, value })
            .collect()
    }

    /// First entry strictly after `last`, or the first entry when `last`
    /// is `None`. The cursor primitive behind local and server-side
    /// iteration; resuming by key keeps cursors valid without holding the
    /// shard lock between steps.
    pub fn next_after(&self, last: Option<&[u8]>) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut range = match last {
            Some(last) => self
                .data
                .range::<[u8], _>((Bound::Excluded(last), Bound::Unbounded)),
            None => self.data.range::<[u8], _>(..),
        };
        range.next().map(|(key, value)| (key.clone(), value.clone()))
    }

    /// Up to `count` entries strictly after `last`, plus whether the scan
    /// reached the end of the shard.
    pub fn batch_after(&self, last: Option<&[u8]>, count: usize) -> (Vec<KvPair>, bool) {
        let mut range = match last {
            Some(last) => self
                .data
                .range::<[u8], _>((Bound::Excluded(last), Bound::Unbounded)),
            None => self.data.range::<[u8], _>(..),
        };

        let mut results = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            match range.next() {
                Some((key, value)) => results.push(KvPair {
                    key: key.clone(),
                    value: value.clone(),
                }),
                None => return (results, true),
            }
        }

        let done = range.next().is_none();
        (results, done)
    }
}

fn merge_into(
    map: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    key: Vec<u8>,
    value: Vec<u8>,
    accumulator: &dyn Accumulator,
) -> GkvResult<()> {
    match map.get_mut(&key) {
        Some(current) => {
            *current = accumulator.fold(current, &value)?;
        }
        None => {
            map.insert(key, value);
        }
    }
    Ok(())
}
