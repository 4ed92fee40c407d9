//! # Shard Iterators
//!
//! Cursors over one shard's entries. `LocalIterator` walks the owned map
//! directly; `RemoteIterator` speaks the batch protocol to the owner and
//! refills its buffer as the caller drains it. Both present the same
//! surface, and both observe entries in the shard's key order, so a remote
//! traversal in quiescence sees exactly the local sequence.

use std::sync::Arc;

use gkv_common::{
    GkvError, GkvResult, KvPair, Request, Response, ShardId, TableId, WorkerId, NEW_ITERATOR,
};

use crate::table::{Router, Table};

/// Default number of entries fetched per remote iterator batch.
pub const DEFAULT_FETCH: u32 = 512;

/// Iterator over one shard, local or remote.
pub enum TableIter {
    Local(LocalIterator),
    Remote(RemoteIterator),
}

impl TableIter {
    /// True once every entry has been consumed.
    pub fn done(&self) -> bool {
        match self {
            TableIter::Local(iter) => iter.done(),
            TableIter::Remote(iter) => iter.done(),
        }
    }

    /// Current key, or `None` when the iterator is terminal.
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            TableIter::Local(iter) => iter.key(),
            TableIter::Remote(iter) => iter.key(),
        }
    }

    /// Current value, or `None` when the iterator is terminal.
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            TableIter::Local(iter) => iter.value(),
            TableIter::Remote(iter) => iter.value(),
        }
    }

    /// Advances past the current entry. Remote iterators may refill here.
    pub fn next(&mut self) -> GkvResult<()> {
        match self {
            TableIter::Local(iter) => iter.next(),
            TableIter::Remote(iter) => iter.next(),
        }
    }
}

/// Cursor over a locally-owned shard.
///
/// Resumes by key between steps, so the shard lock is only held inside
/// each step and the cursor survives interleaved mutation of other keys.
pub struct LocalIterator {
    table: Arc<Table>,
    shard: ShardId,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl LocalIterator {
    pub(crate) fn new(table: Arc<Table>, shard: ShardId) -> GkvResult<Self> {
        let current = table.next_entry(shard, None)?;
        Ok(LocalIterator {
            table,
            shard,
            current,
        })
    }

    pub fn done(&self) -> bool {
        self.current.is_none()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(key, _)| key.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, value)| value.as_slice())
    }

    pub fn next(&mut self) -> GkvResult<()> {
        if let Some((last, _)) = self.current.take() {
            self.current = self.table.next_entry(self.shard, Some(&last))?;
        }
        Ok(())
    }
}

/// Prefetching cursor over a shard owned by a peer.
///
/// Opens a server-side iterator on first use, buffers one batch at a
/// time, and refills when the buffer is consumed. Terminal once the
/// server reports `done` and the buffer index has reached its end.
pub struct RemoteIterator {
    router: Arc<dyn Router>,
    owner: WorkerId,
    table: TableId,
    shard: ShardId,
    fetch: u32,
    iterator_id: i64,
    buffer: Vec<KvPair>,
    index: usize,
    server_done: bool,
}

impl RemoteIterator {
    pub(crate) fn open(
        router: Arc<dyn Router>,
        owner: WorkerId,
        table: TableId,
        shard: ShardId,
        fetch: u32,
    ) -> GkvResult<Self> {
        let mut iter = RemoteIterator {
            router,
            owner,
            table,
            shard,
            fetch,
            iterator_id: NEW_ITERATOR,
            buffer: Vec::new(),
            index: 0,
            server_done: false,
        };
        iter.refill()?;
        Ok(iter)
    }

    pub fn done(&self) -> bool {
        self.server_done && self.index >= self.buffer.len()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.buffer.get(self.index).map(|pair| pair.key.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.buffer
            .get(self.index)
            .map(|pair| pair.value.as_slice())
    }

    pub fn next(&mut self) -> GkvResult<()> {
        if self.index < self.buffer.len() {
            self.index += 1;
        }
        while self.index >= self.buffer.len() && !self.server_done {
            self.refill()?;
        }
        Ok(())
    }

    fn refill(&mut self) -> GkvResult<()> {
        let response = self
            .router
            .call(
                self.owner,
                Request::GetIterator {
                    table: self.table,
                    shard: self.shard,
                    id: self.iterator_id,
                    count: self.fetch,
                },
            )?
            .into_result()?;
        match response {
            Response::Iterator(batch) => {
                self.iterator_id = i64::from(batch.id);
                self.buffer = batch.results;
                self.index = 0;
                self.server_done = batch.done;
                Ok(())
            }
            other => Err(GkvError::Protocol(format!(
                "unexpected iterator reply: {other:?}"
            ))),
        }
    }
}
