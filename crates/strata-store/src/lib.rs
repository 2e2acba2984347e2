//! Ordered key-value store access for source world saves.
#![forbid(unsafe_code)]

mod key;
mod table;

pub use key::{ChunkKey, RecordTag, SourceKey};
pub use table::TableStore;

use std::collections::BTreeMap;
use std::ops::Bound;

use strata_core::Result;

/// Cursor over key/value pairs in ascending key order.
pub trait KvIter: Send {
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
}

/// Read-only ordered key-value store.
///
/// Iterators are independent cursors; any number may be open at once
/// from any number of threads.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    /// Iterate from the first key `>= start`.
    fn iter_from(&self, start: &[u8]) -> Result<Box<dyn KvIter + '_>>;
}

/// In-memory store, used by tests and as a scratch source.
#[derive(Default)]
pub struct MemStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct MemIter<'a> {
    range: std::collections::btree_map::Range<'a, Vec<u8>, Vec<u8>>,
}

impl KvIter for MemIter<'_> {
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self.range.next().map(|(k, v)| (k.clone(), v.clone())))
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn iter_from(&self, start: &[u8]) -> Result<Box<dyn KvIter + '_>> {
        let range = self
            .entries
            .range::<Vec<u8>, _>((Bound::Included(&start.to_vec()), Bound::Unbounded));
        Ok(Box::new(MemIter { range }))
    }
}
