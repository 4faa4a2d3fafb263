use std::mem;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::data::StreamData;
use crate::error::WorkerError;

/// Keyed accumulation table shared by ingestion and flush.
///
/// Ingestion holds the outer lock shared and merges under the per-key
/// shard lock, so callers on different keys never contend. `drain` takes
/// the outer lock exclusively just long enough to swap in an empty table,
/// which puts every racing update into exactly one of the two windows.
pub struct KeyedWindow<T> {
    table: RwLock<DashMap<String, T>>,
    capacity: usize,
}

impl<T: StreamData> KeyedWindow<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: RwLock::new(DashMap::with_capacity(capacity)),
            capacity,
        }
    }

    /// Merges `record` into the bucket for its id.
    pub fn merge(&self, record: T) -> Result<(), WorkerError> {
        let key = record.id();
        if key.is_empty() {
            return Err(WorkerError::Malformed("record has an empty id".to_string()));
        }

        let table = self.table.read();
        match table.entry(key) {
            Entry::Occupied(mut bucket) => bucket.get_mut().merge(&record),
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
        Ok(())
    }

    /// Takes every bucket and resets the window.
    pub fn drain(&self) -> Vec<T> {
        let previous = {
            let mut table = self.table.write();
            mem::replace(&mut *table, DashMap::with_capacity(self.capacity))
        };

        previous.into_iter().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}
