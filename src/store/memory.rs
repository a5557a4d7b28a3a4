//! In-memory limit store with optimistic concurrency.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

use async_trait::async_trait;

use super::{LimitRecord, LimitStore, RecordKey, RecordWrite, VersionedRecord};
use crate::error::StoreError;

/// Per-key slot. The version survives deletion so that a reader holding a
/// pre-delete version cannot commit over a delete-and-recreate unnoticed.
#[derive(Debug, Clone)]
struct Slot {
    version: u64,
    record: Option<LimitRecord>,
}

/// An in-memory [`LimitStore`] suitable for single-process use and tests.
///
/// Reads and commits each take the map lock once; version checks give the
/// same all-or-nothing semantics a transactional database would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<RecordKey, Slot>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-deleted) records, for tests and diagnostics.
    pub fn record_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| s.record.is_some())
            .count()
    }
}

#[async_trait]
impl LimitStore for MemoryStore {
    async fn read(&self, keys: &[RecordKey]) -> Result<Vec<VersionedRecord>, StoreError> {
        let slots = self.slots.lock();
        Ok(keys
            .iter()
            .map(|key| match slots.get(key) {
                Some(slot) => VersionedRecord {
                    version: slot.version,
                    record: slot.record,
                },
                None => VersionedRecord::absent(),
            })
            .collect())
    }

    async fn commit(&self, writes: &[RecordWrite]) -> Result<(), StoreError> {
        let mut slots = self.slots.lock();

        // Validate every precondition before mutating anything.
        for write in writes {
            let current = slots.get(&write.key).map(|s| s.version).unwrap_or(0);
            if current != write.expected_version {
                trace!(
                    key = %write.key,
                    expected = write.expected_version,
                    found = current,
                    "Commit conflict"
                );
                return Err(StoreError::Conflict);
            }
        }

        for write in writes {
            let slot = slots.entry(write.key.clone()).or_insert(Slot {
                version: 0,
                record: None,
            });
            slot.version += 1;
            slot.record = write.record;
        }
        Ok(())
    }
}
