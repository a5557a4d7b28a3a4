//! Transactional record storage for limit state.
//!
//! The limiter requires only a versioned key-value capability: read a set of
//! records with their versions, then conditionally commit a set of writes
//! that all land together or not at all. Everything else (replenishment,
//! shard choice, retry planning) happens outside the store.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Key of one stored limit record: one record per (limit name, key, shard).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// The limit name this record belongs to.
    pub limit: String,
    /// The caller-supplied key (user id, IP, ...) within the limit.
    pub key: String,
    /// Shard index within the limit's shard count.
    pub shard: u32,
}

impl RecordKey {
    /// Create a record key.
    pub fn new(limit: impl Into<String>, key: impl Into<String>, shard: u32) -> Self {
        Self {
            limit: limit.into(),
            key: key.into(),
            shard,
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}#{}", self.limit, self.key, self.shard)
    }
}

/// Persisted state of one shard of one limit/key pair.
///
/// `value` is remaining capacity; negative values are reservation debt.
/// `ts_ms` is the instant (milliseconds since the Unix epoch) the value was
/// last reconciled; evaluation replenishes from this instant, never from an
/// accumulated delta.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitRecord {
    /// Remaining capacity on this shard.
    pub value: f64,
    /// Instant the value was last written, ms since the Unix epoch.
    pub ts_ms: u64,
}

/// A record read together with its store version.
///
/// Version 0 means the record is absent (Fresh); any commit conditioned on
/// version 0 asserts the record was never written (or was reset).
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    /// Store version observed at read time.
    pub version: u64,
    /// The record, if present.
    pub record: Option<LimitRecord>,
}

impl VersionedRecord {
    /// A read result for an absent record.
    pub fn absent() -> Self {
        Self {
            version: 0,
            record: None,
        }
    }
}

/// One conditional write: commits only if the stored version still matches.
///
/// `record: None` deletes the record (explicit reset).
#[derive(Debug, Clone, PartialEq)]
pub struct RecordWrite {
    /// Key being written.
    pub key: RecordKey,
    /// Version observed by the read this write was computed from.
    pub expected_version: u64,
    /// New record, or `None` to delete.
    pub record: Option<LimitRecord>,
}

/// Trait for transactional limit record stores.
///
/// Implementations must make `commit` atomic across all writes in the slice:
/// either every write applies (and every expected version matched) or the
/// whole commit fails with [`StoreError::Conflict`] and no state changes.
#[async_trait]
pub trait LimitStore: Send + Sync {
    /// Read the current version and record for each key, in order.
    async fn read(&self, keys: &[RecordKey]) -> Result<Vec<VersionedRecord>, StoreError>;

    /// Atomically apply all writes, or none on a version mismatch.
    async fn commit(&self, writes: &[RecordWrite]) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_display() {
        let key = RecordKey::new("api", "user_42", 3);
        assert_eq!(key.to_string(), "api:user_42#3");
    }

    #[test]
    fn test_record_key_equality() {
        let a = RecordKey::new("api", "user_42", 0);
        let b = RecordKey::new("api", "user_42", 0);
        let c = RecordKey::new("api", "user_42", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
