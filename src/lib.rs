//! Shardlimit - Sharded Rate Limiting
//!
//! This crate implements rate limit accounting over a transactional
//! key-value store. Each named limit is a token bucket or fixed window whose
//! capacity can be split across shards; consumes pick two candidate shards
//! at random and take the better one, bounding write contention while the
//! aggregate limit across all shards is never exceeded. Large requests can
//! reserve capacity by going into debt, with a guaranteed repayment instant.

pub mod config;
pub mod error;
pub mod limit;
pub mod store;

pub use config::{LimitConfig, LimitKind, LimitSet};
pub use error::{LimitError, Result, StoreError};
pub use limit::{ConsumeRequest, ConsumeResult, RecordState, ShardedLimiter};
pub use store::{LimitRecord, LimitStore, MemoryStore, RecordKey};
