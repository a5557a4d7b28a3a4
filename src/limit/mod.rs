//! Rate limiting logic and state management.

pub mod evaluator;
mod limiter;
pub mod planner;
mod record;
pub mod shard;

pub use limiter::ShardedLimiter;
pub use record::{ConsumeRequest, ConsumeResult, RecordState, EPSILON};
