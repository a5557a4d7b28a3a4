//! Retry-after planning.
//!
//! Translates a deficient consume into a wait duration with a guarantee:
//! if the caller waits exactly that long and retries the same count, the
//! request succeeds, assuming no intervening consumption by others. The
//! same arithmetic gives the repayment instant of a reservation debt.

use crate::config::{LimitConfig, LimitKind};
use crate::limit::evaluator::boundary_after;
use crate::limit::record::EPSILON;
use crate::store::LimitRecord;

/// Milliseconds until a single shard's value, replenished from `record`
/// (already reconciled to `now_ms`), reaches `target`.
///
/// Returns `None` when `target` exceeds the per-shard capacity cap and can
/// therefore never be reached on one shard.
pub fn time_to_reach(
    config: &LimitConfig,
    record: &LimitRecord,
    target: f64,
    now_ms: u64,
) -> Option<u64> {
    let cap = config.shard_capacity();
    if target <= record.value + EPSILON {
        return Some(0);
    }
    if target > cap + EPSILON {
        return None;
    }
    let deficit = target - record.value;
    match config.kind {
        LimitKind::TokenBucket => {
            let per_ms = config.shard_rate() / config.period_ms as f64;
            Some((deficit / per_ms).ceil() as u64)
        }
        LimitKind::FixedWindow => {
            let windows = (deficit / config.shard_rate()).ceil() as u64;
            Some(boundary_after(config, now_ms, windows) - now_ms)
        }
    }
}

/// Milliseconds until two shards' combined value reaches `target`, both
/// replenishing independently and each capped at the per-shard capacity.
///
/// Returns `None` when `target` exceeds twice the per-shard capacity.
pub fn time_to_reach_joint(
    config: &LimitConfig,
    a: &LimitRecord,
    b: &LimitRecord,
    target: f64,
    now_ms: u64,
) -> Option<u64> {
    let cap = config.shard_capacity();
    let combined = a.value + b.value;
    if target <= combined + EPSILON {
        return Some(0);
    }
    if target > 2.0 * cap + EPSILON {
        return None;
    }

    // Order so `lo` saturates first.
    let (lo, hi) = if cap - a.value <= cap - b.value {
        (a.value, b.value)
    } else {
        (b.value, a.value)
    };

    match config.kind {
        LimitKind::TokenBucket => {
            let per_ms = config.shard_rate() / config.period_ms as f64;
            let sat = (cap - lo) / per_ms;
            // Both shards accruing.
            let t = (target - combined) / (2.0 * per_ms);
            let t = if t <= sat {
                t
            } else {
                // One shard capped; the other accrues alone the whole time:
                // target = cap + hi + t * per_ms.
                (target - cap - hi) / per_ms
            };
            Some(t.ceil() as u64)
        }
        LimitKind::FixedWindow => {
            let step = config.shard_rate();
            let both = ((target - combined) / (2.0 * step)).ceil() as u64;
            // The linear estimate undercounts when `lo` hits the cap partway
            // through its final step, so check the capped sum it actually
            // yields before trusting it.
            let reached = (lo + both as f64 * step).min(cap) + (hi + both as f64 * step).min(cap);
            let windows = if reached + EPSILON >= target {
                both
            } else {
                // `lo` is capped; the remainder lands on `hi` alone:
                // target = cap + hi + windows * step.
                ((target - cap - hi) / step).ceil() as u64
            };
            Some(boundary_after(config, now_ms, windows) - now_ms)
        }
    }
}

/// Milliseconds until a reservation debt on `record` fully repays.
pub fn repay_time(config: &LimitConfig, record: &LimitRecord, now_ms: u64) -> u64 {
    // Target zero never exceeds capacity, so this always resolves.
    time_to_reach(config, record, 0.0, now_ms).unwrap_or(0)
}
