//! Pure capacity evaluation.
//!
//! Everything in this module is synchronous and O(1): given a stored record
//! and a limit configuration, compute the capacity available at a query
//! instant by replenishing the time elapsed since the record's timestamp.
//! The value is always recomputed from the stored timestamp, so repeated
//! partial consumption carries no accumulating error term.

use crate::config::{LimitConfig, LimitKind};
use crate::store::LimitRecord;

/// Index of the fixed window containing `t_ms`, phased by the configured
/// start offset. Instants before the first boundary fall in window -1.
pub fn window_index(config: &LimitConfig, t_ms: u64) -> i64 {
    let period = config.period_ms as i64;
    let offset = (config.start_offset_ms % config.period_ms) as i64;
    (t_ms as i64 - offset).div_euclid(period)
}

/// Start of the fixed window containing `t_ms`, clamped to the epoch so it
/// can be stored in a record timestamp. Boundary counting goes through
/// [`window_index`], which stays exact for instants before the first
/// phased boundary.
pub fn window_start(config: &LimitConfig, t_ms: u64) -> u64 {
    let period = config.period_ms as i64;
    let offset = (config.start_offset_ms % config.period_ms) as i64;
    (offset + window_index(config, t_ms) * period).max(0) as u64
}

/// Instant of the `windows`-th boundary after the window containing
/// `t_ms`. `windows` must be at least 1.
pub fn boundary_after(config: &LimitConfig, t_ms: u64, windows: u64) -> u64 {
    let period = config.period_ms as i64;
    let offset = (config.start_offset_ms % config.period_ms) as i64;
    (offset + (window_index(config, t_ms) + windows as i64) * period).max(0) as u64
}

/// Replenish a record to the query instant `now_ms`.
///
/// An absent record evaluates to the full per-shard capacity (Fresh). The
/// returned record's timestamp is reconciled: `now_ms` for a token bucket,
/// the current window start for a fixed window.
pub fn replenish(config: &LimitConfig, record: Option<&LimitRecord>, now_ms: u64) -> LimitRecord {
    let cap = config.shard_capacity();
    match config.kind {
        LimitKind::TokenBucket => match record {
            None => LimitRecord {
                value: cap,
                ts_ms: now_ms,
            },
            Some(r) => {
                let elapsed = now_ms.saturating_sub(r.ts_ms) as f64;
                let gained = elapsed * config.shard_rate() / config.period_ms as f64;
                LimitRecord {
                    value: (r.value + gained).min(cap),
                    ts_ms: now_ms,
                }
            }
        },
        LimitKind::FixedWindow => {
            let current = window_start(config, now_ms);
            match record {
                None => LimitRecord {
                    value: cap,
                    ts_ms: current,
                },
                Some(r) => {
                    let boundaries =
                        (window_index(config, now_ms) - window_index(config, r.ts_ms)).max(0);
                    LimitRecord {
                        value: (r.value + boundaries as f64 * config.shard_rate()).min(cap),
                        ts_ms: current,
                    }
                }
            }
        }
    }
}

/// Deduct `count` from a replenished record. The result may be negative
/// when the caller is recording a reservation debt.
pub fn debit(record: LimitRecord, count: f64) -> LimitRecord {
    LimitRecord {
        value: record.value - count,
        ts_ms: record.ts_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bucket(rate: f64, period_ms: u64) -> LimitConfig {
        LimitConfig::token_bucket(rate, Duration::from_millis(period_ms))
    }

    fn window(rate: f64, period_ms: u64) -> LimitConfig {
        LimitConfig::fixed_window(rate, Duration::from_millis(period_ms))
    }

    #[test]
    fn test_fresh_token_bucket_is_full() {
        let config = bucket(10.0, 1000);
        let r = replenish(&config, None, 5_000);
        assert_eq!(r.value, 10.0);
        assert_eq!(r.ts_ms, 5_000);
    }

    #[test]
    fn test_token_bucket_linear_growth() {
        let config = bucket(10.0, 1000);
        let stored = LimitRecord {
            value: 2.0,
            ts_ms: 1_000,
        };

        // 300ms at 10 units/s adds 3 units.
        let r = replenish(&config, Some(&stored), 1_300);
        assert!((r.value - 5.0).abs() < 1e-9);
        assert_eq!(r.ts_ms, 1_300);
    }

    #[test]
    fn test_token_bucket_caps_at_capacity() {
        let config = bucket(10.0, 1000);
        let stored = LimitRecord {
            value: 8.0,
            ts_ms: 0,
        };

        let r = replenish(&config, Some(&stored), 60_000);
        assert_eq!(r.value, 10.0);
    }

    #[test]
    fn test_token_bucket_debt_repays_linearly() {
        let config = bucket(10.0, 1000);
        let stored = LimitRecord {
            value: -5.0,
            ts_ms: 0,
        };

        let r = replenish(&config, Some(&stored), 500);
        assert!((r.value - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_token_bucket_clock_skew_is_harmless() {
        // A stored timestamp ahead of the query instant replenishes nothing.
        let config = bucket(10.0, 1000);
        let stored = LimitRecord {
            value: 4.0,
            ts_ms: 10_000,
        };

        let r = replenish(&config, Some(&stored), 9_000);
        assert_eq!(r.value, 4.0);
    }

    #[test]
    fn test_window_start_phase() {
        let config = window(3.0, 60_000).with_start_offset(Duration::from_millis(10_000));
        assert_eq!(window_start(&config, 10_000), 10_000);
        assert_eq!(window_start(&config, 69_999), 10_000);
        assert_eq!(window_start(&config, 70_000), 70_000);
        // Before the first boundary.
        assert_eq!(window_start(&config, 5_000), 0);
    }

    #[test]
    fn test_fixed_window_replenishes_at_first_phased_boundary() {
        let config = window(3.0, 60_000).with_start_offset(Duration::from_millis(10_000));
        let stored = LimitRecord {
            value: 0.0,
            ts_ms: 5_000,
        };

        // Still before the boundary: nothing replenishes.
        let r = replenish(&config, Some(&stored), 9_999);
        assert_eq!(r.value, 0.0);

        // The first phased boundary at t=10s grants a full window even
        // though the record predates it.
        let r = replenish(&config, Some(&stored), 10_000);
        assert_eq!(r.value, 3.0);
        assert_eq!(r.ts_ms, 10_000);
    }

    #[test]
    fn test_fixed_window_resets_at_boundary() {
        let config = window(3.0, 60_000);
        let stored = LimitRecord {
            value: 0.0,
            ts_ms: 30_000,
        };

        // Same window: nothing replenishes.
        let r = replenish(&config, Some(&stored), 59_999);
        assert_eq!(r.value, 0.0);

        // Next window: full reset (capacity defaults to rate).
        let r = replenish(&config, Some(&stored), 60_000);
        assert_eq!(r.value, 3.0);
        assert_eq!(r.ts_ms, 60_000);
    }

    #[test]
    fn test_fixed_window_rollover_cap() {
        // capacity > rate lets unused grant roll over, capped.
        let config = window(3.0, 60_000).with_capacity(5.0);
        let stored = LimitRecord {
            value: 2.0,
            ts_ms: 0,
        };

        let r = replenish(&config, Some(&stored), 60_000);
        assert_eq!(r.value, 5.0);

        let r = replenish(&config, Some(&stored), 10 * 60_000);
        assert_eq!(r.value, 5.0);
    }

    #[test]
    fn test_fixed_window_debt_repays_per_window() {
        let config = window(3.0, 60_000);
        let stored = LimitRecord {
            value: -7.0,
            ts_ms: 0,
        };

        let r = replenish(&config, Some(&stored), 60_000);
        assert_eq!(r.value, -4.0);
        let r = replenish(&config, Some(&stored), 3 * 60_000);
        assert_eq!(r.value, 2.0);
    }

    #[test]
    fn test_sharded_replenish_uses_shard_fractions() {
        let config = bucket(10.0, 1000).with_shards(4);
        let r = replenish(&config, None, 0);
        assert_eq!(r.value, 2.5);

        let stored = LimitRecord {
            value: 0.0,
            ts_ms: 0,
        };
        let r = replenish(&config, Some(&stored), 1_000);
        assert!((r.value - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_debit_keeps_timestamp() {
        let rec = LimitRecord {
            value: 5.0,
            ts_ms: 42,
        };
        let r = debit(rec, 7.0);
        assert_eq!(r.value, -2.0);
        assert_eq!(r.ts_ms, 42);
    }
}
