//! Request/result types and the record state machine.

use std::time::Duration;

use crate::config::LimitConfig;
use crate::store::LimitRecord;

/// Tolerance for capacity comparisons, guarding against float drift from
/// repeated partial consumption.
pub const EPSILON: f64 = 1e-9;

/// Lifecycle state of one stored shard record.
///
/// Fresh -> Available -> Depleted -> Reserved (debt, only via reservation)
/// -> Available once the debt repays. Reset returns any record to Fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Never consumed (no record stored).
    Fresh,
    /// Positive remaining capacity.
    Available,
    /// Exactly zero remaining capacity.
    Depleted,
    /// Negative capacity: an outstanding reservation debt.
    Reserved,
}

impl RecordState {
    /// State implied by a stored record, `None` meaning absent.
    pub fn of(record: Option<&LimitRecord>) -> Self {
        match record {
            None => RecordState::Fresh,
            Some(r) => Self::of_value(r.value),
        }
    }

    /// State implied by a capacity value.
    pub fn of_value(value: f64) -> Self {
        if value < -EPSILON {
            RecordState::Reserved
        } else if value <= EPSILON {
            RecordState::Depleted
        } else {
            RecordState::Available
        }
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecordState::Fresh => "fresh",
            RecordState::Available => "available",
            RecordState::Depleted => "depleted",
            RecordState::Reserved => "reserved",
        };
        write!(f, "{}", s)
    }
}

/// One consume (or check) call against a named limit.
#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    /// Limit name, resolved against the registry unless `config` is set.
    pub name: String,
    /// Caller-supplied key within the limit.
    pub key: String,
    /// Capacity units requested.
    pub count: f64,
    /// Allow capacity to go negative (reservation debt) instead of denying.
    pub reserve: bool,
    /// Ad hoc configuration overriding the registry for this call.
    pub config: Option<LimitConfig>,
}

impl ConsumeRequest {
    /// A plain consume of `count` units.
    pub fn new(name: impl Into<String>, key: impl Into<String>, count: f64) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            count,
            reserve: false,
            config: None,
        }
    }

    /// Request a reservation instead of a denial on insufficient capacity.
    pub fn reserved(mut self) -> Self {
        self.reserve = true;
        self
    }

    /// Supply an ad hoc limit configuration for this call only.
    pub fn with_config(mut self, config: LimitConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// Outcome of a check or consume.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeResult {
    /// Whether the request was granted (including by reservation).
    pub ok: bool,
    /// Remaining capacity on the consulted shards after the request.
    /// Negative when a reservation left a debt.
    pub remaining: f64,
    /// When granted by reservation: time until the debt fully repays.
    /// When denied: time after which the same request is guaranteed to
    /// succeed absent intervening consumption. Advisory either way.
    pub retry_after: Option<Duration>,
}
