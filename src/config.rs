//! Limit configuration and registry.
//!
//! This module defines the per-limit configuration (strategy, rate, period,
//! capacity, shard count) and the named registry supplied to the limiter at
//! construction. Registries can be built in code or loaded from YAML.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimitError, Result};

/// Replenishment strategy for a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Capacity replenishes continuously at `rate / period`, up to the cap.
    TokenBucket,
    /// Capacity is granted in steps of `rate` at fixed period boundaries,
    /// up to the cap. With the default `capacity == rate` this is a full
    /// reset at each boundary.
    FixedWindow,
}

/// Configuration for a single named limit.
///
/// Immutable after registration; shared read-only by all evaluations of
/// that limit name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Replenishment strategy.
    pub kind: LimitKind,
    /// Units replenished per period.
    pub rate: f64,
    /// Replenishment period in milliseconds.
    pub period_ms: u64,
    /// Maximum accumulated capacity. Defaults to `rate` when absent.
    #[serde(default)]
    pub capacity: Option<f64>,
    /// Number of independent shards the capacity is split across.
    #[serde(default = "default_shards")]
    pub shards: u32,
    /// Phase offset for fixed-window boundaries, in milliseconds.
    #[serde(default)]
    pub start_offset_ms: u64,
}

fn default_shards() -> u32 {
    1
}

impl LimitConfig {
    /// Create a token bucket limit replenishing `rate` units per `period`.
    pub fn token_bucket(rate: f64, period: Duration) -> Self {
        Self {
            kind: LimitKind::TokenBucket,
            rate,
            period_ms: period.as_millis() as u64,
            capacity: None,
            shards: 1,
            start_offset_ms: 0,
        }
    }

    /// Create a fixed window limit granting `rate` units per `period`.
    pub fn fixed_window(rate: f64, period: Duration) -> Self {
        Self {
            kind: LimitKind::FixedWindow,
            rate,
            period_ms: period.as_millis() as u64,
            capacity: None,
            shards: 1,
            start_offset_ms: 0,
        }
    }

    /// Set an explicit capacity cap (burst size) distinct from `rate`.
    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Split the limit's capacity across `shards` independent records.
    pub fn with_shards(mut self, shards: u32) -> Self {
        self.shards = shards;
        self
    }

    /// Phase-shift fixed-window boundaries by `offset`.
    pub fn with_start_offset(mut self, offset: Duration) -> Self {
        self.start_offset_ms = offset.as_millis() as u64;
        self
    }

    /// Effective capacity cap for the whole limit.
    pub fn capacity(&self) -> f64 {
        self.capacity.unwrap_or(self.rate)
    }

    /// Replenishment rate attributed to one shard.
    pub fn shard_rate(&self) -> f64 {
        self.rate / self.shards as f64
    }

    /// Capacity cap attributed to one shard.
    pub fn shard_capacity(&self) -> f64 {
        self.capacity() / self.shards as f64
    }

    /// Validate the parameters, naming the limit in any error.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.period_ms == 0 {
            return Err(LimitError::InvalidConfig(format!(
                "limit '{}' has a zero period",
                name
            )));
        }
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(LimitError::InvalidConfig(format!(
                "limit '{}' has a non-positive rate {}",
                name, self.rate
            )));
        }
        if let Some(capacity) = self.capacity {
            if !capacity.is_finite() || capacity <= 0.0 {
                return Err(LimitError::InvalidConfig(format!(
                    "limit '{}' has a non-positive capacity {}",
                    name, capacity
                )));
            }
        }
        if self.shards == 0 {
            return Err(LimitError::InvalidConfig(format!(
                "limit '{}' has zero shards",
                name
            )));
        }
        Ok(())
    }
}

/// A registry of named limit configurations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitSet {
    /// Map of limit name to configuration.
    #[serde(default)]
    pub limits: HashMap<String, LimitConfig>,
}

impl LimitSet {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from an iterator of (name, config) pairs.
    pub fn from_iter<I, S>(limits: I) -> Self
    where
        I: IntoIterator<Item = (S, LimitConfig)>,
        S: Into<String>,
    {
        Self {
            limits: limits.into_iter().map(|(n, c)| (n.into(), c)).collect(),
        }
    }

    /// Load a registry from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit configuration");

        let contents = std::fs::read_to_string(path).map_err(|e| {
            LimitError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Load a registry from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimitError::InvalidConfig(format!("failed to parse limit config: {}", e)))
    }

    /// Get the configuration for a limit name.
    pub fn get(&self, name: &str) -> Option<&LimitConfig> {
        self.limits.get(name)
    }

    /// Register a limit, replacing any existing one with the same name.
    pub fn insert(&mut self, name: impl Into<String>, config: LimitConfig) {
        self.limits.insert(name.into(), config);
    }

    /// Validate every registered limit.
    pub fn validate(&self) -> Result<()> {
        for (name, config) in &self.limits {
            config.validate(name)?;
        }
        Ok(())
    }
}
