//! Runtime configuration for billing and task execution.
//!
//! [`FlowConfig`] carries every tunable with production defaults. It
//! deserializes from any serde source (durations in humantime form, e.g.
//! `"15m"`) and can be overlaid from `TOLLGATE_*` environment variables.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tollgate_core::LogFormat;

use crate::error::{Error, Result};
use crate::task::Priority;

/// Per-lane outstanding-job ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneCapacities {
    /// Low lane ceiling.
    pub low: usize,
    /// Normal lane ceiling.
    pub normal: usize,
    /// High lane ceiling.
    pub high: usize,
}

impl Default for LaneCapacities {
    fn default() -> Self {
        Self {
            low: 1000,
            normal: 500,
            high: 200,
        }
    }
}

impl LaneCapacities {
    /// Returns the ceiling for a priority.
    #[must_use]
    pub const fn for_priority(&self, priority: Priority) -> usize {
        match priority {
            Priority::Low => self.low,
            Priority::Normal => self.normal,
            Priority::High => self.high,
        }
    }
}

/// Configuration for the dispatcher, reservations, reaper and workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct FlowConfig {
    /// Lane ceilings.
    pub lane_capacities: LaneCapacities,
    /// Maximum pending/processing tasks per user.
    pub user_task_limit: usize,
    /// Age after which a pending reservation is rolled back.
    #[serde(with = "humantime_serde")]
    pub reservation_timeout: Duration,
    /// Interval between reaper sweeps.
    #[serde(with = "humantime_serde")]
    pub reaper_interval: Duration,
    /// Lease TTL of the per-user lock.
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
    /// Number of worker loops.
    pub worker_concurrency: usize,
    /// Sleep between polls of an empty queue.
    #[serde(with = "humantime_serde")]
    pub worker_poll_interval: Duration,
    /// Items per batch chunk.
    pub batch_chunk_size: usize,
    /// Maximum items in one batch request.
    pub max_batch_size: usize,
    /// Discount percent applied to every quote.
    pub base_discount_percent: Decimal,
    /// Log output format (`json` or `pretty`).
    pub log_format: String,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            lane_capacities: LaneCapacities::default(),
            user_task_limit: 10,
            reservation_timeout: Duration::from_secs(15 * 60),
            reaper_interval: Duration::from_secs(15 * 60),
            lock_ttl: Duration::from_secs(30),
            worker_concurrency: 4,
            worker_poll_interval: Duration::from_millis(500),
            batch_chunk_size: 10,
            max_batch_size: 1000,
            base_discount_percent: Decimal::ZERO,
            log_format: "pretty".to_string(),
        }
    }
}

impl FlowConfig {
    /// Loads configuration from `TOLLGATE_*` environment variables over defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a variable is set but invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source over defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a variable is set but invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let mut config = Self::default();

        if let Some(v) = env.usize("TOLLGATE_LANE_CAPACITY_LOW")? {
            config.lane_capacities.low = v;
        }
        if let Some(v) = env.usize("TOLLGATE_LANE_CAPACITY_NORMAL")? {
            config.lane_capacities.normal = v;
        }
        if let Some(v) = env.usize("TOLLGATE_LANE_CAPACITY_HIGH")? {
            config.lane_capacities.high = v;
        }
        if let Some(v) = env.usize("TOLLGATE_USER_TASK_LIMIT")? {
            config.user_task_limit = v;
        }
        if let Some(v) = env.duration("TOLLGATE_RESERVATION_TIMEOUT")? {
            config.reservation_timeout = v;
        }
        if let Some(v) = env.duration("TOLLGATE_REAPER_INTERVAL")? {
            config.reaper_interval = v;
        }
        if let Some(v) = env.duration("TOLLGATE_LOCK_TTL")? {
            config.lock_ttl = v;
        }
        if let Some(v) = env.usize("TOLLGATE_WORKER_CONCURRENCY")? {
            config.worker_concurrency = v;
        }
        if let Some(v) = env.duration("TOLLGATE_WORKER_POLL_INTERVAL")? {
            config.worker_poll_interval = v;
        }
        if let Some(v) = env.usize("TOLLGATE_BATCH_CHUNK_SIZE")? {
            config.batch_chunk_size = v;
        }
        if let Some(v) = env.usize("TOLLGATE_MAX_BATCH_SIZE")? {
            config.max_batch_size = v;
        }
        if let Some(v) = env.string("TOLLGATE_LOG_FORMAT") {
            config.log_format = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks invariants between fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.batch_chunk_size == 0 {
            return Err(Error::configuration("batch_chunk_size must be at least 1"));
        }
        if self.max_batch_size == 0 {
            return Err(Error::configuration("max_batch_size must be at least 1"));
        }
        if self.worker_concurrency == 0 {
            return Err(Error::configuration("worker_concurrency must be at least 1"));
        }
        if self.reservation_timeout.is_zero() {
            return Err(Error::configuration("reservation_timeout must be positive"));
        }
        if self.reaper_interval.is_zero() {
            return Err(Error::configuration("reaper_interval must be positive"));
        }
        if self.base_discount_percent.is_sign_negative()
            || self.base_discount_percent > Decimal::ONE_HUNDRED
        {
            return Err(Error::configuration(
                "base_discount_percent must be between 0 and 100",
            ));
        }
        Ok(())
    }

    /// Returns the configured log format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        LogFormat::parse_or_default(&self.log_format)
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a usize: {e}")))
    }

    fn duration(&self, name: &str) -> Result<Option<Duration>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        humantime_serde::re::humantime::parse_duration(&v)
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a duration like 15m: {e}")))
    }
}
