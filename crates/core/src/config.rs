//! Application configuration.
//!
//! None of these types carry defaults: every value is supplied by the
//! configuration file or the environment (see [`crate::ConfigLoader`]).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CoreError;
use crate::types::Platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub execution: ExecutionConfig,
    pub retry: RetryConfig,
    pub dispatch: DispatchConfig,
    pub runtime: RuntimeConfig,
}

/// Timeouts governing one execution cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// How long an agent waits for its partner to be ready.
    #[serde(with = "duration_ms", rename = "ready_timeout_ms")]
    pub ready_timeout: Duration,

    /// How long an agent waits for its partner's placement outcome.
    #[serde(with = "duration_ms", rename = "outcome_timeout_ms")]
    pub outcome_timeout: Duration,

    /// Upper bound for a whole two-party cycle, used by the dispatcher to
    /// stop tracking an opportunity whose completion barrier never released.
    #[serde(with = "duration_ms", rename = "cycle_timeout_ms")]
    pub cycle_timeout: Duration,

    /// Synchronization entries older than this are pruned by the janitor.
    #[serde(with = "duration_ms", rename = "stale_entry_ms")]
    pub stale_entry: Duration,
}

/// Odds-driven retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Tolerance around the target odds, in percent (2 means 2%).
    pub tolerance_pct: Decimal,

    /// Only accept prices at least `target * (1 - tolerance)` with no upper bound.
    pub require_at_least_target: bool,

    /// Lifetime of a retry specification.
    #[serde(with = "duration_ms", rename = "ttl_ms")]
    pub ttl: Duration,

    /// Non-matching price updates tolerated before eviction.
    pub max_attempts: u32,

    /// Capacity of each platform's ready queue.
    pub ready_queue_capacity: usize,
}

/// Opportunity polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(with = "duration_ms", rename = "poll_interval_ms")]
    pub poll_interval: Duration,

    /// Minimum estimated profit, in percent.
    pub min_profit_pct: Decimal,

    /// Maximum age of the prices backing an opportunity.
    #[serde(with = "duration_ms", rename = "max_age_ms")]
    pub max_age: Duration,

    /// Skip opportunities whose price stream had gaps.
    pub require_continuity: bool,

    /// Platforms that get a dispatch queue and an execution worker.
    pub platforms: Vec<Platform>,
}

/// Worker pool and safety settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Tasks consuming the live odds stream.
    pub odds_workers: usize,

    /// Buffer between odds readers and odds workers.
    pub odds_buffer: usize,

    /// How long a platform worker blocks on its queue before re-checking shutdown.
    #[serde(with = "duration_ms", rename = "worker_poll_ms")]
    pub worker_poll: Duration,

    /// Cadence of the retry TTL sweep and the stale-entry janitor.
    #[serde(with = "duration_ms", rename = "sweep_interval_ms")]
    pub sweep_interval: Duration,

    /// Consecutive failed or abandoned cycles before dispatch pauses.
    pub max_consecutive_failures: u32,

    #[serde(with = "duration_ms", rename = "failure_pause_ms")]
    pub failure_pause: Duration,

    /// Capacity of the execution event broadcast channel.
    pub event_buffer: usize,
}

impl AppConfig {
    /// Rejects values that would make the protocol hang or misbehave.
    ///
    /// # Errors
    /// Returns the first offending field as `CoreError::InvalidConfig`.
    pub fn validate(&self) -> Result<(), CoreError> {
        let positive = [
            ("execution.ready_timeout_ms", self.execution.ready_timeout),
            ("execution.outcome_timeout_ms", self.execution.outcome_timeout),
            ("execution.cycle_timeout_ms", self.execution.cycle_timeout),
            ("execution.stale_entry_ms", self.execution.stale_entry),
            ("retry.ttl_ms", self.retry.ttl),
            ("dispatch.poll_interval_ms", self.dispatch.poll_interval),
            ("dispatch.max_age_ms", self.dispatch.max_age),
            ("runtime.worker_poll_ms", self.runtime.worker_poll),
            ("runtime.sweep_interval_ms", self.runtime.sweep_interval),
        ];
        for (field, value) in positive {
            if value.is_zero() {
                return Err(CoreError::invalid_config(field, "must be greater than zero"));
            }
        }

        if self.execution.cycle_timeout
            < self.execution.ready_timeout + self.execution.outcome_timeout
        {
            return Err(CoreError::invalid_config(
                "execution.cycle_timeout_ms",
                "must cover ready_timeout_ms + outcome_timeout_ms",
            ));
        }
        if self.retry.tolerance_pct < Decimal::ZERO || self.retry.tolerance_pct >= Decimal::ONE_HUNDRED {
            return Err(CoreError::invalid_config(
                "retry.tolerance_pct",
                format!("{} is outside [0, 100)", self.retry.tolerance_pct),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::invalid_config("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.ready_queue_capacity == 0 {
            return Err(CoreError::invalid_config(
                "retry.ready_queue_capacity",
                "must be at least 1",
            ));
        }
        if self.dispatch.platforms.len() < 2 {
            return Err(CoreError::invalid_config(
                "dispatch.platforms",
                "at least two platforms are required",
            ));
        }
        if self.runtime.odds_workers == 0 || self.runtime.odds_buffer == 0 {
            return Err(CoreError::invalid_config(
                "runtime.odds_workers",
                "odds workers and buffer must be at least 1",
            ));
        }
        if self.runtime.event_buffer == 0 {
            return Err(CoreError::invalid_config("runtime.event_buffer", "must be at least 1"));
        }
        Ok(())
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
