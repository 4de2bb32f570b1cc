//! Exposure breaker.
//!
//! Stops new dispatches after a run of failed cycles (timed pause) or after
//! any rollback failure (manual reset only). A cycle already in flight is
//! never interrupted.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use legsync_core::{CycleOutcome, RuntimeConfig};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Dispatching normally.
    Closed,
    /// Paused after consecutive failures; closes again once the pause elapses.
    Open,
    /// An unhedged position exists. Needs an operator reset.
    Tripped,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::Tripped => write!(f, "tripped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BreakerError {
    #[error("Consecutive failures exceeded: {failures} >= {max_failures}")]
    ConsecutiveFailuresExceeded { failures: u32, max_failures: u32 },

    #[error("Dispatch paused, {remaining_secs}s remaining")]
    Paused { remaining_secs: u64 },

    #[error("Breaker tripped by a failed rollback, operator reset required")]
    ExposureTripped,
}

#[derive(Debug)]
pub struct ExposureBreaker {
    max_consecutive_failures: u32,
    pause: Duration,
    consecutive_failures: AtomicU32,
    state: RwLock<BreakerState>,
    last_trip_time: RwLock<Option<Instant>>,
    hedged_legs: AtomicU64,
    failed_legs: AtomicU64,
}

impl ExposureBreaker {
    /// Creates a closed breaker. `max_consecutive_failures == 0` disables the
    /// failure pause; rollback failures still trip it.
    #[must_use]
    pub fn new(max_consecutive_failures: u32, pause: Duration) -> Self {
        Self {
            max_consecutive_failures,
            pause,
            consecutive_failures: AtomicU32::new(0),
            state: RwLock::new(BreakerState::Closed),
            last_trip_time: RwLock::new(None),
            hedged_legs: AtomicU64::new(0),
            failed_legs: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.max_consecutive_failures, config.failure_pause)
    }

    /// Checks whether a new opportunity may be dispatched.
    ///
    /// # Errors
    /// Returns why dispatch is blocked.
    pub fn can_dispatch(&self) -> Result<(), BreakerError> {
        let state = *self.state.read();

        match state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let last_trip = *self.last_trip_time.read();
                if let Some(trip_time) = last_trip {
                    let elapsed = trip_time.elapsed();
                    if elapsed >= self.pause {
                        self.close_after_pause();
                        return Ok(());
                    }
                    return Err(BreakerError::Paused {
                        remaining_secs: (self.pause - elapsed).as_secs(),
                    });
                }
                Err(BreakerError::ConsecutiveFailuresExceeded {
                    failures: self.consecutive_failures.load(Ordering::SeqCst),
                    max_failures: self.max_consecutive_failures,
                })
            }
            BreakerState::Tripped => Err(BreakerError::ExposureTripped),
        }
    }

    /// Feeds one finished leg cycle into the breaker.
    pub fn record(&self, outcome: &CycleOutcome) {
        if outcome.has_exposure() {
            self.failed_legs.fetch_add(1, Ordering::SeqCst);
            self.trip();
        } else if outcome.is_failure() {
            self.record_failure();
        } else {
            self.record_success();
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.hedged_legs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.failed_legs.fetch_add(1, Ordering::SeqCst);

        if self.max_consecutive_failures > 0 && failures >= self.max_consecutive_failures {
            self.open_for_failures(failures);
        }
    }

    /// Blocks dispatch until [`Self::reset`].
    pub fn trip(&self) {
        *self.state.write() = BreakerState::Tripped;
        *self.last_trip_time.write() = Some(Instant::now());
        error!("Exposure breaker tripped: unhedged position, dispatch halted");
    }

    pub fn reset(&self) {
        *self.state.write() = BreakerState::Closed;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_trip_time.write() = None;
        info!("Exposure breaker reset");
    }

    fn open_for_failures(&self, failures: u32) {
        let mut state = self.state.write();
        // Never downgrade a trip to a timed pause.
        if *state == BreakerState::Tripped {
            return;
        }
        *state = BreakerState::Open;
        *self.last_trip_time.write() = Some(Instant::now());
        warn!(
            failures,
            pause_secs = self.pause.as_secs(),
            "Exposure breaker opened: too many consecutive failed cycles"
        );
    }

    fn close_after_pause(&self) {
        let mut state = self.state.write();
        if *state == BreakerState::Open {
            *state = BreakerState::Closed;
            self.consecutive_failures.store(0, Ordering::SeqCst);
            info!("Exposure breaker closed after pause");
        }
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        *self.state.read()
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn hedged_legs(&self) -> u64 {
        self.hedged_legs.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn failed_legs(&self) -> u64 {
        self.failed_legs.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use legsync_core::AbandonReason;

    #[test]
    fn test_hedged_resets_streak() {
        let breaker = ExposureBreaker::new(3, Duration::from_secs(60));

        breaker.record(&CycleOutcome::Failed("odds changed".into()));
        breaker.record(&CycleOutcome::Abandoned(AbandonReason::PartnerTimeout));
        assert_eq!(breaker.consecutive_failures(), 2);

        breaker.record(&CycleOutcome::Hedged);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.can_dispatch().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures_then_closes() {
        let breaker = ExposureBreaker::new(2, Duration::from_secs(30));

        breaker.record(&CycleOutcome::RolledBack);
        breaker.record(&CycleOutcome::Failed("rejected".into()));

        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(breaker.can_dispatch(), Err(BreakerError::Paused { .. })));

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(breaker.can_dispatch().is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_failure_trips_until_reset() {
        let breaker = ExposureBreaker::new(5, Duration::from_secs(1));

        breaker.record(&CycleOutcome::RollbackFailed);
        assert_eq!(breaker.state(), BreakerState::Tripped);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(breaker.can_dispatch(), Err(BreakerError::ExposureTripped));

        breaker.reset();
        assert!(breaker.can_dispatch().is_ok());
    }

    #[test]
    fn test_failure_streak_does_not_downgrade_trip() {
        let breaker = ExposureBreaker::new(1, Duration::from_secs(1));

        breaker.record(&CycleOutcome::RollbackFailed);
        breaker.record(&CycleOutcome::Failed("rejected".into()));

        assert_eq!(breaker.state(), BreakerState::Tripped);
    }

    #[test]
    fn test_zero_threshold_disables_pause() {
        let breaker = ExposureBreaker::new(0, Duration::from_secs(60));

        for _ in 0..10 {
            breaker.record(&CycleOutcome::Abandoned(AbandonReason::PartnerGone));
        }

        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failed_legs(), 10);
    }
}
