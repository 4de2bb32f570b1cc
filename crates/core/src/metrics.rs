//! Lock-free execution counters.
//!
//! Counters are bumped from any task and read as a [`MetricsSnapshot`]. They
//! never feed back into protocol decisions.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        /// Shared execution counters.
        #[derive(Debug, Default)]
        pub struct ExecutionMetrics {
            $($(#[$meta])* $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`ExecutionMetrics`].
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct MetricsSnapshot {
            $($(#[$meta])* pub $name: u64,)*
        }

        impl ExecutionMetrics {
            $(
                $(#[$meta])*
                pub fn $name(&self) -> u64 {
                    self.$name.load(Ordering::Relaxed)
                }
            )*

            /// Copies every counter.
            #[must_use]
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Opportunities handed to the platform queues.
    opportunities_dispatched,
    /// Leg cycles started by a platform worker.
    cycles_started,
    /// Legs accepted by a platform.
    legs_placed,
    /// Legs that failed to acquire or place.
    legs_failed,
    /// Cycles that stopped before placement.
    cycles_abandoned,
    /// Both legs placed.
    cycles_hedged,
    rollbacks_requested,
    rollbacks_succeeded,
    rollbacks_failed,
    /// Queued partner tasks removed after a readiness timeout.
    tasks_drained,
    retries_registered,
    retries_matched,
    retries_evicted,
    /// Ready signals dropped because the platform queue was full.
    ready_signals_dropped,
}

/// Counter selector for [`ExecutionMetrics::incr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    OpportunitiesDispatched,
    CyclesStarted,
    LegsPlaced,
    LegsFailed,
    CyclesAbandoned,
    CyclesHedged,
    RollbacksRequested,
    RollbacksSucceeded,
    RollbacksFailed,
    TasksDrained,
    RetriesRegistered,
    RetriesMatched,
    RetriesEvicted,
    ReadySignalsDropped,
}

impl ExecutionMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one to `counter`.
    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    /// Adds `n` to `counter`.
    pub fn add(&self, counter: Counter, n: u64) {
        let cell = match counter {
            Counter::OpportunitiesDispatched => &self.opportunities_dispatched,
            Counter::CyclesStarted => &self.cycles_started,
            Counter::LegsPlaced => &self.legs_placed,
            Counter::LegsFailed => &self.legs_failed,
            Counter::CyclesAbandoned => &self.cycles_abandoned,
            Counter::CyclesHedged => &self.cycles_hedged,
            Counter::RollbacksRequested => &self.rollbacks_requested,
            Counter::RollbacksSucceeded => &self.rollbacks_succeeded,
            Counter::RollbacksFailed => &self.rollbacks_failed,
            Counter::TasksDrained => &self.tasks_drained,
            Counter::RetriesRegistered => &self.retries_registered,
            Counter::RetriesMatched => &self.retries_matched,
            Counter::RetriesEvicted => &self.retries_evicted,
            Counter::ReadySignalsDropped => &self.ready_signals_dropped,
        };
        cell.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let metrics = ExecutionMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_incr_and_add() {
        let metrics = ExecutionMetrics::new();
        metrics.incr(Counter::LegsPlaced);
        metrics.incr(Counter::LegsPlaced);
        metrics.add(Counter::TasksDrained, 3);

        assert_eq!(metrics.legs_placed(), 2);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_drained, 3);
        assert_eq!(snapshot.rollbacks_failed, 0);
    }
}
