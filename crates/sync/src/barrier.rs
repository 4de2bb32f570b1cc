//! Timeout-aware N-party barrier.
//!
//! Parties call [`Barrier::arrive`] once and may [`Barrier::wait`] for the
//! others with a deadline. The barrier can be broken (cooperative
//! cancellation), which releases every waiter immediately with
//! [`BarrierWait::Broken`]. Once released, a barrier can no longer be broken.
//!
//! The state lives in a `tokio::sync::watch` channel so an arrival is always
//! visible to a waiter before that waiter can observe a release.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// How a wait on a [`Barrier`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWait {
    /// Every party arrived.
    Released,
    /// The deadline passed first.
    TimedOut,
    /// The barrier was broken before every party arrived.
    Broken,
}

#[derive(Debug, Clone, Copy, Default)]
struct BarrierState {
    arrived: usize,
    broken: bool,
}

/// Rendezvous point for a fixed number of parties.
#[derive(Debug)]
pub struct Barrier {
    parties: usize,
    state: watch::Sender<BarrierState>,
}

impl Barrier {
    /// Creates a barrier for `parties` participants (at least one).
    #[must_use]
    pub fn new(parties: usize) -> Self {
        let (state, _) = watch::channel(BarrierState::default());
        Self {
            parties: parties.max(1),
            state,
        }
    }

    /// Creates the barrier used by every opportunity: exactly two agents.
    #[must_use]
    pub fn two_party() -> Self {
        Self::new(2)
    }

    /// Number of parties required for release.
    #[must_use]
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Records one arrival and returns the arrival count.
    ///
    /// Arrivals on a broken barrier, or beyond the party count, are ignored.
    pub fn arrive(&self) -> usize {
        let parties = self.parties;
        let mut count = 0;
        self.state.send_modify(|state| {
            if !state.broken && state.arrived < parties {
                state.arrived += 1;
            }
            count = state.arrived;
        });
        count
    }

    /// Breaks the barrier, waking every waiter.
    ///
    /// Returns false if the barrier had already released.
    pub fn break_barrier(&self) -> bool {
        let parties = self.parties;
        let mut broke = false;
        self.state.send_modify(|state| {
            if state.arrived < parties {
                state.broken = true;
                broke = true;
            }
        });
        broke
    }

    /// Returns true once every party has arrived.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.state.borrow().arrived >= self.parties
    }

    /// Returns true if the barrier was broken before release.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        let state = *self.state.borrow();
        state.broken && state.arrived < self.parties
    }

    /// Number of parties that have arrived.
    #[must_use]
    pub fn arrived(&self) -> usize {
        self.state.borrow().arrived
    }

    /// Waits until release, breakage, or `timeout`, whichever comes first.
    pub async fn wait(&self, timeout: Duration) -> BarrierWait {
        let deadline = Instant::now() + timeout;
        let mut rx = self.state.subscribe();

        loop {
            let state = *rx.borrow_and_update();
            if state.arrived >= self.parties {
                return BarrierWait::Released;
            }
            if state.broken {
                return BarrierWait::Broken;
            }

            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // The sender lives as long as `self`.
                Ok(Err(_)) => return BarrierWait::Broken,
                Err(_) => {
                    return if self.is_released() {
                        BarrierWait::Released
                    } else {
                        BarrierWait::TimedOut
                    };
                }
            }
        }
    }

    /// Arrives and then waits for the remaining parties.
    pub async fn arrive_and_wait(&self, timeout: Duration) -> BarrierWait {
        self.arrive();
        self.wait(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_two_parties_release() {
        let barrier = Arc::new(Barrier::two_party());
        let other = barrier.clone();

        let handle = tokio::spawn(async move { other.arrive_and_wait(Duration::from_secs(1)).await });
        let mine = barrier.arrive_and_wait(Duration::from_secs(1)).await;

        assert_eq!(mine, BarrierWait::Released);
        assert_eq!(handle.await.unwrap(), BarrierWait::Released);
        assert!(barrier.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_when_partner_absent() {
        let barrier = Barrier::two_party();
        let started = Instant::now();

        let result = barrier.arrive_and_wait(Duration::from_millis(250)).await;

        assert_eq!(result, BarrierWait::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(barrier.arrived(), 1);
    }

    #[tokio::test]
    async fn test_break_releases_waiter() {
        let barrier = Arc::new(Barrier::two_party());
        let waiter = barrier.clone();

        let handle = tokio::spawn(async move { waiter.arrive_and_wait(Duration::from_secs(30)).await });
        tokio::task::yield_now().await;
        assert!(barrier.break_barrier());

        assert_eq!(handle.await.unwrap(), BarrierWait::Broken);
        assert!(barrier.is_broken());
    }

    #[test]
    fn test_cannot_break_released_barrier() {
        let barrier = Barrier::two_party();
        barrier.arrive();
        barrier.arrive();

        assert!(!barrier.break_barrier());
        assert!(!barrier.is_broken());
        assert!(barrier.is_released());
    }

    #[test]
    fn test_arrivals_saturate() {
        let barrier = Barrier::new(2);
        assert_eq!(barrier.arrive(), 1);
        assert_eq!(barrier.arrive(), 2);
        assert_eq!(barrier.arrive(), 2);
    }

    #[test]
    fn test_arrival_after_break_ignored() {
        let barrier = Barrier::two_party();
        barrier.arrive();
        barrier.break_barrier();
        assert_eq!(barrier.arrive(), 1);
        assert!(!barrier.is_released());
    }

    #[tokio::test]
    async fn test_wait_on_already_released_returns_immediately() {
        let barrier = Barrier::new(1);
        barrier.arrive();
        assert_eq!(barrier.wait(Duration::from_millis(1)).await, BarrierWait::Released);
    }
}
