//! Re-drives legs the retry registry resurrected.
//!
//! A leg's price can come back while the cycle that refused it is still
//! unwinding the partner. Such a signal is held until that cycle finishes and
//! only then re-dispatched.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use legsync_core::{ExecutionEvent, Platform};
use legsync_retry::{ReadySignal, RetryRegistry};

use crate::dispatcher::{DispatchError, OpportunityDispatcher};

/// Consumes one platform's ready signals.
pub struct RetryRedriveWorker {
    platform: Platform,
    retry: Arc<RetryRegistry>,
    dispatcher: Arc<OpportunityDispatcher>,
    events: broadcast::Sender<ExecutionEvent>,
    poll: Duration,
    shutdown: watch::Receiver<bool>,
}

impl RetryRedriveWorker {
    #[must_use]
    pub fn new(
        platform: Platform,
        retry: Arc<RetryRegistry>,
        dispatcher: Arc<OpportunityDispatcher>,
        events: broadcast::Sender<ExecutionEvent>,
        poll: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            platform,
            retry,
            dispatcher,
            events,
            poll,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!(platform = %self.platform, "Retry re-drive worker started");
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let signal = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                signal = self.retry.next_ready_signal(&self.platform, self.poll) => signal,
            };

            let Some(signal) = signal else {
                continue;
            };
            tokio::select! {
                changed = shutdown.changed() => {
                    warn!(
                        opportunity = %signal.opportunity_id,
                        platform = %signal.platform,
                        "Shutdown while holding a ready signal, dropping it"
                    );
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.handle(&signal) => {}
            }
        }

        info!(platform = %self.platform, "Retry re-drive worker stopped");
    }

    /// Publishes the signal and asks the dispatcher for a new cycle, first
    /// waiting out the cycle that produced it if it is still running.
    /// Returns true if the opportunity was dispatched again.
    pub async fn handle(&self, signal: &ReadySignal) -> bool {
        let _ = self.events.send(ExecutionEvent::RetryReady {
            opportunity_id: signal.opportunity_id.clone(),
            platform: signal.platform.clone(),
            outcome_id: signal.outcome_id.clone(),
            odds: signal.odds,
        });

        let mut result = self.dispatcher.redispatch(signal);
        if matches!(result, Err(DispatchError::AlreadyActive(_))) {
            debug!(
                opportunity = %signal.opportunity_id,
                platform = %signal.platform,
                "Previous cycle still running, holding ready signal"
            );
            let settle = self.dispatcher.cycle_timeout();
            if self.dispatcher.wait_inactive(&signal.opportunity_id, settle).await {
                result = self.dispatcher.redispatch(signal);
            }
        }

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    opportunity = %signal.opportunity_id,
                    platform = %signal.platform,
                    reason = %e,
                    "Ready signal not re-driven"
                );
                false
            }
        }
    }
}
