//! Long-lived per-platform worker.
//!
//! Pops tasks from its platform's queue in order and runs each cycle on its
//! own tokio task, awaiting it before taking the next one. A panicking cycle
//! surfaces as a `JoinError` here and does not take the worker down.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use legsync_core::LegResult;

use crate::driver::LegExecutionDriver;
use crate::queue::DispatchQueue;
use crate::task::LegTask;

pub struct PlatformWorker {
    driver: Arc<LegExecutionDriver>,
    queue: Arc<DispatchQueue>,
    poll: Duration,
    shutdown: watch::Receiver<bool>,
}

impl PlatformWorker {
    #[must_use]
    pub fn new(
        driver: Arc<LegExecutionDriver>,
        queue: Arc<DispatchQueue>,
        poll: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            driver,
            queue,
            poll,
            shutdown,
        }
    }

    /// Runs until shutdown is signalled. A cycle in flight is allowed to
    /// finish; abandoning it midway could leave one leg unhedged.
    pub async fn run(mut self) {
        let platform = self.driver.platform().clone();
        info!(platform = %platform, "Platform worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let task = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                task = self.queue.pop(self.poll) => task,
            };

            if let Some(task) = task {
                self.run_cycle(task).await;
            }
        }

        info!(platform = %platform, pending = self.queue.len(), "Platform worker stopped");
    }

    /// Runs one cycle on its own task. Returns `None` if the cycle panicked.
    pub async fn run_cycle(&self, task: LegTask) -> Option<LegResult> {
        let driver = self.driver.clone();
        let opportunity_id = task.opportunity_id.clone();

        match tokio::spawn(async move { driver.execute(task).await }).await {
            Ok(result) => Some(result),
            Err(e) => {
                error!(
                    opportunity = %opportunity_id,
                    platform = %self.driver.platform(),
                    error = %e,
                    "Leg cycle aborted"
                );
                None
            }
        }
    }
}
