//! Per-platform FIFO dispatch queues.
//!
//! A queue supports removing every task of one opportunity, which the driver
//! uses to stop a partner task from starting after a readiness timeout.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use legsync_core::{OpportunityId, Platform};

use crate::error::ExecutionError;
use crate::task::LegTask;

/// Unbounded FIFO of tasks for one platform.
#[derive(Debug)]
pub struct DispatchQueue {
    platform: Platform,
    tasks: Mutex<VecDeque<LegTask>>,
    notify: Notify,
}

impl DispatchQueue {
    #[must_use]
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            tasks: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    #[must_use]
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn push(&self, task: LegTask) {
        debug!(platform = %self.platform, opportunity = %task.opportunity_id, "Task queued");
        self.tasks.lock().push_back(task);
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<LegTask> {
        self.tasks.lock().pop_front()
    }

    /// Waits up to `timeout` for the next task.
    pub async fn pop(&self, timeout: Duration) -> Option<LegTask> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_pop() {
                return Some(task);
            }
            // notify_one stores a permit when nobody waits, so a push between
            // the check above and this wait is not lost.
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_pop();
            }
        }
    }

    /// Removes and returns every queued task for `opportunity_id`.
    pub fn drain_opportunity(&self, opportunity_id: &OpportunityId) -> Vec<LegTask> {
        let mut tasks = self.tasks.lock();
        let mut drained = Vec::new();
        tasks.retain(|task| {
            if &task.opportunity_id == opportunity_id {
                drained.push(task.clone());
                false
            } else {
                true
            }
        });
        drained
    }

    #[must_use]
    pub fn contains(&self, opportunity_id: &OpportunityId) -> bool {
        self.tasks
            .lock()
            .iter()
            .any(|task| &task.opportunity_id == opportunity_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

/// The fixed set of platform queues, built once at startup.
#[derive(Debug, Default)]
pub struct DispatchQueues {
    queues: HashMap<Platform, Arc<DispatchQueue>>,
}

impl DispatchQueues {
    #[must_use]
    pub fn new<'a>(platforms: impl IntoIterator<Item = &'a Platform>) -> Self {
        let queues = platforms
            .into_iter()
            .map(|platform| (platform.clone(), Arc::new(DispatchQueue::new(platform.clone()))))
            .collect();
        Self { queues }
    }

    #[must_use]
    pub fn get(&self, platform: &Platform) -> Option<Arc<DispatchQueue>> {
        self.queues.get(platform).cloned()
    }

    /// Queues `task` on its platform.
    ///
    /// # Errors
    /// Returns `ExecutionError::NoQueue` for a platform without a queue.
    pub fn push(&self, task: LegTask) -> Result<(), ExecutionError> {
        let queue = self
            .queues
            .get(&task.platform)
            .ok_or_else(|| ExecutionError::NoQueue(task.platform.clone()))?;
        queue.push(task);
        Ok(())
    }

    #[must_use]
    pub fn has(&self, platform: &Platform) -> bool {
        self.queues.contains_key(platform)
    }

    pub fn platforms(&self) -> impl Iterator<Item = &Platform> {
        self.queues.keys()
    }
}
