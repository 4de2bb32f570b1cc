//! Wires every component together and supervises the background tasks.
//!
//! [`Runtime::start`] builds the coordinator, retry registry, dispatch
//! queues and breaker, spawns one execution worker and one retry re-drive
//! worker per platform, the dispatcher loop, the odds ingest pool, the
//! janitor and the event monitor, and returns a [`RuntimeHandle`].

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use legsync_core::{
    AppConfig, EscalationSink, ExecutionEvent, ExecutionMetrics, LegStore, MetricsSnapshot, OddsStream,
    OpportunitySource,
};
use legsync_execution::{AdapterRegistry, DispatchQueues, ExecutionContext, LegExecutionDriver, PlatformWorker};
use legsync_retry::RetryRegistry;
use legsync_sync::SyncCoordinator;

use crate::breaker::{BreakerState, ExposureBreaker};
use crate::dispatcher::OpportunityDispatcher;
use crate::odds_ingest::OddsIngestPool;
use crate::retry_worker::RetryRedriveWorker;

/// External collaborators handed to [`Runtime::start`].
pub struct Collaborators {
    pub adapters: AdapterRegistry,
    pub source: Arc<dyn OpportunitySource>,
    pub odds_streams: Vec<Box<dyn OddsStream>>,
    pub store: Arc<dyn LegStore>,
    pub escalation: Arc<dyn EscalationSink>,
}

/// Point-in-time view of a running runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub breaker: BreakerState,
    pub active_opportunities: usize,
    pub sync_entries: usize,
    pub queued_tasks: usize,
    pub odds_ingested: u64,
    pub metrics: MetricsSnapshot,
    pub taken_at: DateTime<Utc>,
}

pub struct Runtime;

impl Runtime {
    /// Validates `config` and starts every background task.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a configured
    /// platform has no adapter.
    pub fn start(config: AppConfig, collaborators: Collaborators) -> Result<RuntimeHandle> {
        config.validate().context("Invalid configuration")?;

        let Collaborators {
            adapters,
            source,
            odds_streams,
            store,
            escalation,
        } = collaborators;

        let platforms = config.dispatch.platforms.clone();
        let mut platform_adapters = Vec::with_capacity(platforms.len());
        for platform in &platforms {
            let adapter = adapters
                .get(platform)
                .with_context(|| format!("Platform {platform} is configured but has no adapter"))?;
            platform_adapters.push((platform.clone(), adapter));
        }

        let metrics = Arc::new(ExecutionMetrics::new());
        let (events, _) = broadcast::channel(config.runtime.event_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let coordinator = Arc::new(SyncCoordinator::new(escalation.clone()));
        let retry = Arc::new(RetryRegistry::new(config.retry.clone(), metrics.clone()));
        let queues = Arc::new(DispatchQueues::new(&platforms));
        let breaker = Arc::new(ExposureBreaker::from_config(&config.runtime));

        let ctx = ExecutionContext {
            config: config.execution.clone(),
            coordinator: coordinator.clone(),
            retry: retry.clone(),
            queues: queues.clone(),
            store,
            escalation,
            events: events.clone(),
            metrics: metrics.clone(),
        };

        let dispatcher = Arc::new(OpportunityDispatcher::new(
            source,
            queues.clone(),
            breaker.clone(),
            metrics.clone(),
            config.dispatch.clone(),
            config.execution.cycle_timeout,
        ));

        let mut tasks = Vec::new();

        // Subscribe before any worker can publish.
        tasks.push(tokio::spawn(monitor_events(
            events.subscribe(),
            breaker.clone(),
            shutdown_rx.clone(),
        )));

        for (platform, adapter) in platform_adapters {
            let Some(queue) = queues.get(&platform) else {
                continue;
            };
            let driver = Arc::new(LegExecutionDriver::new(adapter, ctx.clone()));
            let worker = PlatformWorker::new(driver, queue, config.runtime.worker_poll, shutdown_rx.clone());
            tasks.push(tokio::spawn(worker.run()));

            let redrive = RetryRedriveWorker::new(
                platform,
                retry.clone(),
                dispatcher.clone(),
                events.clone(),
                config.runtime.worker_poll,
                shutdown_rx.clone(),
            );
            tasks.push(tokio::spawn(redrive.run()));
        }

        tasks.push(tokio::spawn(dispatcher.clone().run(shutdown_rx.clone())));
        tasks.push(tokio::spawn(run_janitor(
            coordinator.clone(),
            retry.clone(),
            config.runtime.sweep_interval,
            config.execution.stale_entry,
            shutdown_rx.clone(),
        )));

        let odds = OddsIngestPool::start(
            odds_streams,
            retry.clone(),
            config.runtime.odds_workers,
            config.runtime.odds_buffer,
            shutdown_rx,
        );

        info!(
            platforms = ?platforms.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Runtime started"
        );

        Ok(RuntimeHandle {
            shutdown_tx,
            events,
            metrics,
            breaker,
            coordinator,
            retry,
            queues,
            dispatcher,
            odds,
            tasks,
        })
    }
}

/// Control surface of a running [`Runtime`].
pub struct RuntimeHandle {
    shutdown_tx: watch::Sender<bool>,
    events: broadcast::Sender<ExecutionEvent>,
    metrics: Arc<ExecutionMetrics>,
    breaker: Arc<ExposureBreaker>,
    coordinator: Arc<SyncCoordinator>,
    retry: Arc<RetryRegistry>,
    queues: Arc<DispatchQueues>,
    dispatcher: Arc<OpportunityDispatcher>,
    odds: OddsIngestPool,
    tasks: Vec<JoinHandle<()>>,
}

impl RuntimeHandle {
    /// Subscribe to execution events published from now on.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            breaker: self.breaker.state(),
            active_opportunities: self.dispatcher.active_count(),
            sync_entries: self.coordinator.len(),
            queued_tasks: self.queued_tasks(),
            odds_ingested: self.odds.ingested(),
            metrics: self.metrics.snapshot(),
            taken_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Operator reset after a tripped breaker.
    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<OpportunityDispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    #[must_use]
    pub fn retry(&self) -> &Arc<RetryRegistry> {
        &self.retry
    }

    fn queued_tasks(&self) -> usize {
        self.queues
            .platforms()
            .filter_map(|p| self.queues.get(p))
            .map(|q| q.len())
            .sum()
    }

    /// Waits until nothing is queued, active or registered. Returns false if
    /// `timeout` passes first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.dispatcher.active_count() == 0 && self.queued_tasks() == 0 && self.coordinator.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stops dispatching, lets cycles in flight finish, and joins every task.
    pub async fn shutdown(self) -> MetricsSnapshot {
        info!("Runtime shutting down");
        let _ = self.shutdown_tx.send(true);

        for handle in self.tasks {
            if let Err(e) = handle.await {
                warn!(error = %e, "Runtime task aborted");
            }
        }
        self.odds.join().await;

        let snapshot = self.metrics.snapshot();
        info!(
            dispatched = snapshot.opportunities_dispatched,
            hedged = snapshot.cycles_hedged,
            rollbacks_failed = snapshot.rollbacks_failed,
            "Runtime stopped"
        );
        snapshot
    }
}

// =============================================================================
// Background tasks
// =============================================================================

async fn monitor_events(
    mut events: broadcast::Receiver<ExecutionEvent>,
    breaker: Arc<ExposureBreaker>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            event = events.recv() => event,
        };

        match event {
            Ok(ExecutionEvent::LegCompleted(result)) => breaker.record(&result.outcome),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event monitor lagged, breaker may miss outcomes");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_janitor(
    coordinator: Arc<SyncCoordinator>,
    retry: Arc<RetryRegistry>,
    interval: Duration,
    stale_entry: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let expired = retry.sweep_expired();
                let pruned = coordinator.prune_stale(stale_entry);
                if expired > 0 || !pruned.is_empty() {
                    debug!(expired, pruned = pruned.len(), "Janitor pass");
                }
            }
        }
    }
}
