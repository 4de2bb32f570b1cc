//! Runtime lifecycle tests with paper adapters on both platforms.
//!
//! Covers:
//! - a hedged opportunity flowing from source to both workers
//! - a price-moved leg re-driven after the odds come back, including odds
//!   that return while the partner is still rolling back
//! - a cycle outliving its timeout is not dispatched a second time
//! - a failed rollback tripping the breaker until an operator reset
//! - startup validation and clean shutdown

use chrono::Utc;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use legsync_core::{
    AppConfig, CycleOutcome, DispatchConfig, ExecutionConfig, ExecutionEvent, InMemoryLegStore, LegQuote,
    OddsEvent, Opportunity, OpportunityId, OutcomeId, OutcomeOdds, Platform, RecordingEscalation, RetryConfig,
    RuntimeConfig,
};
use legsync_execution::{AdapterRegistry, PaperAdapter, PaperPlacement, PaperScript};
use legsync_orchestrator::{
    BreakerState, ChannelOddsStream, Collaborators, QueuedSource, Runtime, RuntimeHandle,
};

// =============================================================================
// Helper Functions
// =============================================================================

struct TestRuntime {
    handle: RuntimeHandle,
    source: Arc<QueuedSource>,
    x: Arc<PaperAdapter>,
    y: Arc<PaperAdapter>,
    escalation: Arc<RecordingEscalation>,
    odds_tx: mpsc::Sender<OddsEvent>,
    events: broadcast::Receiver<ExecutionEvent>,
}

fn x() -> Platform {
    Platform::new("x")
}

fn y() -> Platform {
    Platform::new("y")
}

fn create_test_config() -> AppConfig {
    AppConfig {
        execution: ExecutionConfig {
            ready_timeout: Duration::from_secs(2),
            outcome_timeout: Duration::from_secs(2),
            cycle_timeout: Duration::from_secs(10),
            stale_entry: Duration::from_secs(60),
        },
        retry: RetryConfig {
            tolerance_pct: dec!(2),
            require_at_least_target: false,
            ttl: Duration::from_secs(60),
            max_attempts: 3,
            ready_queue_capacity: 8,
        },
        dispatch: DispatchConfig {
            poll_interval: Duration::from_millis(20),
            min_profit_pct: dec!(1),
            max_age: Duration::from_secs(5),
            require_continuity: true,
            platforms: vec![x(), y()],
        },
        runtime: RuntimeConfig {
            odds_workers: 2,
            odds_buffer: 64,
            worker_poll: Duration::from_millis(20),
            sweep_interval: Duration::from_millis(50),
            max_consecutive_failures: 10,
            failure_pause: Duration::from_secs(60),
            event_buffer: 256,
        },
    }
}

fn create_test_runtime() -> TestRuntime {
    create_test_runtime_with(create_test_config(), PaperAdapter::new(x()), PaperAdapter::new(y()))
}

fn create_test_runtime_with(config: AppConfig, x: PaperAdapter, y: PaperAdapter) -> TestRuntime {
    let source = Arc::new(QueuedSource::new());
    let x = Arc::new(x);
    let y = Arc::new(y);
    let escalation = Arc::new(RecordingEscalation::new());
    let (odds_tx, odds_stream) = ChannelOddsStream::channel(16);

    let mut adapters = AdapterRegistry::new();
    adapters.register(x.clone()).unwrap();
    adapters.register(y.clone()).unwrap();

    let handle = Runtime::start(
        config,
        Collaborators {
            adapters,
            source: source.clone(),
            odds_streams: vec![Box::new(odds_stream)],
            store: Arc::new(InMemoryLegStore::new()),
            escalation: escalation.clone(),
        },
    )
    .unwrap();
    let events = handle.subscribe_events();

    TestRuntime {
        handle,
        source,
        x,
        y,
        escalation,
        odds_tx,
        events,
    }
}

/// X quotes 2.10 on home, Y quotes 1.95 on away.
fn create_test_opportunity(id: &str) -> Opportunity {
    Opportunity {
        id: OpportunityId::new(id),
        leg_a: LegQuote {
            platform: x(),
            outcome_id: OutcomeId::new("home"),
            odds: dec!(2.10),
            stake: dec!(48),
        },
        leg_b: LegQuote {
            platform: y(),
            outcome_id: OutcomeId::new("away"),
            odds: dec!(1.95),
            stake: dec!(52),
        },
        profit_pct: dec!(2.4),
        observed_at: Utc::now(),
        continuous: true,
    }
}

/// Collects `n` leg results, failing the test after a few seconds.
async fn next_results(
    events: &mut broadcast::Receiver<ExecutionEvent>,
    n: usize,
) -> Vec<(Platform, CycleOutcome)> {
    let mut results = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while results.len() < n {
            if let Ok(ExecutionEvent::LegCompleted(result)) = events.recv().await {
                results.push((result.platform, result.outcome));
            }
        }
    })
    .await
    .expect("leg results");
    results.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
    results
}

fn odds_back_for_y() -> OddsEvent {
    OddsEvent::new(
        "match-1",
        y(),
        vec![OutcomeOdds {
            outcome_id: OutcomeId::new("away"),
            odds: dec!(1.96),
        }],
    )
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn hedged_opportunity_runs_end_to_end() {
    let mut rt = create_test_runtime();
    rt.source.push(create_test_opportunity("opp-1"));

    let results = next_results(&mut rt.events, 2).await;

    assert_eq!(results, vec![(x(), CycleOutcome::Hedged), (y(), CycleOutcome::Hedged)]);
    assert!(rt.handle.wait_idle(Duration::from_secs(2)).await);
    assert_eq!(rt.x.placed_bets().len(), 1);
    assert_eq!(rt.y.placed_bets().len(), 1);

    let status = rt.handle.status();
    assert_eq!(status.metrics.opportunities_dispatched, 1);
    assert_eq!(status.metrics.cycles_hedged, 2);
    assert_eq!(status.sync_entries, 0);
    assert_eq!(status.breaker, BreakerState::Closed);

    rt.handle.shutdown().await;
}

#[tokio::test]
async fn price_moved_leg_is_redriven_when_odds_return() {
    let mut rt = create_test_runtime();
    let id = OpportunityId::new("opp-1");
    rt.y.script_for(
        id.clone(),
        PaperScript::accepting().with_placement(PaperPlacement::PriceMoved("odds changed".into())),
    );
    rt.source.push(create_test_opportunity("opp-1"));

    let first = next_results(&mut rt.events, 2).await;
    assert_eq!(first[0], (x(), CycleOutcome::RolledBack));
    assert_eq!(first[1], (y(), CycleOutcome::Failed("odds changed".into())));
    assert!(rt.handle.wait_idle(Duration::from_secs(2)).await);
    assert_eq!(rt.handle.retry().pending(&y()), 1);

    // The book is accepting again and the price is back inside the band.
    rt.y.script_for(id.clone(), PaperScript::accepting());
    rt.odds_tx.send(odds_back_for_y()).await.unwrap();

    let second = next_results(&mut rt.events, 2).await;
    assert_eq!(second, vec![(x(), CycleOutcome::Hedged), (y(), CycleOutcome::Hedged)]);

    let retried = rt.y.placed_bets();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].leg.odds, dec!(1.96));
    assert_eq!(rt.handle.retry().pending(&y()), 0);
    assert_eq!(rt.handle.metrics().opportunities_dispatched, 2);

    rt.handle.shutdown().await;
}

#[tokio::test]
async fn odds_returning_during_partner_rollback_are_not_lost() {
    // X is slow to place and slow to unwind.
    let mut rt = create_test_runtime_with(
        create_test_config(),
        PaperAdapter::new(x()).with_latency(Duration::from_millis(600)),
        PaperAdapter::new(y()),
    );
    let id = OpportunityId::new("opp-1");
    rt.y.script_for(
        id.clone(),
        PaperScript::accepting().with_placement(PaperPlacement::PriceMoved("odds changed".into())),
    );
    rt.source.push(create_test_opportunity("opp-1"));

    // X has started unwinding and Y's leg is waiting for its price.
    assert!(eventually(|| rt.handle.metrics().rollbacks_requested == 1).await);
    assert!(eventually(|| rt.handle.retry().pending(&y()) == 1).await);
    assert!(rt.handle.dispatcher().is_active(&id));

    rt.y.script_for(id.clone(), PaperScript::accepting());
    rt.odds_tx.send(odds_back_for_y()).await.unwrap();
    assert!(eventually(|| rt.handle.retry().pending(&y()) == 0).await);

    let first = next_results(&mut rt.events, 2).await;
    assert_eq!(first[0], (x(), CycleOutcome::RolledBack));
    assert_eq!(first[1], (y(), CycleOutcome::Failed("odds changed".into())));

    let second = next_results(&mut rt.events, 2).await;
    assert_eq!(second, vec![(x(), CycleOutcome::Hedged), (y(), CycleOutcome::Hedged)]);
    assert_eq!(rt.y.placed_bets()[0].leg.odds, dec!(1.96));
    assert_eq!(rt.handle.metrics().opportunities_dispatched, 2);

    rt.handle.shutdown().await;
}

#[tokio::test]
async fn overdue_cycle_is_not_dispatched_again() {
    let mut config = create_test_config();
    config.execution.ready_timeout = Duration::from_millis(100);
    config.execution.outcome_timeout = Duration::from_millis(100);
    config.execution.cycle_timeout = Duration::from_millis(200);
    // X places long after Y stopped waiting for it.
    let mut rt = create_test_runtime_with(
        config,
        PaperAdapter::new(x()).with_latency(Duration::from_millis(700)),
        PaperAdapter::new(y()),
    );
    let id = OpportunityId::new("opp-1");
    rt.source.push(create_test_opportunity("opp-1"));

    let first = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ExecutionEvent::LegCompleted(result)) = rt.events.recv().await {
                break result;
            }
        }
    })
    .await
    .expect("y finishes first");
    assert_eq!((first.platform, first.outcome), (y(), CycleOutcome::RolledBack));

    // Past the cycle timeout with X still in flight.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(rt.handle.dispatcher().is_active(&id));
    rt.source.push(create_test_opportunity("opp-1"));
    assert!(eventually(|| rt.source.is_empty()).await);

    let rest = next_results(&mut rt.events, 1).await;
    assert_eq!(rest, vec![(x(), CycleOutcome::RolledBack)]);
    assert!(rt.handle.wait_idle(Duration::from_secs(2)).await);

    assert_eq!(rt.handle.metrics().opportunities_dispatched, 1);
    assert_eq!(rt.x.placed_bets().len(), 1);
    assert_eq!(rt.x.rollbacks().len(), 1);
    assert_eq!(rt.y.rollbacks().len(), 1);
    assert_eq!(rt.escalation.critical_count(), 0);
    assert_eq!(rt.handle.status().sync_entries, 0);

    rt.handle.shutdown().await;
}

#[tokio::test]
async fn failed_rollback_trips_breaker_until_reset() {
    let mut rt = create_test_runtime();
    rt.x.script_for(OpportunityId::new("opp-1"), PaperScript::accepting().with_rollback(false));
    rt.y.script_for(
        OpportunityId::new("opp-1"),
        PaperScript::accepting().with_placement(PaperPlacement::Reject("market suspended".into())),
    );
    rt.source.push(create_test_opportunity("opp-1"));

    let results = next_results(&mut rt.events, 2).await;
    assert_eq!(results[0], (x(), CycleOutcome::RollbackFailed));
    assert!(eventually(|| rt.handle.breaker_state() == BreakerState::Tripped).await);
    assert!(rt.escalation.critical_count() >= 1);

    rt.source.push(create_test_opportunity("opp-2"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rt.handle.metrics().opportunities_dispatched, 1);
    assert_eq!(rt.source.len(), 1);

    rt.handle.reset_breaker();
    let results = next_results(&mut rt.events, 2).await;
    assert_eq!(results, vec![(x(), CycleOutcome::Hedged), (y(), CycleOutcome::Hedged)]);

    rt.handle.shutdown().await;
}

#[tokio::test]
async fn start_rejects_platform_without_adapter() {
    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(PaperAdapter::new(x()))).unwrap();

    let result = Runtime::start(
        create_test_config(),
        Collaborators {
            adapters,
            source: Arc::new(QueuedSource::new()),
            odds_streams: Vec::new(),
            store: Arc::new(InMemoryLegStore::new()),
            escalation: Arc::new(RecordingEscalation::new()),
        },
    );

    let err = result.err().expect("missing adapter rejected");
    assert!(err.to_string().contains("has no adapter"));
}

#[tokio::test]
async fn shutdown_joins_every_task() {
    let rt = create_test_runtime();

    let snapshot = tokio::time::timeout(Duration::from_secs(2), rt.handle.shutdown())
        .await
        .expect("shutdown completes");

    assert_eq!(snapshot.opportunities_dispatched, 0);
}
