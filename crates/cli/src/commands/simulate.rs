//! Scripted scenarios against paper platforms.
//!
//! Every opportunity is pushed, executed and reported before the next one,
//! so the outcome of each is attributable to its script.
//!
//! ```bash
//! legsync simulate --scenario hedged --count 5
//! legsync simulate --scenario rollback-failed --json
//! ```

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Args, ValueEnum};
use rust_decimal_macros::dec;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use legsync_core::{
    AppConfig, ConfigLoader, CycleOutcome, DispatchConfig, ExecutionConfig, ExecutionEvent, InMemoryLegStore,
    LegQuote, LogEscalation, MetricsFormatter, MetricsSnapshot, OddsEvent, Opportunity, OpportunityId,
    OutcomeId, OutcomeOdds, Platform, RetryConfig, RuntimeConfig,
};
use legsync_execution::{AdapterRegistry, PaperAdapter, PaperPlacement, PaperScript};
use legsync_orchestrator::{BreakerState, ChannelOddsStream, Collaborators, QueuedSource, Runtime, RuntimeHandle};

/// Scenario to simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Both platforms accept
    #[default]
    Hedged,
    /// Second platform refuses, first leg is rolled back
    Rollback,
    /// Second platform refuses and the rollback fails
    RollbackFailed,
    /// Second platform is too slow to get ready
    NoShow,
    /// Second platform refuses on price, then the price comes back
    Retry,
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hedged => write!(f, "hedged"),
            Self::Rollback => write!(f, "rollback"),
            Self::RollbackFailed => write!(f, "rollback-failed"),
            Self::NoShow => write!(f, "no-show"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Scenario to run
    #[arg(long, default_value = "hedged", value_enum)]
    pub scenario: Scenario,

    /// Number of opportunities
    #[arg(long, default_value = "1")]
    pub count: usize,

    /// Config file path. A built-in fast configuration is used if omitted.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// One leg's outcome.
#[derive(Debug, Clone, Serialize)]
pub struct LegReport {
    pub platform: Platform,
    pub outcome: CycleOutcome,
    pub bet_ref: Option<String>,
}

/// Every cycle run for one opportunity.
#[derive(Debug, Clone, Serialize)]
pub struct OpportunityReport {
    pub opportunity_id: OpportunityId,
    pub legs: Vec<LegReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub scenario: Scenario,
    pub opportunities: Vec<OpportunityReport>,
    pub metrics: MetricsSnapshot,
}

/// Runs the chosen scenario and prints the report.
///
/// # Errors
/// Returns an error if the configuration is invalid or a cycle does not
/// finish in time.
pub async fn run_simulation(args: SimulateArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => ConfigLoader::load_from(path, None)?,
        None => simulation_config(),
    };

    let report = simulate(config, args.scenario, args.count).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report).context("Failed to render report")?);
        return Ok(());
    }

    println!();
    println!("Scenario: {}", report.scenario);
    for opportunity in &report.opportunities {
        let legs = opportunity
            .legs
            .iter()
            .map(|leg| format!("{}: {:?}", leg.platform, leg.outcome))
            .collect::<Vec<_>>()
            .join("  ");
        println!("  {:<12} {}", opportunity.opportunity_id.as_str(), legs);
    }
    println!("{}", MetricsFormatter::format(&report.metrics));
    Ok(())
}

/// Starts a runtime, plays `count` opportunities through `scenario`, and
/// shuts it down again.
///
/// # Errors
/// Returns an error if the runtime cannot start or a cycle does not finish
/// within twice the cycle timeout.
pub async fn simulate(config: AppConfig, scenario: Scenario, count: usize) -> Result<SimulationReport> {
    let [first, second] = match config.dispatch.platforms.as_slice() {
        [a, b, ..] => [a.clone(), b.clone()],
        _ => return Err(anyhow!("Simulation needs at least two platforms")),
    };
    let wait = config.execution.cycle_timeout * 2;

    let source = Arc::new(QueuedSource::new());
    let first_adapter = Arc::new(PaperAdapter::new(first.clone()));
    let second_adapter = Arc::new(PaperAdapter::new(second.clone()));
    let (odds_tx, odds_stream) = ChannelOddsStream::channel(64);

    let mut adapters = AdapterRegistry::new();
    adapters.register(first_adapter.clone())?;
    adapters.register(second_adapter.clone())?;
    for platform in config.dispatch.platforms.iter().skip(2) {
        adapters.register(Arc::new(PaperAdapter::new(platform.clone())))?;
    }

    let ready_timeout = config.execution.ready_timeout;
    let handle = Runtime::start(
        config,
        Collaborators {
            adapters,
            source: source.clone(),
            odds_streams: vec![Box::new(odds_stream)],
            store: Arc::new(InMemoryLegStore::new()),
            escalation: Arc::new(LogEscalation),
        },
    )?;
    let mut events = handle.subscribe_events();
    let mut opportunities = Vec::with_capacity(count);

    for n in 1..=count {
        let opportunity = simulated_opportunity(n, &first, &second);
        let id = opportunity.id.clone();
        let refused_quote = opportunity.leg_b.clone();

        match scenario {
            Scenario::Hedged => {}
            Scenario::Rollback => second_adapter.script_for(
                id.clone(),
                PaperScript::accepting().with_placement(PaperPlacement::Reject("odds changed".into())),
            ),
            Scenario::RollbackFailed => {
                second_adapter.script_for(
                    id.clone(),
                    PaperScript::accepting().with_placement(PaperPlacement::Reject("odds changed".into())),
                );
                first_adapter.script_for(id.clone(), PaperScript::accepting().with_rollback(false));
            }
            Scenario::NoShow => second_adapter.script_for(
                id.clone(),
                PaperScript::accepting().with_acquire_delay(ready_timeout + Duration::from_millis(500)),
            ),
            Scenario::Retry => second_adapter.script_for(
                id.clone(),
                PaperScript::accepting().with_placement(PaperPlacement::PriceMoved("odds changed".into())),
            ),
        }

        source.push(opportunity);
        let mut legs = collect_legs(&mut events, &id, 2, wait).await?;

        if scenario == Scenario::Retry {
            wait_idle(&handle, wait).await?;
            second_adapter.script_for(id.clone(), PaperScript::accepting());
            let fresh = OddsEvent::new(
                format!("event-{n}"),
                second.clone(),
                vec![OutcomeOdds {
                    outcome_id: refused_quote.outcome_id.clone(),
                    odds: refused_quote.odds,
                }],
            );
            odds_tx.send(fresh).await.context("Odds stream closed")?;
            legs.extend(collect_legs(&mut events, &id, 2, wait).await?);
        }

        if scenario == Scenario::RollbackFailed {
            wait_for_trip(&handle, wait).await;
            warn!(opportunity = %id, "Resetting breaker for the next simulated opportunity");
            handle.reset_breaker();
        }
        wait_idle(&handle, wait).await?;

        info!(opportunity = %id, legs = legs.len(), "Simulated opportunity finished");
        opportunities.push(OpportunityReport {
            opportunity_id: id,
            legs,
        });
    }

    let metrics = handle.shutdown().await;
    Ok(SimulationReport {
        scenario,
        opportunities,
        metrics,
    })
}

async fn wait_idle(handle: &RuntimeHandle, wait: Duration) -> Result<()> {
    if handle.wait_idle(wait).await {
        Ok(())
    } else {
        Err(anyhow!("Runtime did not go idle within {}ms", wait.as_millis()))
    }
}

/// The breaker learns about outcomes from its own event subscription, so it
/// may trip slightly after the results reach us.
async fn wait_for_trip(handle: &RuntimeHandle, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    while handle.breaker_state() != BreakerState::Tripped && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn collect_legs(
    events: &mut broadcast::Receiver<ExecutionEvent>,
    opportunity_id: &OpportunityId,
    n: usize,
    wait: Duration,
) -> Result<Vec<LegReport>> {
    let mut legs = Vec::with_capacity(n);
    let collected = tokio::time::timeout(wait, async {
        while legs.len() < n {
            match events.recv().await {
                Ok(ExecutionEvent::LegCompleted(result)) if &result.opportunity_id == opportunity_id => {
                    legs.push(LegReport {
                        platform: result.platform,
                        outcome: result.outcome,
                        bet_ref: result.bet_ref,
                    });
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "Simulation lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;

    if collected.is_err() || legs.len() < n {
        return Err(anyhow!(
            "Opportunity {} produced {} of {} leg results in time",
            opportunity_id,
            legs.len(),
            n
        ));
    }
    legs.sort_by(|a, b| a.platform.as_str().cmp(b.platform.as_str()));
    Ok(legs)
}

fn simulated_opportunity(n: usize, first: &Platform, second: &Platform) -> Opportunity {
    Opportunity {
        id: OpportunityId::new(format!("sim-{n:03}")),
        leg_a: LegQuote {
            platform: first.clone(),
            outcome_id: OutcomeId::new(format!("event-{n}:home")),
            odds: dec!(2.10),
            stake: dec!(48),
        },
        leg_b: LegQuote {
            platform: second.clone(),
            outcome_id: OutcomeId::new(format!("event-{n}:away")),
            odds: dec!(1.95),
            stake: dec!(52),
        },
        profit_pct: dec!(1.1),
        observed_at: Utc::now(),
        continuous: true,
    }
}

/// Short timeouts so every scenario finishes in a few seconds.
#[must_use]
pub fn simulation_config() -> AppConfig {
    AppConfig {
        execution: ExecutionConfig {
            ready_timeout: Duration::from_secs(1),
            outcome_timeout: Duration::from_secs(1),
            cycle_timeout: Duration::from_secs(5),
            stale_entry: Duration::from_secs(30),
        },
        retry: RetryConfig {
            tolerance_pct: dec!(2),
            require_at_least_target: false,
            ttl: Duration::from_secs(30),
            max_attempts: 3,
            ready_queue_capacity: 16,
        },
        dispatch: DispatchConfig {
            poll_interval: Duration::from_millis(50),
            min_profit_pct: dec!(0.5),
            max_age: Duration::from_secs(5),
            require_continuity: true,
            platforms: vec![Platform::new("alpha"), Platform::new("beta")],
        },
        runtime: RuntimeConfig {
            odds_workers: 2,
            odds_buffer: 64,
            worker_poll: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(500),
            max_consecutive_failures: 0,
            failure_pause: Duration::from_secs(5),
            event_buffer: 1024,
        },
    }
}
