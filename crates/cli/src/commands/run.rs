//! Runtime command.
//!
//! Starts the full runtime with a paper adapter per configured platform,
//! reading opportunities from a JSON file and, optionally, replaying live
//! odds from a JSON-lines file.
//!
//! ```bash
//! legsync run --opportunities data/opportunities.json --restamp
//! legsync run --opportunities data/opportunities.json --odds data/odds.jsonl --duration 10m
//! ```

use anyhow::{anyhow, Result};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use legsync_core::{
    ConfigLoader, ExecutionEvent, InMemoryLegStore, LogEscalation, MetricsFormatter, OddsStream,
};
use legsync_execution::{AdapterRegistry, PaperAdapter};
use legsync_orchestrator::{Collaborators, JsonFileSource, JsonLinesOddsStream, Runtime};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,

    /// Profile overlay (reads Config.{profile}.toml next to the base file)
    #[arg(short, long)]
    pub profile: Option<String>,

    /// JSON array of opportunities, re-read on every poll
    #[arg(long)]
    pub opportunities: String,

    /// JSON-lines file of odds events to replay into the retry registry
    #[arg(long)]
    pub odds: Option<String>,

    /// Stamp opportunities with the read time instead of their recorded time
    #[arg(long)]
    pub restamp: bool,

    /// Simulated latency of each paper placement, in milliseconds
    #[arg(long, default_value = "0")]
    pub latency_ms: u64,

    /// How long to run (e.g., "30s", "10m", "2h"). Runs until Ctrl+C if omitted.
    #[arg(long)]
    pub duration: Option<String>,
}

/// Runs the runtime until the duration elapses or Ctrl+C.
///
/// # Errors
/// Returns an error if the configuration, the odds file or the runtime
/// wiring is invalid.
pub async fn run_runtime(args: RunArgs) -> Result<()> {
    let config = ConfigLoader::load_from(&args.config, args.profile.as_deref())?;
    let duration = args.duration.as_deref().map(parse_duration).transpose()?;

    let mut adapters = AdapterRegistry::new();
    for platform in &config.dispatch.platforms {
        let adapter = PaperAdapter::new(platform.clone()).with_latency(Duration::from_millis(args.latency_ms));
        adapters.register(Arc::new(adapter))?;
    }

    let mut odds_streams: Vec<Box<dyn OddsStream>> = Vec::new();
    if let Some(path) = &args.odds {
        odds_streams.push(Box::new(JsonLinesOddsStream::open(path).await?));
    }

    let source = JsonFileSource::new(&args.opportunities).restamped(args.restamp);
    let handle = Runtime::start(
        config,
        Collaborators {
            adapters,
            source: Arc::new(source),
            odds_streams,
            store: Arc::new(InMemoryLegStore::new()),
            escalation: Arc::new(LogEscalation),
        },
    )?;

    let reporter = tokio::spawn(report_events(handle.subscribe_events()));
    info!(opportunities = %args.opportunities, "Runtime running, press Ctrl+C to stop");

    match duration {
        Some(duration) => {
            tokio::select! {
                () = tokio::time::sleep(duration) => info!("Run duration elapsed"),
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl+C, shutting down");
        }
    }

    let status = handle.status();
    if status.active_opportunities > 0 {
        warn!(active = status.active_opportunities, "Stopping with cycles in flight");
    }

    let snapshot = handle.shutdown().await;
    reporter.abort();
    println!("{}", MetricsFormatter::format(&snapshot));
    Ok(())
}

async fn report_events(mut events: broadcast::Receiver<ExecutionEvent>) {
    loop {
        match events.recv().await {
            Ok(ExecutionEvent::LegCompleted(result)) => info!(
                opportunity = %result.opportunity_id,
                platform = %result.platform,
                outcome = ?result.outcome,
                bet_ref = result.bet_ref.as_deref().unwrap_or("-"),
                "Leg completed"
            ),
            Ok(ExecutionEvent::Escalated(escalation)) => error!(
                opportunity = %escalation.opportunity_id,
                platform = %escalation.platform,
                severity = ?escalation.severity,
                message = %escalation.message,
                "Operator escalation"
            ),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "Event reporter lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Parses a duration string like "30s", "15m", "2h", "1d" or "500ms".
///
/// # Errors
/// Returns an error for an empty, zero, or unit-less value.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    if s.is_empty() {
        return Err(anyhow!("Duration string cannot be empty"));
    }

    let (num_str, unit) = if let Some(num_str) = s.strip_suffix("ms") {
        (num_str, "ms")
    } else {
        let split_idx = s
            .chars()
            .position(|c| !c.is_ascii_digit())
            .ok_or_else(|| anyhow!("Duration must have a unit (ms, s, m, h, d)"))?;
        (&s[..split_idx], &s[split_idx..])
    };

    if num_str.is_empty() {
        return Err(anyhow!("Duration must start with a number"));
    }

    let value: u64 = num_str
        .parse()
        .map_err(|_| anyhow!("Invalid number in duration: {}", num_str))?;

    if value == 0 {
        return Err(anyhow!("Duration cannot be zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        "d" => Ok(Duration::from_secs(value * 86400)),
        _ => Err(anyhow!("Unknown duration unit: {}. Use ms, s, m, h, or d", unit)),
    }
}
