//! Opportunity sources and odds streams that need no live connection.
//!
//! [`JsonFileSource`] and [`JsonLinesOddsStream`] back the CLI `run` command;
//! [`QueuedSource`] and [`ChannelOddsStream`] are fed programmatically by the
//! simulator and tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use legsync_core::{OddsEvent, Opportunity, OpportunityId, OddsStream, OpportunitySource};

fn passes_thresholds(opportunity: &Opportunity, min_profit_pct: Decimal, max_age: Duration) -> bool {
    opportunity.profit_pct >= min_profit_pct && opportunity.age(Utc::now()) <= max_age
}

// =============================================================================
// JSON file source
// =============================================================================

/// Reads a JSON array of opportunities on every fetch and yields each id once.
///
/// The file may be rewritten while the runtime is up; new ids are picked up
/// on the next poll.
#[derive(Debug)]
pub struct JsonFileSource {
    path: PathBuf,
    restamp: bool,
    seen: Mutex<HashSet<OpportunityId>>,
}

impl JsonFileSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            restamp: false,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Stamps `observed_at` with the read time, for files of canned
    /// opportunities that would otherwise be stale.
    #[must_use]
    pub fn restamped(mut self, restamp: bool) -> Self {
        self.restamp = restamp;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl OpportunitySource for JsonFileSource {
    async fn fetch(&self, min_profit_pct: Decimal, max_age: Duration) -> Result<Vec<Opportunity>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read opportunities from {}", self.path.display()))?;
        let mut opportunities: Vec<Opportunity> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse opportunities in {}", self.path.display()))?;

        if self.restamp {
            let now = Utc::now();
            for opportunity in &mut opportunities {
                opportunity.observed_at = now;
            }
        }

        let mut seen = self.seen.lock();
        let fresh: Vec<Opportunity> = opportunities
            .into_iter()
            .filter(|o| !seen.contains(&o.id))
            .filter(|o| passes_thresholds(o, min_profit_pct, max_age))
            .collect();
        seen.extend(fresh.iter().map(|o| o.id.clone()));

        debug!(path = %self.path.display(), count = fresh.len(), "Fetched opportunities from file");
        Ok(fresh)
    }
}

// =============================================================================
// In-memory source
// =============================================================================

/// Source fed by [`QueuedSource::push`]; each fetch drains what was pushed.
#[derive(Debug, Default)]
pub struct QueuedSource {
    pending: Mutex<Vec<Opportunity>>,
}

impl QueuedSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, opportunity: Opportunity) {
        self.pending.lock().push(opportunity);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[async_trait]
impl OpportunitySource for QueuedSource {
    async fn fetch(&self, min_profit_pct: Decimal, max_age: Duration) -> Result<Vec<Opportunity>> {
        let drained = std::mem::take(&mut *self.pending.lock());
        Ok(drained
            .into_iter()
            .filter(|o| passes_thresholds(o, min_profit_pct, max_age))
            .collect())
    }
}

// =============================================================================
// Odds streams
// =============================================================================

/// Odds stream backed by an mpsc channel. Ends when every sender is dropped.
#[derive(Debug)]
pub struct ChannelOddsStream {
    rx: mpsc::Receiver<OddsEvent>,
}

impl ChannelOddsStream {
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<OddsEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl OddsStream for ChannelOddsStream {
    async fn next_event(&mut self) -> Result<Option<OddsEvent>> {
        Ok(self.rx.recv().await)
    }
}

/// Replays one JSON-encoded [`OddsEvent`] per line.
pub struct JsonLinesOddsStream {
    path: PathBuf,
    lines: Lines<BufReader<tokio::fs::File>>,
    line_no: usize,
}

impl JsonLinesOddsStream {
    /// Opens `path` for replay.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("Failed to open odds file {}", path.display()))?;
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }
}

#[async_trait]
impl OddsStream for JsonLinesOddsStream {
    async fn next_event(&mut self) -> Result<Option<OddsEvent>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            self.line_no += 1;

            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match serde_json::from_str::<OddsEvent>(line) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line = self.line_no,
                        error = %e,
                        "Skipping malformed odds line"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use legsync_core::{LegQuote, OutcomeId, OutcomeOdds, Platform};
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn create_test_opportunity(id: &str, profit_pct: Decimal) -> Opportunity {
        Opportunity {
            id: OpportunityId::new(id),
            leg_a: LegQuote {
                platform: Platform::new("x"),
                outcome_id: OutcomeId::new("home"),
                odds: dec!(2.10),
                stake: dec!(48),
            },
            leg_b: LegQuote {
                platform: Platform::new("y"),
                outcome_id: OutcomeId::new("away"),
                odds: dec!(1.95),
                stake: dec!(52),
            },
            profit_pct,
            observed_at: Utc::now(),
            continuous: true,
        }
    }

    #[tokio::test]
    async fn test_queued_source_filters_and_drains() {
        let source = QueuedSource::new();
        source.push(create_test_opportunity("good", dec!(2.5)));
        source.push(create_test_opportunity("thin", dec!(0.2)));
        let mut stale = create_test_opportunity("stale", dec!(3));
        stale.observed_at = Utc::now() - ChronoDuration::seconds(30);
        source.push(stale);

        let fetched = source.fetch(dec!(1), Duration::from_secs(5)).await.unwrap();

        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, OpportunityId::new("good"));
        assert!(source.is_empty());
    }

    #[tokio::test]
    async fn test_json_file_source_yields_each_id_once() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut old = create_test_opportunity("opp-1", dec!(2));
        old.observed_at = Utc::now() - ChronoDuration::hours(1);
        let body = serde_json::to_string(&vec![old]).unwrap();
        file.write_all(body.as_bytes()).unwrap();

        let source = JsonFileSource::new(file.path()).restamped(true);

        let first = source.fetch(dec!(1), Duration::from_secs(5)).await.unwrap();
        let second = source.fetch(dec!(1), Duration::from_secs(5)).await.unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_json_file_source_reports_missing_file() {
        let source = JsonFileSource::new("/nonexistent/opportunities.json");
        let err = source.fetch(dec!(1), Duration::from_secs(5)).await.unwrap_err();
        assert!(err.to_string().contains("Failed to read opportunities"));
    }

    #[tokio::test]
    async fn test_json_lines_stream_skips_bad_lines() {
        let event = OddsEvent::new(
            "match-1",
            Platform::new("x"),
            vec![OutcomeOdds {
                outcome_id: OutcomeId::new("home"),
                odds: dec!(2.05),
            }],
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# replay").unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file, "{}", serde_json::to_string(&event).unwrap()).unwrap();

        let mut stream = JsonLinesOddsStream::open(file.path()).await.unwrap();

        assert_eq!(stream.next_event().await.unwrap(), Some(event));
        assert_eq!(stream.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_channel_stream_ends_when_senders_drop() {
        let (tx, mut stream) = ChannelOddsStream::channel(4);
        tx.send(OddsEvent::new("m", Platform::new("y"), Vec::new())).await.unwrap();
        drop(tx);

        assert!(stream.next_event().await.unwrap().is_some());
        assert!(stream.next_event().await.unwrap().is_none());
    }
}
