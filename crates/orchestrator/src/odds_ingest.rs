//! Live odds ingestion.
//!
//! One reader task per [`OddsStream`] forwards events into a bounded channel;
//! a pool of workers shares the receiving end and feeds each event to the
//! retry registry. A stream that keeps failing is retried with exponential
//! backoff and dropped after [`MAX_CONSECUTIVE_ERRORS`] failures in a row.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use legsync_core::{OddsEvent, OddsStream};
use legsync_retry::RetryRegistry;

/// Consecutive read errors after which a stream is abandoned.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;

const ERROR_BACKOFF_BASE: Duration = Duration::from_millis(100);
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(5);

fn error_backoff(consecutive: u32) -> Duration {
    let factor = 1u32 << consecutive.saturating_sub(1).min(16);
    ERROR_BACKOFF_BASE.saturating_mul(factor).min(ERROR_BACKOFF_MAX)
}

/// Running reader and worker tasks.
pub struct OddsIngestPool {
    handles: Vec<JoinHandle<()>>,
    ingested: Arc<AtomicU64>,
    matched: Arc<AtomicU64>,
}

impl OddsIngestPool {
    /// Spawns one reader per stream and `workers` consumers.
    #[must_use]
    pub fn start(
        streams: Vec<Box<dyn OddsStream>>,
        retry: Arc<RetryRegistry>,
        workers: usize,
        buffer: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<OddsEvent>(buffer.max(1));
        let shared_rx = Arc::new(Mutex::new(rx));
        let ingested = Arc::new(AtomicU64::new(0));
        let matched = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::with_capacity(streams.len() + workers);

        for (reader, stream) in streams.into_iter().enumerate() {
            handles.push(tokio::spawn(read_stream(reader, stream, tx.clone(), shutdown.clone())));
        }
        // Workers stop once every reader has dropped its sender.
        drop(tx);

        for worker in 0..workers.max(1) {
            let rx = shared_rx.clone();
            let retry = retry.clone();
            let ingested = ingested.clone();
            let matched = matched.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let event = { rx.lock().await.recv().await };
                    let Some(event) = event else {
                        break;
                    };
                    let hits = retry.on_fresh_odds(&event, &event.platform);
                    ingested.fetch_add(1, Ordering::Relaxed);
                    matched.fetch_add(hits as u64, Ordering::Relaxed);
                    if hits > 0 {
                        debug!(worker, event = %event.event_id, platform = %event.platform, hits, "Odds matched retries");
                    }
                }
                debug!(worker, "Odds worker stopped");
            }));
        }

        info!(workers, buffer, "Odds ingest pool started");
        Self {
            handles,
            ingested,
            matched,
        }
    }

    /// Events processed so far.
    #[must_use]
    pub fn ingested(&self) -> u64 {
        self.ingested.load(Ordering::Relaxed)
    }

    /// Retry specs matched so far.
    #[must_use]
    pub fn matched(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }

    /// Waits for every reader and worker to finish.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Odds ingest task aborted");
            }
        }
    }
}

async fn read_stream(
    reader: usize,
    mut stream: Box<dyn OddsStream>,
    tx: mpsc::Sender<OddsEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut consecutive_errors = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = stream.next_event() => next,
        };

        match next {
            Ok(Some(event)) => {
                consecutive_errors = 0;
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!(reader, "Odds stream ended");
                break;
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!(reader, error = %e, consecutive_errors, "Odds stream keeps failing, dropping it");
                    break;
                }

                let backoff = error_backoff(consecutive_errors);
                warn!(
                    reader,
                    error = %e,
                    consecutive_errors,
                    backoff_ms = backoff.as_millis() as u64,
                    "Odds stream error"
                );
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}
