//! Durable log ingester: drains the append log into the queryable store

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::errors::PlatformError;
use crate::models::log_event::LogEvent;
use crate::transport::durable::{AppendLog, LogStore};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Ingester worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Consumer group whose offsets are committed
    pub group: String,

    /// Records fetched per batch
    pub batch_size: usize,

    /// Wait when the log is drained
    pub poll_interval: Duration,

    /// Backoff after a batch with failures
    pub cooldown: CooldownOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            group: "api-server-logs-consumer".to_string(),
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            cooldown: CooldownOptions::default(),
        }
    }
}

/// Counts for one processed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// Highest offset committed by this batch
    pub committed: Option<u64>,
}

/// Process one batch.
///
/// Each record is written on its own; a failed write is logged and the rest
/// of the batch still runs. Offsets are committed only up to the first
/// failure, so the failed record and everything after it are redelivered.
/// Redelivered events already stored are recognised by `event_id`.
pub async fn process_batch(
    log: &dyn AppendLog,
    store: &dyn LogStore,
    group: &str,
    batch_size: usize,
) -> Result<BatchReport, PlatformError> {
    let records = log.fetch(group, batch_size).await?;
    let mut report = BatchReport {
        fetched: records.len(),
        ..Default::default()
    };
    let mut blocked = false;

    for record in records {
        let written = match serde_json::from_slice::<LogEvent>(&record.payload) {
            Ok(event) => match store.insert(&event).await {
                Ok(true) => {
                    report.stored += 1;
                    true
                }
                Ok(false) => {
                    report.duplicates += 1;
                    true
                }
                Err(e) => {
                    warn!("Failed to save log record {}: {}", record.offset, e);
                    report.failed += 1;
                    false
                }
            },
            // Never parseable, so redelivery cannot help
            Err(e) => {
                warn!("Skipping malformed log record {}: {}", record.offset, e);
                true
            }
        };

        if !written {
            blocked = true;
        }
        if !blocked {
            log.commit(group, record.offset).await?;
            report.committed = Some(record.offset);
        }

        if let Err(e) = log.heartbeat(group).await {
            warn!("Heartbeat for group {} failed: {}", group, e);
        }
    }

    Ok(report)
}

/// Run the ingester worker
pub async fn run<S, F>(
    options: &Options,
    log: Arc<dyn AppendLog>,
    store: Arc<dyn LogStore>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Log ingester starting (group {})...", options.group);
    let mut failures: u32 = 0;

    loop {
        let delay = match process_batch(log.as_ref(), store.as_ref(), &options.group, options.batch_size).await {
            Ok(report) if report.failed > 0 => {
                failures = failures.saturating_add(1);
                warn!(
                    "Log batch had {} failed writes, retrying uncommitted records",
                    report.failed
                );
                calc_exp_backoff(&options.cooldown, failures - 1)
            }
            Ok(report) => {
                failures = 0;
                if report.fetched > 0 {
                    debug!(
                        "Log batch: {} stored, {} duplicates",
                        report.stored, report.duplicates
                    );
                }
                if report.fetched < options.batch_size {
                    options.poll_interval
                } else {
                    Duration::ZERO
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                error!("Log ingestion failed: {}", e);
                calc_exp_backoff(&options.cooldown, failures - 1)
            }
        };

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Log ingester shutting down...");
                return;
            }
            _ = sleep_fn(delay) => {}
        }
    }
}
