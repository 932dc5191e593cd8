//! Status watcher: periodically reconciles non-terminal deployments

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::deploy::orchestrator::Orchestrator;

/// Watcher worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Polling interval
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Run the watcher worker
pub async fn run<S, F>(
    options: &Options,
    orchestrator: Arc<Orchestrator>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Status watcher starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Status watcher shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        match orchestrator.reconcile().await {
            Ok(report) if !report.updated.is_empty() => {
                info!(
                    "Reconciled {} of {} active deployments",
                    report.updated.len(),
                    report.checked
                );
            }
            Ok(report) => debug!("{} active deployments unchanged", report.checked),
            Err(e) => error!("Reconciliation failed: {}", e),
        }
    }
}
