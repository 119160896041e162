use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::metrics::ReclaimMetrics;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Periodic progress line for a running pass.
///
/// The ticker lives as long as the pass: [`ProgressReporter::stop`] cancels it
/// and logs one final line.
pub struct ProgressReporter {
    metrics: ReclaimMetrics,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn(metrics: ReclaimMetrics, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let ticker_metrics = metrics.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        tracing::info!(target: "progress", "{}", ticker_metrics.snapshot());
                    }
                }
            }
        });

        Self {
            metrics,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    /// Stop the ticker and log the final counters.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            tracing::warn!(error = %e, "Progress reporter task ended abnormally");
        }
        tracing::info!(target: "progress", "{}", self.metrics.snapshot());
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
