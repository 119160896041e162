//! Endpoint-to-endpoint migration.
//!
//! Every distinct path stored on the source pool is copied to the destination,
//! re-pointed in the catalog and then removed from the source. Each step runs
//! only after the previous one succeeded; a failed path is written to the
//! source's error log and the pass moves on.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::append_log::{AppendLog, migration_error_log_name, migration_log_name};
use common::config::MigrationConfig;
use common::upload::object_key;
use common::{ObjectEndpoint, UploadCatalog};
use futures::stream::{self, StreamExt};

use crate::error::ReconcileError;
use crate::metrics::{MetricsSnapshot, ReclaimMetrics};
use crate::partition::PartitionExt;
use crate::progress::ProgressReporter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSummary {
    pub source: i32,
    pub destination: i32,
    /// Distinct paths listed on the source
    pub paths: usize,
    pub counters: MetricsSnapshot,
}

impl MigrationSummary {
    pub fn log(&self) {
        tracing::info!(
            source = self.source,
            destination = self.destination,
            paths = self.paths,
            migrated = self.counters.paths_migrated,
            failed = self.counters.migration_failures,
            bytes = self.counters.bytes_migrated,
            "Migration pass complete"
        );
    }
}

pub struct MigrationRunner {
    catalog: Arc<dyn UploadCatalog>,
    source: Arc<dyn ObjectEndpoint>,
    destination: Arc<dyn ObjectEndpoint>,
    settings: MigrationConfig,
    progress_interval: Duration,
    migrated_log: AppendLog,
    error_log: AppendLog,
    metrics: ReclaimMetrics,
}

impl MigrationRunner {
    /// Open the source's side logs under `log_dir` and prepare a runner.
    pub async fn new(
        catalog: Arc<dyn UploadCatalog>,
        source: Arc<dyn ObjectEndpoint>,
        destination: Arc<dyn ObjectEndpoint>,
        settings: MigrationConfig,
        log_dir: &Path,
    ) -> Result<Self, ReconcileError> {
        let migrated_log = AppendLog::open(log_dir, &migration_log_name(source.pool_id())).await?;
        let error_log =
            AppendLog::open(log_dir, &migration_error_log_name(source.pool_id())).await?;

        Ok(Self {
            catalog,
            source,
            destination,
            settings,
            progress_interval: Duration::from_secs(1),
            migrated_log,
            error_log,
            metrics: ReclaimMetrics::for_migration(),
        })
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn metrics(&self) -> &ReclaimMetrics {
        &self.metrics
    }

    pub fn error_log_path(&self) -> &Path {
        self.error_log.path()
    }

    /// Migrate every path of the source pool. Only the listing can fail the pass.
    pub async fn run(&self) -> Result<MigrationSummary, ReconcileError> {
        let source = self.source.pool_id();
        let destination = self.destination.pool_id();

        let paths = self.catalog.distinct_paths(source).await?;
        tracing::info!(source, destination, paths = paths.len(), "Starting migration");
        let total = paths.len();

        let reporter = ProgressReporter::spawn(self.metrics.clone(), self.progress_interval);

        stream::iter(paths.into_iter().partitioned(self.settings.partition_size))
            .for_each_concurrent(self.settings.worker_count.max(1), |partition| {
                self.migrate_partition(partition)
            })
            .await;

        reporter.stop().await;

        let summary = MigrationSummary {
            source,
            destination,
            paths: total,
            counters: self.metrics.snapshot(),
        };
        summary.log();
        Ok(summary)
    }

    async fn migrate_partition(&self, paths: Vec<String>) {
        self.metrics.worker_started();

        for path in paths {
            match self.migrate_path(&path).await {
                Ok(bytes) => self.metrics.record_migrated(bytes),
                Err(e) => {
                    self.metrics.record_migration_failure();
                    tracing::warn!(path = %path, error = %e, "Failed to migrate path");
                    if let Err(log_error) = self.error_log.append(&format!("{path} — {e}")).await {
                        tracing::error!(
                            path = %path,
                            error = %log_error,
                            "Failed to record migration failure"
                        );
                    }
                }
            }
        }

        self.metrics.worker_finished();
    }

    /// Copy, re-point, delete. Returns the bytes written to the destination.
    async fn migrate_path(&self, path: &str) -> Result<u64, ReconcileError> {
        let key = object_key(path);

        self.migrated_log.append(&key).await?;
        let body = self.source.get(&key).await?;
        let written = self.destination.put(&key, body).await?;

        let rows = self
            .catalog
            .repoint(path, self.source.pool_id(), self.destination.pool_id())
            .await?;
        tracing::debug!(path = %path, rows, written, "Catalog re-pointed");

        self.source.delete(&key).await?;
        Ok(written)
    }
}
