//! Deletion pass
//!
//! Streams one snapshot of expired uploads, splits it into partitions and
//! reconciles each partition on a bounded worker pool:
//!
//! 1. drop rows owned by exempt users and rows outside the store scope
//! 2. consult the [`DedupGuard`] for every row backed by an object
//! 3. batch-delete the objects that lost their last reference, one call per store
//! 4. only when every batch succeeded, remove the chunk's catalog rows

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use common::config::DeletionConfig;
use common::{CatalogError, ObjectEndpoint, ReferenceKey, UploadCatalog, UploadRecord};
use futures::future::join_all;
use futures::stream::StreamExt;
use tokio::sync::Mutex;

use crate::error::ReconcileError;
use crate::guard::DedupGuard;
use crate::metrics::{MetricsSnapshot, ReclaimMetrics};
use crate::partition::partition_rows;
use crate::progress::ProgressReporter;

/// Connected endpoints keyed by pool id
pub type EndpointMap = HashMap<i32, Arc<dyn ObjectEndpoint>>;

/// Outcome of a deletion pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionSummary {
    /// Rows read from the snapshot
    pub candidates: usize,
    pub counters: MetricsSnapshot,
}

impl DeletionSummary {
    pub fn log(&self) {
        tracing::info!(
            candidates = self.candidates,
            chunks = self.counters.chunks_processed,
            rows_deleted = self.counters.rows_deleted,
            errors = self.counters.errors,
            still_referenced = self.counters.still_referenced,
            bytes_freed = self.counters.bytes_freed,
            exempt_skipped = self.counters.exempt_skipped,
            scope_skipped = self.counters.scope_skipped,
            "Deletion pass complete"
        );
    }
}

pub struct DeletionPass {
    catalog: Arc<dyn UploadCatalog>,
    endpoints: EndpointMap,
    exempt_users: HashSet<i32>,
    scope: Vec<i32>,
    settings: DeletionConfig,
    guard: DedupGuard,
    metrics: ReclaimMetrics,
}

impl DeletionPass {
    /// A pass over every store in `endpoints` with no exempt users.
    pub fn new(
        catalog: Arc<dyn UploadCatalog>,
        endpoints: EndpointMap,
        settings: DeletionConfig,
    ) -> Self {
        let metrics = ReclaimMetrics::new();
        let mut scope: Vec<i32> = endpoints.keys().copied().collect();
        scope.sort_unstable();

        Self {
            guard: DedupGuard::new(catalog.clone(), metrics.clone()),
            catalog,
            endpoints,
            exempt_users: HashSet::new(),
            scope,
            settings,
            metrics,
        }
    }

    pub fn with_exempt_users(mut self, exempt_users: HashSet<i32>) -> Self {
        self.exempt_users = exempt_users;
        self
    }

    /// Restrict the pass to these stores.
    pub fn with_scope(mut self, scope: Vec<i32>) -> Self {
        self.scope = scope;
        self
    }

    pub fn metrics(&self) -> &ReclaimMetrics {
        &self.metrics
    }

    pub fn scope(&self) -> &[i32] {
        &self.scope
    }

    /// Uploads last accessed before this instant are eligible.
    pub fn cutoff(&self) -> DateTime<Utc> {
        let now = Utc::now();
        TimeDelta::from_std(self.settings.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Run the pass with the configured retention window.
    pub async fn run(&self) -> Result<DeletionSummary, ReconcileError> {
        self.run_with_cutoff(self.cutoff()).await
    }

    /// Run the pass over uploads last accessed before `cutoff`.
    ///
    /// Only the snapshot read can fail the pass, and it does so after the
    /// partitions read before the error are reconciled. Chunk failures are
    /// counted and logged.
    pub async fn run_with_cutoff(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<DeletionSummary, ReconcileError> {
        tracing::info!(cutoff = %cutoff, stores = ?self.scope, "Fetching deletable items");
        let rows = self.catalog.deletable_uploads(cutoff, &self.scope).await?;

        let reporter = ProgressReporter::spawn(self.metrics.clone(), self.settings.progress_interval);
        let candidates = AtomicUsize::new(0);
        let read_error: Mutex<Option<CatalogError>> = Mutex::new(None);
        let (counted, failure) = (&candidates, &read_error);

        partition_rows(rows, self.settings.partition_size)
            .for_each_concurrent(self.settings.worker_count.max(1), |chunk| async move {
                match chunk {
                    Ok(chunk) => {
                        counted.fetch_add(chunk.len(), Ordering::Relaxed);
                        self.process_chunk(chunk).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Snapshot read failed");
                        failure.lock().await.get_or_insert(e);
                    }
                }
            })
            .await;

        reporter.stop().await;

        if let Some(e) = read_error.into_inner() {
            return Err(e.into());
        }

        let summary = DeletionSummary {
            candidates: candidates.into_inner(),
            counters: self.metrics.snapshot(),
        };
        summary.log();
        Ok(summary)
    }

    async fn process_chunk(&self, chunk: Vec<UploadRecord>) {
        self.metrics.worker_started();

        let upload_ids: Vec<i64> = chunk.iter().map(|r| r.id).collect();
        if let Err(e) = self.reconcile_chunk(chunk).await {
            self.metrics.record_error();
            tracing::error!(upload_ids = ?upload_ids, error = %e, "Error on chunk");
        }

        self.metrics.worker_finished();
    }

    async fn reconcile_chunk(&self, chunk: Vec<UploadRecord>) -> Result<(), ReconcileError> {
        let (exempt, records): (Vec<_>, Vec<_>) = chunk
            .into_iter()
            .partition(|r| self.exempt_users.contains(&r.owner_id));
        self.metrics.record_exempt_skipped(exempt.len());

        let (records, out_of_scope): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| self.scope.contains(&i32::from(r.store_id)));
        self.metrics.record_scope_skipped(out_of_scope.len());

        if records.is_empty() {
            return Ok(());
        }

        let mut consumed: Vec<ReferenceKey> = Vec::new();
        let mut to_delete: Vec<&UploadRecord> = Vec::new();
        for record in records.iter().filter(|r| r.has_object()) {
            let key = record.reference_key();
            match self.guard.should_delete(&key).await {
                Ok(delete) => {
                    if delete {
                        to_delete.push(record);
                    }
                    consumed.push(key);
                }
                Err(e) => {
                    self.guard.restore(&consumed).await;
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = self.delete_objects(&to_delete).await {
            self.guard.restore(&consumed).await;
            return Err(e);
        }

        let freed: u64 = to_delete
            .iter()
            .map(|r| u64::try_from(r.size_bytes).unwrap_or(0))
            .sum();
        self.metrics.record_bytes_freed(freed);

        for record in &records {
            match self.catalog.remove_upload(record).await {
                Ok(()) => self.metrics.record_rows_deleted(1),
                Err(e) => {
                    self.metrics.record_error();
                    tracing::error!(upload_id = record.id, error = %e, "Failed to remove catalog row");
                }
            }
        }

        Ok(())
    }

    /// One batched delete per store, awaited together. Any failure fails the chunk.
    async fn delete_objects(&self, records: &[&UploadRecord]) -> Result<(), ReconcileError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut batches: BTreeMap<i32, Vec<String>> = BTreeMap::new();
        for record in records {
            batches
                .entry(i32::from(record.store_id))
                .or_default()
                .push(record.object_key());
        }

        let mut calls = Vec::with_capacity(batches.len());
        for (store_id, keys) in &batches {
            let endpoint = self
                .endpoints
                .get(store_id)
                .ok_or(ReconcileError::MissingEndpoint(*store_id))?;
            calls.push(endpoint.delete_batch(keys));
        }

        for result in join_all(calls).await {
            result?;
        }
        Ok(())
    }
}
