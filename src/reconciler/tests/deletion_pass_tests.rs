use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use common::config::DeletionConfig;
use common::testing::{FaultyEndpoint, MemoryCatalog};
use common::upload::UploadRecord;
use common::{CatalogError, ObjectEndpoint, UploadCatalog, UploadStream};
use futures::stream::{self, StreamExt};
use reconciler::{DeletionPass, EndpointMap, ReconcileError};
use tempfile::TempDir;

fn upload(id: i64, owner_id: i32, store_id: u8, size_bytes: i32, path: &str) -> UploadRecord {
    UploadRecord {
        id,
        owner_id,
        store_id,
        size_bytes,
        pool_id: 100 + i32::from(store_id),
        path: path.to_string(),
    }
}

fn settings(partition_size: usize, worker_count: usize) -> DeletionConfig {
    DeletionConfig {
        partition_size,
        worker_count,
        retention: Duration::from_secs(24 * 60 * 60),
        progress_interval: Duration::from_millis(20),
    }
}

async fn seed(catalog: &MemoryCatalog, records: Vec<UploadRecord>) {
    let expired = Utc::now() - TimeDelta::days(30);
    for record in records {
        catalog.add_upload(record, expired).await;
    }
}

fn endpoint_map(endpoints: &[&Arc<FaultyEndpoint>]) -> EndpointMap {
    endpoints
        .iter()
        .map(|e| (e.pool_id(), Arc::clone(*e) as Arc<dyn ObjectEndpoint>))
        .collect()
}

#[tokio::test]
async fn test_shared_path_deleted_once() {
    let dir = TempDir::new().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    seed(
        &catalog,
        vec![
            upload(1, 1, 1, 100, "a/b"),
            upload(2, 2, 1, 100, "a/b"),
            upload(3, 3, 1, 100, "a/b"),
        ],
    )
    .await;

    let endpoint = FaultyEndpoint::in_memory(1, dir.path()).await;
    endpoint.seed("files/a/b", b"shared").await;

    let pass = DeletionPass::new(catalog.clone(), endpoint_map(&[&endpoint]), settings(100, 4));
    let summary = pass.run().await.unwrap();

    assert_eq!(endpoint.deleted_keys().await, vec!["files/a/b".to_string()]);
    assert!(!endpoint.contains("files/a/b").await);
    assert_eq!(catalog.upload_count().await, 0);
    assert_eq!(summary.counters.rows_deleted, 3);
    assert_eq!(summary.counters.still_referenced, 2);
    assert_eq!(summary.counters.bytes_freed, 100);
    assert_eq!(catalog.count_queries(), 1);
}

#[tokio::test]
async fn test_shared_path_across_partitions_and_workers() {
    let dir = TempDir::new().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    let records: Vec<UploadRecord> = (1..=25)
        .map(|id| upload(id, id as i32, 1, 10, "dup"))
        .chain((26..=30).map(|id| upload(id, id as i32, 1, 10, &format!("solo-{id}"))))
        .collect();
    seed(&catalog, records).await;

    let endpoint = FaultyEndpoint::in_memory(1, dir.path()).await;
    let pass = DeletionPass::new(catalog.clone(), endpoint_map(&[&endpoint]), settings(3, 8));
    let summary = pass.run().await.unwrap();

    let deleted = endpoint.deleted_keys().await;
    assert_eq!(deleted.iter().filter(|k| *k == "files/dup").count(), 1);
    assert_eq!(deleted.len(), 6);
    assert_eq!(summary.candidates, 30);
    assert_eq!(summary.counters.rows_deleted, 30);
    assert_eq!(summary.counters.still_referenced, 24);
    assert_eq!(summary.counters.chunks_processed, 10);
    assert_eq!(summary.counters.active_workers, 0);
    assert_eq!(catalog.upload_count().await, 0);
}

#[tokio::test]
async fn test_failed_batch_leaves_catalog_untouched() {
    let dir = TempDir::new().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_user(1, false, 1000).await;
    catalog.add_pool(101, 10).await;
    seed(
        &catalog,
        vec![
            upload(1, 1, 1, 100, "x"),
            upload(2, 1, 1, 100, "y"),
            upload(3, 1, 1, 100, ""),
        ],
    )
    .await;

    let endpoint = FaultyEndpoint::in_memory(1, dir.path()).await;
    endpoint.fail_batch_deletes(true);

    let pass = DeletionPass::new(catalog.clone(), endpoint_map(&[&endpoint]), settings(10, 1));
    let summary = pass.run().await.unwrap();

    assert_eq!(summary.counters.errors, 1);
    assert_eq!(summary.counters.rows_deleted, 0);
    assert_eq!(summary.counters.bytes_freed, 0);
    assert_eq!(catalog.upload_count().await, 3);
    assert_eq!(catalog.disk_usage(1).await, Some(1000));
    assert_eq!(catalog.pool_count(101).await, Some(10));
}

#[tokio::test]
async fn test_failure_in_one_store_aborts_whole_chunk() {
    let dir = TempDir::new().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    seed(
        &catalog,
        vec![upload(1, 1, 1, 100, "good"), upload(2, 1, 2, 100, "bad")],
    )
    .await;

    let healthy = FaultyEndpoint::in_memory(1, dir.path()).await;
    let failing = FaultyEndpoint::in_memory(2, dir.path()).await;
    failing.fail_batch_deletes(true);

    let pass = DeletionPass::new(
        catalog.clone(),
        endpoint_map(&[&healthy, &failing]),
        settings(10, 1),
    );
    let summary = pass.run().await.unwrap();

    assert_eq!(summary.counters.errors, 1);
    assert!(catalog.upload(1).await.is_some());
    assert!(catalog.upload(2).await.is_some());
}

#[tokio::test]
async fn test_exempt_rows_are_skipped() {
    let dir = TempDir::new().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_user(1, false, 500).await;
    catalog.add_user(2, true, 500).await;
    seed(
        &catalog,
        vec![
            upload(1, 1, 1, 50, "expired"),
            upload(2, 2, 1, 50, "pro-1"),
            upload(3, 2, 1, 50, "pro-2"),
            upload(4, 1, 1, 50, ""),
        ],
    )
    .await;

    let endpoint = FaultyEndpoint::in_memory(1, dir.path()).await;
    let pass = DeletionPass::new(catalog.clone(), endpoint_map(&[&endpoint]), settings(2, 2))
        .with_exempt_users(HashSet::from([2]));
    let summary = pass.run().await.unwrap();

    assert_eq!(summary.counters.exempt_skipped, 2);
    assert_eq!(summary.counters.rows_deleted, 2);
    assert_eq!(endpoint.deleted_keys().await, vec!["files/expired".to_string()]);
    assert!(catalog.upload(2).await.is_some());
    assert!(catalog.upload(3).await.is_some());
    assert!(catalog.upload(4).await.is_none());
    assert_eq!(catalog.disk_usage(1).await, Some(400));
    assert_eq!(catalog.disk_usage(2).await, Some(500));
}

/// Serves the snapshot the way a misbehaving replica might: ignoring the store
/// filter, or dropping the connection after some rows.
struct DegradedSnapshot {
    inner: MemoryCatalog,
    ignore_scope: bool,
    fail_after: Option<usize>,
}

impl DegradedSnapshot {
    fn unscoped(inner: MemoryCatalog) -> Self {
        Self {
            inner,
            ignore_scope: true,
            fail_after: None,
        }
    }

    fn failing_after(inner: MemoryCatalog, rows: usize) -> Self {
        Self {
            inner,
            ignore_scope: false,
            fail_after: Some(rows),
        }
    }
}

#[async_trait]
impl UploadCatalog for DegradedSnapshot {
    async fn exempt_user_ids(&self) -> Result<HashSet<i32>, CatalogError> {
        self.inner.exempt_user_ids().await
    }

    async fn deletable_uploads(
        &self,
        cutoff: DateTime<Utc>,
        stores: &[i32],
    ) -> Result<UploadStream, CatalogError> {
        let every_store = [1, 2, 3];
        let stores = if self.ignore_scope { &every_store[..] } else { stores };
        let rows = self.inner.deletable_uploads(cutoff, stores).await?;

        match self.fail_after {
            None => Ok(rows),
            Some(limit) => {
                let lost = stream::once(async {
                    Err(CatalogError::Unavailable("replica connection lost".to_string()))
                });
                Ok(rows.take(limit).chain(lost).boxed())
            }
        }
    }

    async fn count_references(&self, store_id: u8, path: &str) -> Result<i64, CatalogError> {
        self.inner.count_references(store_id, path).await
    }

    async fn remove_upload(&self, record: &UploadRecord) -> Result<(), CatalogError> {
        self.inner.remove_upload(record).await
    }

    async fn distinct_paths(&self, store_id: i32) -> Result<Vec<String>, CatalogError> {
        self.inner.distinct_paths(store_id).await
    }

    async fn repoint(&self, path: &str, from: i32, to: i32) -> Result<u64, CatalogError> {
        self.inner.repoint(path, from, to).await
    }
}

#[tokio::test]
async fn test_scope_skip_counts_rows_outside_scope() {
    let dir = TempDir::new().unwrap();
    let inner = MemoryCatalog::new();
    seed(
        &inner,
        vec![
            upload(1, 1, 1, 10, "in"),
            upload(2, 1, 2, 10, "out"),
            upload(3, 1, 3, 10, "out-too"),
        ],
    )
    .await;
    let catalog = Arc::new(DegradedSnapshot::unscoped(inner));

    let endpoint = FaultyEndpoint::in_memory(1, dir.path()).await;
    let pass = DeletionPass::new(catalog.clone(), endpoint_map(&[&endpoint]), settings(10, 1))
        .with_scope(vec![1]);
    let summary = pass.run().await.unwrap();

    assert_eq!(summary.candidates, 3);
    assert_eq!(summary.counters.scope_skipped, 2);
    assert_eq!(summary.counters.rows_deleted, 1);
    assert_eq!(endpoint.deleted_keys().await, vec!["files/in".to_string()]);
    assert!(catalog.inner.upload(2).await.is_some());
    assert!(catalog.inner.upload(3).await.is_some());
}

#[tokio::test]
async fn test_snapshot_read_error_fails_pass_after_read_partitions() {
    let dir = TempDir::new().unwrap();
    let inner = MemoryCatalog::new();
    seed(
        &inner,
        (1..=5)
            .map(|id| upload(id, 1, 1, 10, &format!("p{id}")))
            .collect(),
    )
    .await;
    let catalog = Arc::new(DegradedSnapshot::failing_after(inner, 4));

    let endpoint = FaultyEndpoint::in_memory(1, dir.path()).await;
    let pass = DeletionPass::new(catalog.clone(), endpoint_map(&[&endpoint]), settings(2, 1));

    match pass.run().await {
        Err(ReconcileError::Catalog(CatalogError::Unavailable(message))) => {
            assert_eq!(message, "replica connection lost");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    let counters = pass.metrics().snapshot();
    assert_eq!(counters.chunks_processed, 2);
    assert_eq!(counters.rows_deleted, 4);
    assert_eq!(catalog.inner.upload_count().await, 1);
    assert!(catalog.inner.upload(5).await.is_some());
    assert_eq!(endpoint.deleted_keys().await.len(), 4);
}

#[tokio::test]
async fn test_archival_endpoint_removes_rows_but_keeps_objects() {
    let dir = TempDir::new().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    seed(&catalog, vec![upload(1, 1, 3, 10, "archived")]).await;

    let endpoint = FaultyEndpoint::in_memory_with(3, false, dir.path()).await;
    endpoint.seed("files/archived", b"old").await;

    let pass = DeletionPass::new(catalog.clone(), endpoint_map(&[&endpoint]), settings(10, 1));
    let summary = pass.run().await.unwrap();

    assert_eq!(summary.counters.rows_deleted, 1);
    assert!(endpoint.contains("files/archived").await);
    let audit = tokio::fs::read_to_string(endpoint.inner().audit_log_path())
        .await
        .unwrap();
    assert_eq!(audit, "batch: files/archived\n");
}

#[tokio::test]
async fn test_recent_uploads_are_not_candidates() {
    let dir = TempDir::new().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    catalog
        .add_upload(upload(1, 1, 1, 10, "fresh"), Utc::now())
        .await;

    let endpoint = FaultyEndpoint::in_memory(1, dir.path()).await;
    let pass = DeletionPass::new(catalog.clone(), endpoint_map(&[&endpoint]), settings(10, 1));
    let summary = pass.run().await.unwrap();

    assert_eq!(summary.candidates, 0);
    assert_eq!(summary.counters.chunks_processed, 0);
    assert!(catalog.upload(1).await.is_some());
}

#[tokio::test]
async fn test_aborted_chunk_keeps_shared_object() {
    let dir = TempDir::new().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    // Row 1 shares "s" with row 3; row 2 lives on a store whose deletes fail.
    seed(
        &catalog,
        vec![
            upload(1, 1, 1, 10, "s"),
            upload(2, 1, 2, 10, "t"),
            upload(3, 1, 1, 10, "s"),
        ],
    )
    .await;

    let healthy = FaultyEndpoint::in_memory(1, dir.path()).await;
    let failing = FaultyEndpoint::in_memory(2, dir.path()).await;
    failing.fail_batch_deletes(true);
    healthy.seed("files/s", b"shared").await;

    let pass = DeletionPass::new(
        catalog.clone(),
        endpoint_map(&[&healthy, &failing]),
        settings(2, 1),
    );
    let summary = pass.run().await.unwrap();

    // The first chunk aborted, so row 1 still references "s" and the object must survive.
    assert_eq!(summary.counters.errors, 1);
    assert!(healthy.contains("files/s").await);
    assert!(healthy.deleted_keys().await.is_empty());
    assert!(catalog.upload(1).await.is_some());
    assert!(catalog.upload(3).await.is_none());
}
