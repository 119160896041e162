use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use common::ObjectEndpoint;
use common::config::MigrationConfig;
use common::testing::{FaultyEndpoint, MemoryCatalog};
use common::upload::UploadRecord;
use reconciler::{MigrationRunner, ReclaimMetrics};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    catalog: Arc<MemoryCatalog>,
    source: Arc<FaultyEndpoint>,
    destination: Arc<FaultyEndpoint>,
}

impl Fixture {
    async fn new(paths: &[(i64, &str)]) -> Self {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        let source = FaultyEndpoint::in_memory(1, dir.path()).await;
        let destination = FaultyEndpoint::in_memory(2, dir.path()).await;

        for (id, path) in paths {
            catalog
                .add_upload(
                    UploadRecord {
                        id: *id,
                        owner_id: 1,
                        store_id: 1,
                        size_bytes: 5,
                        pool_id: 1,
                        path: path.to_string(),
                    },
                    Utc::now(),
                )
                .await;
            if !path.is_empty() {
                source.seed(&format!("files/{path}"), b"bytes").await;
            }
        }

        Self {
            dir,
            catalog,
            source,
            destination,
        }
    }

    async fn runner(&self) -> MigrationRunner {
        MigrationRunner::new(
            self.catalog.clone(),
            self.source.clone() as Arc<dyn ObjectEndpoint>,
            self.destination.clone() as Arc<dyn ObjectEndpoint>,
            MigrationConfig {
                partition_size: 2,
                worker_count: 2,
            },
            self.dir.path(),
        )
        .await
        .unwrap()
        .with_progress_interval(std::time::Duration::from_millis(20))
    }

    fn log_lines(&self, name: &str) -> Vec<String> {
        read_lines(&self.dir.path().join(name))
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

#[tokio::test]
async fn test_migrates_every_distinct_path() {
    let fixture = Fixture::new(&[(1, "x"), (2, "x"), (3, "y"), (4, "z"), (5, "")]).await;
    let runner = fixture.runner().await;
    let summary = runner.run().await.unwrap();

    assert_eq!(summary.paths, 3);
    assert_eq!(summary.counters.paths_migrated, 3);
    assert_eq!(summary.counters.migration_failures, 0);
    assert_eq!(summary.counters.bytes_migrated, 15);

    for path in ["x", "y", "z"] {
        let key = format!("files/{path}");
        assert!(!fixture.source.contains(&key).await);
        assert_eq!(
            fixture.destination.read(&key).await.as_deref(),
            Some(&b"bytes"[..])
        );
    }
    for id in 1..=4 {
        assert_eq!(fixture.catalog.upload(id).await.unwrap().store_id, 2);
    }
    assert_eq!(fixture.catalog.upload(5).await.unwrap().store_id, 1);

    let mut migrated = fixture.log_lines("migrated-1.log");
    migrated.sort();
    assert_eq!(migrated, vec!["files/x", "files/y", "files/z"]);
    assert!(fixture.log_lines("migrated-error-1.log").is_empty());
}

#[tokio::test]
async fn test_destination_write_failure_keeps_source_and_catalog() {
    let fixture = Fixture::new(&[(1, "x")]).await;
    fixture.destination.fail_puts(true);

    let runner = fixture.runner().await;
    let summary = runner.run().await.unwrap();

    assert_eq!(summary.counters.migration_failures, 1);
    assert_eq!(summary.counters.errors, 1);
    assert_eq!(fixture.catalog.upload(1).await.unwrap().store_id, 1);
    assert!(fixture.source.contains("files/x").await);
    assert!(!fixture.destination.contains("files/x").await);

    let errors = fixture.log_lines("migrated-error-1.log");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("x — "));
    assert!(errors[0].contains("injected put failure"));
    assert_eq!(runner.error_log_path(), fixture.dir.path().join("migrated-error-1.log"));
}

#[tokio::test]
async fn test_repoint_failure_keeps_source_object() {
    let fixture = Fixture::new(&[(1, "x"), (2, "y")]).await;
    fixture.catalog.fail_repoint("x").await;

    let summary = fixture.runner().await.run().await.unwrap();

    assert_eq!(summary.counters.paths_migrated, 1);
    assert_eq!(summary.counters.migration_failures, 1);

    assert!(fixture.source.contains("files/x").await);
    assert_eq!(fixture.catalog.upload(1).await.unwrap().store_id, 1);
    assert_eq!(fixture.source.deleted_keys().await, vec!["files/y".to_string()]);

    assert!(!fixture.source.contains("files/y").await);
    assert_eq!(fixture.catalog.upload(2).await.unwrap().store_id, 2);

    let errors = fixture.log_lines("migrated-error-1.log");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("x — "));
}

#[tokio::test]
async fn test_missing_source_object_is_logged_and_skipped() {
    let fixture = Fixture::new(&[(1, "present")]).await;
    fixture
        .catalog
        .add_upload(
            UploadRecord {
                id: 2,
                owner_id: 1,
                store_id: 1,
                size_bytes: 1,
                pool_id: 1,
                path: "gone".to_string(),
            },
            Utc::now(),
        )
        .await;

    let runner = fixture.runner().await;
    let metrics: &ReclaimMetrics = runner.metrics();
    let summary = runner.run().await.unwrap();

    assert_eq!(summary.counters.paths_migrated, 1);
    assert_eq!(summary.counters.migration_failures, 1);
    assert_eq!(metrics.snapshot().migration_failures, 1);
    assert_eq!(fixture.catalog.upload(2).await.unwrap().store_id, 1);
    assert!(fixture.destination.contains("files/present").await);

    let errors = fixture.log_lines("migrated-error-1.log");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("gone — "));
}
