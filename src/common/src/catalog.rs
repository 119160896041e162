use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::stream::{self, BoxStream};
use futures::{SinkExt, StreamExt};
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{MySql, QueryBuilder, Row, Sqlite, query, query_scalar};

use crate::config::DatabaseConfig;
use crate::telemetry::ReclaimCounters;
use crate::upload::UploadRecord;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unsupported catalog DSN '{0}', expected mysql:// or sqlite:")]
    UnsupportedDsn(String),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Rows of a deletion snapshot, yielded as they are read. A read error is the
/// last item.
pub type UploadStream = BoxStream<'static, Result<UploadRecord, CatalogError>>;

/// Snapshot rows buffered ahead of the consumer.
const SNAPSHOT_BUFFER: usize = 1024;

/// Catalog operations the reconciliation passes depend on.
#[async_trait]
pub trait UploadCatalog: Send + Sync {
    /// Users whose uploads are never garbage-collected.
    async fn exempt_user_ids(&self) -> Result<HashSet<i32>, CatalogError>;

    /// Point-in-time snapshot of uploads last accessed before `cutoff` on the given stores.
    async fn deletable_uploads(
        &self,
        cutoff: DateTime<Utc>,
        stores: &[i32],
    ) -> Result<UploadStream, CatalogError>;

    /// Number of catalog rows pointing at `(store_id, path)`, including any row
    /// currently being evaluated.
    async fn count_references(&self, store_id: u8, path: &str) -> Result<i64, CatalogError>;

    /// Remove an upload's rows and release its share of the owner's and pool's counters.
    async fn remove_upload(&self, record: &UploadRecord) -> Result<(), CatalogError>;

    /// Distinct non-empty paths stored on a store.
    async fn distinct_paths(&self, store_id: i32) -> Result<Vec<String>, CatalogError>;

    /// Move every row for `(from, path)` to store `to`. Returns the rows updated.
    async fn repoint(&self, path: &str, from: i32, to: i32) -> Result<u64, CatalogError>;
}

const EXEMPT_USERS: &str = "SELECT `user_id` FROM `user` WHERE `status` > 0";

const COUNT_REFERENCES: &str =
    "SELECT COUNT(*) FROM `upload` WHERE `upload`.`path` = ? AND `upload`.`filestore` = ?";

const DELETE_UPLOAD: &str = "DELETE FROM `upload` WHERE `upload_id` = ?";
const DELETE_UPLOAD_STATS: &str = "DELETE FROM `upload_stats` WHERE `upload_id` = ?";

const MYSQL_RELEASE_DISK_USAGE: &str = "UPDATE `user` SET `disk_usage` = GREATEST(0, CAST(`disk_usage` AS SIGNED) - ?) WHERE `user_id` = ?";
const MYSQL_RELEASE_POOL_ITEM: &str =
    "UPDATE `pool` SET `count` = GREATEST(0, CAST(`count` AS SIGNED) - 1) WHERE `pool_id` = ?";
const SQLITE_RELEASE_DISK_USAGE: &str =
    "UPDATE `user` SET `disk_usage` = MAX(0, `disk_usage` - ?) WHERE `user_id` = ?";
const SQLITE_RELEASE_POOL_ITEM: &str =
    "UPDATE `pool` SET `count` = MAX(0, `count` - 1) WHERE `pool_id` = ?";

const DISTINCT_PATHS: &str = "SELECT DISTINCT `path` FROM `upload` WHERE `filestore` = ? AND `path` IS NOT NULL AND `path` <> ''";

const REPOINT: &str = "UPDATE `upload` SET `filestore` = ? WHERE `filestore` = ? AND `path` = ?";

/// Catalog backed by the production MySQL schema, or SQLite for local runs.
#[derive(Clone)]
pub enum Catalog {
    MySql {
        primary: MySqlPool,
        /// Pool for the snapshot read; the primary when no replica is configured
        replica: MySqlPool,
    },
    Sqlite(SqlitePool),
}

impl Catalog {
    /// Connect to the catalog described by `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, CatalogError> {
        let dsn = config.dsn.as_str();
        tracing::info!(dsn = %redact_dsn(dsn), "Connecting to catalog database");

        let catalog = if dsn.starts_with("sqlite:") {
            Self::connect_sqlite(dsn).await?
        } else if dsn.starts_with("mysql:") {
            let primary = MySqlPool::connect(dsn).await.map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to MySQL catalog");
                e
            })?;
            let replica = match &config.replica_dsn {
                Some(replica_dsn) => MySqlPool::connect(replica_dsn).await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to MySQL catalog replica");
                    e
                })?,
                None => primary.clone(),
            };
            Catalog::MySql { primary, replica }
        } else {
            return Err(CatalogError::UnsupportedDsn(dsn.to_string()));
        };

        tracing::info!("Catalog connection established");
        Ok(catalog)
    }

    /// In-memory SQLite catalog with the upload schema created.
    pub async fn new_in_memory() -> Result<Self, CatalogError> {
        Self::connect_sqlite("sqlite::memory:").await
    }

    async fn connect_sqlite(dsn: &str) -> Result<Self, CatalogError> {
        let in_memory = dsn.contains(":memory:");
        let dsn = if in_memory || dsn.contains("mode=") {
            dsn.to_string()
        } else if dsn.contains('?') {
            format!("{dsn}&mode=rwc")
        } else {
            format!("{dsn}?mode=rwc")
        };

        // Every connection to `:memory:` is a separate database.
        let max_connections = if in_memory { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&dsn)
            .await
            .map_err(|e| {
                tracing::error!(dsn = %dsn, error = %e, "Failed to connect to SQLite catalog");
                e
            })?;

        let catalog = Catalog::Sqlite(pool);
        catalog.init_sqlite().await?;
        Ok(catalog)
    }

    /// Create the upload schema for SQLite catalogs. MySQL catalogs are owned
    /// by the upload service and are never migrated from here.
    async fn init_sqlite(&self) -> Result<(), CatalogError> {
        let Catalog::Sqlite(pool) = self else {
            return Ok(());
        };

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS `user` (
                `user_id` INTEGER PRIMARY KEY,
                `status` INTEGER NOT NULL DEFAULT 0,
                `disk_usage` INTEGER NOT NULL DEFAULT 0
            )"#,
            r#"
            CREATE TABLE IF NOT EXISTS `pool` (
                `pool_id` INTEGER PRIMARY KEY,
                `count` INTEGER NOT NULL DEFAULT 0
            )"#,
            r#"
            CREATE TABLE IF NOT EXISTS `upload` (
                `upload_id` INTEGER PRIMARY KEY,
                `user_id` INTEGER NOT NULL,
                `filestore` INTEGER NOT NULL,
                `filesize` INTEGER NOT NULL,
                `pool_id` INTEGER NOT NULL,
                `path` TEXT
            )"#,
            "CREATE INDEX IF NOT EXISTS `upload_path` ON `upload` (`path`, `filestore`)",
            r#"
            CREATE TABLE IF NOT EXISTS `upload_stats` (
                `upload_id` INTEGER PRIMARY KEY,
                `last_access` TEXT NOT NULL
            )"#,
        ];

        for statement in statements {
            query(statement).execute(pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl UploadCatalog for Catalog {
    async fn exempt_user_ids(&self) -> Result<HashSet<i32>, CatalogError> {
        let ids = match self {
            Catalog::MySql { primary, .. } => query_scalar::<_, u32>(EXEMPT_USERS)
                .fetch_all(primary)
                .await?
                .into_iter()
                .map(|id| id as i32)
                .collect(),
            Catalog::Sqlite(pool) => query_scalar::<_, i32>(EXEMPT_USERS)
                .fetch_all(pool)
                .await?
                .into_iter()
                .collect(),
        };
        Ok(ids)
    }

    async fn deletable_uploads(
        &self,
        cutoff: DateTime<Utc>,
        stores: &[i32],
    ) -> Result<UploadStream, CatalogError> {
        if stores.is_empty() {
            return Ok(stream::empty().boxed());
        }

        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        tokio::spawn(read_snapshot(self.clone(), cutoff, stores.to_vec(), tx));
        Ok(rx.boxed())
    }

    async fn count_references(&self, store_id: u8, path: &str) -> Result<i64, CatalogError> {
        let count = match self {
            Catalog::MySql { primary, .. } => {
                query_scalar::<_, i64>(COUNT_REFERENCES)
                    .bind(path)
                    .bind(store_id)
                    .fetch_one(primary)
                    .await?
            }
            Catalog::Sqlite(pool) => {
                query_scalar::<_, i64>(COUNT_REFERENCES)
                    .bind(path)
                    .bind(store_id)
                    .fetch_one(pool)
                    .await?
            }
        };
        Ok(count)
    }

    async fn remove_upload(&self, record: &UploadRecord) -> Result<(), CatalogError> {
        match self {
            Catalog::MySql { primary, .. } => {
                let mut tx = primary.begin().await?;
                query(DELETE_UPLOAD).bind(record.id).execute(&mut *tx).await?;
                query(DELETE_UPLOAD_STATS)
                    .bind(record.id)
                    .execute(&mut *tx)
                    .await?;
                query(MYSQL_RELEASE_DISK_USAGE)
                    .bind(record.size_bytes)
                    .bind(record.owner_id)
                    .execute(&mut *tx)
                    .await?;
                query(MYSQL_RELEASE_POOL_ITEM)
                    .bind(record.pool_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
            }
            Catalog::Sqlite(pool) => {
                let mut tx = pool.begin().await?;
                query(DELETE_UPLOAD).bind(record.id).execute(&mut *tx).await?;
                query(DELETE_UPLOAD_STATS)
                    .bind(record.id)
                    .execute(&mut *tx)
                    .await?;
                query(SQLITE_RELEASE_DISK_USAGE)
                    .bind(record.size_bytes)
                    .bind(record.owner_id)
                    .execute(&mut *tx)
                    .await?;
                query(SQLITE_RELEASE_POOL_ITEM)
                    .bind(record.pool_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
            }
        }
        Ok(())
    }

    async fn distinct_paths(&self, store_id: i32) -> Result<Vec<String>, CatalogError> {
        let paths = match self {
            Catalog::MySql { primary, .. } => {
                query_scalar::<_, String>(DISTINCT_PATHS)
                    .bind(store_id)
                    .fetch_all(primary)
                    .await?
            }
            Catalog::Sqlite(pool) => {
                query_scalar::<_, String>(DISTINCT_PATHS)
                    .bind(store_id)
                    .fetch_all(pool)
                    .await?
            }
        };
        Ok(paths)
    }

    async fn repoint(&self, path: &str, from: i32, to: i32) -> Result<u64, CatalogError> {
        let result = match self {
            Catalog::MySql { primary, .. } => {
                query(REPOINT)
                    .bind(to)
                    .bind(from)
                    .bind(path)
                    .execute(primary)
                    .await?
                    .rows_affected()
            }
            Catalog::Sqlite(pool) => {
                query(REPOINT)
                    .bind(to)
                    .bind(from)
                    .bind(path)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
        };
        Ok(result)
    }
}

/// Feed the deletion snapshot into `tx` until it is exhausted, fails, or the
/// consumer goes away.
async fn read_snapshot(
    catalog: Catalog,
    cutoff: DateTime<Utc>,
    stores: Vec<i32>,
    mut tx: mpsc::Sender<Result<UploadRecord, CatalogError>>,
) {
    match &catalog {
        Catalog::MySql { replica, .. } => {
            let mut builder = QueryBuilder::<MySql>::new(
                "SELECT `upload`.`upload_id`, `upload`.`user_id`, `upload`.`filestore`, \
                 `upload`.`filesize`, `upload`.`pool_id`, `upload`.`path` \
                 FROM `upload_stats` FORCE INDEX (delete_lookup) \
                 INNER JOIN `upload` ON `upload`.`upload_id` = `upload_stats`.`upload_id` \
                 WHERE `upload_stats`.`last_access` < ",
            );
            builder.push_bind(cutoff.naive_utc());
            builder.push(" AND `filestore` IN (");
            let mut separated = builder.separated(", ");
            for store in &stores {
                separated.push_bind(*store);
            }
            separated.push_unseparated(")");

            let mut rows = builder.build().fetch(replica);
            while let Some(row) = rows.next().await {
                let record = row
                    .and_then(|row| decode_mysql_upload(&row))
                    .map_err(CatalogError::from);
                if !forward(&mut tx, record).await {
                    break;
                }
            }
        }
        Catalog::Sqlite(pool) => {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "SELECT `upload`.`upload_id`, `upload`.`user_id`, `upload`.`filestore`, \
                 `upload`.`filesize`, `upload`.`pool_id`, `upload`.`path` \
                 FROM `upload_stats` \
                 INNER JOIN `upload` ON `upload`.`upload_id` = `upload_stats`.`upload_id` \
                 WHERE `upload_stats`.`last_access` < ",
            );
            builder.push_bind(cutoff);
            builder.push(" AND `filestore` IN (");
            let mut separated = builder.separated(", ");
            for store in &stores {
                separated.push_bind(*store);
            }
            separated.push_unseparated(") ORDER BY `upload`.`upload_id`");

            // An in-memory database has a single connection, which the
            // workers consuming this snapshot need for their own queries.
            let rows = match builder.build().fetch_all(pool).await {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };
            for row in &rows {
                let record = decode_sqlite_upload(row).map_err(CatalogError::from);
                if !forward(&mut tx, record).await {
                    break;
                }
            }
        }
    }
}

/// Hand one snapshot row to the consumer. Returns false once reading should stop.
async fn forward(
    tx: &mut mpsc::Sender<Result<UploadRecord, CatalogError>>,
    record: Result<UploadRecord, CatalogError>,
) -> bool {
    let failed = record.is_err();
    tx.send(record).await.is_ok() && !failed
}

/// Counts every query issued through the wrapped catalog.
pub struct InstrumentedCatalog<C> {
    inner: C,
    counters: ReclaimCounters,
}

impl<C: UploadCatalog> InstrumentedCatalog<C> {
    pub fn new(inner: C, counters: ReclaimCounters) -> Self {
        Self { inner, counters }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: UploadCatalog> UploadCatalog for InstrumentedCatalog<C> {
    async fn exempt_user_ids(&self) -> Result<HashSet<i32>, CatalogError> {
        self.counters.record_query("exempt_user_ids");
        self.inner.exempt_user_ids().await
    }

    async fn deletable_uploads(
        &self,
        cutoff: DateTime<Utc>,
        stores: &[i32],
    ) -> Result<UploadStream, CatalogError> {
        self.counters.record_query("deletable_uploads");
        self.inner.deletable_uploads(cutoff, stores).await
    }

    async fn count_references(&self, store_id: u8, path: &str) -> Result<i64, CatalogError> {
        self.counters.record_query("count_references");
        self.inner.count_references(store_id, path).await
    }

    async fn remove_upload(&self, record: &UploadRecord) -> Result<(), CatalogError> {
        self.counters.record_query("remove_upload");
        self.inner.remove_upload(record).await
    }

    async fn distinct_paths(&self, store_id: i32) -> Result<Vec<String>, CatalogError> {
        self.counters.record_query("distinct_paths");
        self.inner.distinct_paths(store_id).await
    }

    async fn repoint(&self, path: &str, from: i32, to: i32) -> Result<u64, CatalogError> {
        self.counters.record_query("repoint");
        self.inner.repoint(path, from, to).await
    }
}

/// Seeding and inspection helpers for SQLite catalogs in tests.
#[cfg(any(test, feature = "testing"))]
impl Catalog {
    fn sqlite_pool(&self) -> &SqlitePool {
        match self {
            Catalog::Sqlite(pool) => pool,
            Catalog::MySql { .. } => panic!("test helpers require a SQLite catalog"),
        }
    }

    pub async fn insert_user(&self, user_id: i32, status: i32, disk_usage: i64) {
        query("INSERT INTO `user` (`user_id`, `status`, `disk_usage`) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(status)
            .bind(disk_usage)
            .execute(self.sqlite_pool())
            .await
            .expect("insert user");
    }

    pub async fn insert_pool(&self, pool_id: i32, count: i64) {
        query("INSERT INTO `pool` (`pool_id`, `count`) VALUES (?, ?)")
            .bind(pool_id)
            .bind(count)
            .execute(self.sqlite_pool())
            .await
            .expect("insert pool");
    }

    pub async fn insert_upload(&self, record: &UploadRecord, last_access: DateTime<Utc>) {
        let path = (!record.path.is_empty()).then_some(record.path.as_str());
        query(
            "INSERT INTO `upload` (`upload_id`, `user_id`, `filestore`, `filesize`, `pool_id`, `path`) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(record.owner_id)
        .bind(record.store_id)
        .bind(record.size_bytes)
        .bind(record.pool_id)
        .bind(path)
        .execute(self.sqlite_pool())
        .await
        .expect("insert upload");

        query("INSERT INTO `upload_stats` (`upload_id`, `last_access`) VALUES (?, ?)")
            .bind(record.id)
            .bind(last_access)
            .execute(self.sqlite_pool())
            .await
            .expect("insert upload stats");
    }

    pub async fn upload_store(&self, upload_id: i64) -> Option<u8> {
        query_scalar::<_, u8>("SELECT `filestore` FROM `upload` WHERE `upload_id` = ?")
            .bind(upload_id)
            .fetch_optional(self.sqlite_pool())
            .await
            .expect("select upload")
    }

    pub async fn upload_stats_exists(&self, upload_id: i64) -> bool {
        query_scalar::<_, i64>("SELECT COUNT(*) FROM `upload_stats` WHERE `upload_id` = ?")
            .bind(upload_id)
            .fetch_one(self.sqlite_pool())
            .await
            .expect("count upload stats")
            > 0
    }

    pub async fn disk_usage(&self, user_id: i32) -> i64 {
        query_scalar::<_, i64>("SELECT `disk_usage` FROM `user` WHERE `user_id` = ?")
            .bind(user_id)
            .fetch_one(self.sqlite_pool())
            .await
            .expect("select disk usage")
    }

    pub async fn pool_count(&self, pool_id: i32) -> i64 {
        query_scalar::<_, i64>("SELECT `count` FROM `pool` WHERE `pool_id` = ?")
            .bind(pool_id)
            .fetch_one(self.sqlite_pool())
            .await
            .expect("select pool count")
    }
}

fn decode_mysql_upload(row: &MySqlRow) -> Result<UploadRecord, sqlx::Error> {
    let id: u64 = row.try_get(0)?;
    let owner_id: u32 = row.try_get(1)?;
    let size_bytes: u32 = row.try_get(3)?;
    let path: Option<String> = row.try_get(5)?;

    Ok(UploadRecord {
        id: id as i64,
        owner_id: owner_id as i32,
        store_id: row.try_get(2)?,
        size_bytes: size_bytes as i32,
        pool_id: row.try_get(4)?,
        path: path.unwrap_or_default(),
    })
}

fn decode_sqlite_upload(row: &SqliteRow) -> Result<UploadRecord, sqlx::Error> {
    let store_id: i64 = row.try_get(2)?;
    let path: Option<String> = row.try_get(5)?;

    Ok(UploadRecord {
        id: row.try_get(0)?,
        owner_id: row.try_get(1)?,
        store_id: u8::try_from(store_id)
            .map_err(|e| sqlx::Error::Decode(format!("filestore {store_id}: {e}").into()))?,
        size_bytes: row.try_get(3)?,
        pool_id: row.try_get(4)?,
        path: path.unwrap_or_default(),
    })
}

/// Strip credentials from a DSN before it is logged.
pub fn redact_dsn(dsn: &str) -> String {
    match url::Url::parse(dsn) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("****"));
            url.to_string()
        }
        _ => dsn.to_string(),
    }
}
