//! In-memory catalog with failure injection.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;

use crate::catalog::{CatalogError, UploadCatalog, UploadStream};
use crate::upload::UploadRecord;

#[derive(Default)]
struct State {
    /// user id -> (status, disk usage)
    users: HashMap<i32, (i32, i64)>,
    pools: HashMap<i32, i64>,
    uploads: BTreeMap<i64, (UploadRecord, DateTime<Utc>)>,
}

/// A catalog held in memory, mirroring the SQL semantics of [`crate::catalog::Catalog`].
#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<State>,
    count_queries: AtomicUsize,
    fail_counts: AtomicBool,
    failing_repoints: Mutex<HashSet<String>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, user_id: i32, exempt: bool, disk_usage: i64) {
        let status = if exempt { 1 } else { 0 };
        self.state
            .lock()
            .await
            .users
            .insert(user_id, (status, disk_usage));
    }

    pub async fn add_pool(&self, pool_id: i32, count: i64) {
        self.state.lock().await.pools.insert(pool_id, count);
    }

    pub async fn add_upload(&self, record: UploadRecord, last_access: DateTime<Utc>) {
        self.state
            .lock()
            .await
            .uploads
            .insert(record.id, (record, last_access));
    }

    /// Make every reference-count query fail.
    pub fn fail_count_queries(&self, fail: bool) {
        self.fail_counts.store(fail, Ordering::SeqCst);
    }

    /// Make re-pointing `path` fail.
    pub async fn fail_repoint(&self, path: &str) {
        self.failing_repoints.lock().await.insert(path.to_string());
    }

    /// Number of reference-count queries served so far.
    pub fn count_queries(&self) -> usize {
        self.count_queries.load(Ordering::SeqCst)
    }

    pub async fn upload(&self, upload_id: i64) -> Option<UploadRecord> {
        self.state
            .lock()
            .await
            .uploads
            .get(&upload_id)
            .map(|(record, _)| record.clone())
    }

    pub async fn upload_count(&self) -> usize {
        self.state.lock().await.uploads.len()
    }

    pub async fn disk_usage(&self, user_id: i32) -> Option<i64> {
        self.state
            .lock()
            .await
            .users
            .get(&user_id)
            .map(|(_, usage)| *usage)
    }

    pub async fn pool_count(&self, pool_id: i32) -> Option<i64> {
        self.state.lock().await.pools.get(&pool_id).copied()
    }
}

#[async_trait]
impl UploadCatalog for MemoryCatalog {
    async fn exempt_user_ids(&self) -> Result<HashSet<i32>, CatalogError> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .iter()
            .filter(|(_, (status, _))| *status > 0)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn deletable_uploads(
        &self,
        cutoff: DateTime<Utc>,
        stores: &[i32],
    ) -> Result<UploadStream, CatalogError> {
        let state = self.state.lock().await;
        let rows: Vec<_> = state
            .uploads
            .values()
            .filter(|(record, last_access)| {
                *last_access < cutoff && stores.contains(&i32::from(record.store_id))
            })
            .map(|(record, _)| Ok(record.clone()))
            .collect();
        Ok(stream::iter(rows).boxed())
    }

    async fn count_references(&self, store_id: u8, path: &str) -> Result<i64, CatalogError> {
        self.count_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_counts.load(Ordering::SeqCst) {
            return Err(CatalogError::Unavailable("count query rejected".to_string()));
        }

        let state = self.state.lock().await;
        Ok(state
            .uploads
            .values()
            .filter(|(record, _)| record.store_id == store_id && record.path == path)
            .count() as i64)
    }

    async fn remove_upload(&self, record: &UploadRecord) -> Result<(), CatalogError> {
        let mut state = self.state.lock().await;
        state.uploads.remove(&record.id);
        if let Some((_, usage)) = state.users.get_mut(&record.owner_id) {
            *usage = (*usage - i64::from(record.size_bytes)).max(0);
        }
        if let Some(count) = state.pools.get_mut(&record.pool_id) {
            *count = (*count - 1).max(0);
        }
        Ok(())
    }

    async fn distinct_paths(&self, store_id: i32) -> Result<Vec<String>, CatalogError> {
        let state = self.state.lock().await;
        let paths: BTreeSet<String> = state
            .uploads
            .values()
            .filter(|(record, _)| i32::from(record.store_id) == store_id && record.has_object())
            .map(|(record, _)| record.path.clone())
            .collect();
        Ok(paths.into_iter().collect())
    }

    async fn repoint(&self, path: &str, from: i32, to: i32) -> Result<u64, CatalogError> {
        if self.failing_repoints.lock().await.contains(path) {
            return Err(CatalogError::Unavailable(format!("repoint of {path} rejected")));
        }

        let to = u8::try_from(to)
            .map_err(|_| CatalogError::Unavailable(format!("store id {to} out of range")))?;
        let mut state = self.state.lock().await;
        let mut updated = 0;
        for (record, _) in state.uploads.values_mut() {
            if i32::from(record.store_id) == from && record.path == path {
                record.store_id = to;
                updated += 1;
            }
        }
        Ok(updated)
    }
}
