//! Reference-count guard deciding when a shared physical object may be deleted.

use std::collections::HashMap;
use std::sync::Arc;

use common::{CatalogError, ReferenceKey, UploadCatalog};
use tokio::sync::Mutex;

use crate::metrics::ReclaimMetrics;

/// Per-pass cache of remaining references to each physical object.
///
/// Counts are seeded from the catalog on first encounter, inclusive of the row
/// being evaluated, and consumed by one per evaluated row. The object is safe
/// to delete when its count reaches zero. A single lock covers the whole cache
/// and is held across the seeding query.
pub struct DedupGuard {
    catalog: Arc<dyn UploadCatalog>,
    counts: Mutex<HashMap<ReferenceKey, i64>>,
    metrics: ReclaimMetrics,
}

impl DedupGuard {
    pub fn new(catalog: Arc<dyn UploadCatalog>, metrics: ReclaimMetrics) -> Self {
        Self {
            catalog,
            counts: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Consume one reference to `key` and report whether the object may now be deleted.
    pub async fn should_delete(&self, key: &ReferenceKey) -> Result<bool, CatalogError> {
        let mut counts = self.counts.lock().await;

        let seeded = counts.get(key).copied();
        let count = match seeded {
            Some(count) => count,
            None => {
                self.catalog
                    .count_references(key.store_id, &key.path)
                    .await?
            }
        };

        let remaining = count - 1;
        if remaining > 0 {
            tracing::debug!(key = %key, remaining, "Remaining instances found; skipping delete");
            counts.insert(key.clone(), remaining);
            self.metrics.record_still_referenced();
            return Ok(false);
        }

        if seeded.is_some() {
            tracing::debug!(key = %key, "All remaining instances purged; performing delete");
        }
        counts.remove(key);
        Ok(true)
    }

    /// Hand back references consumed by a chunk that was abandoned.
    ///
    /// The rows of such a chunk stay in the catalog, so each one keeps its
    /// object alive for the rest of the pass. Evicted keys stay evicted: a
    /// later encounter reseeds from the catalog, which still counts those rows.
    pub async fn restore(&self, keys: &[ReferenceKey]) {
        if keys.is_empty() {
            return;
        }

        let mut counts = self.counts.lock().await;
        for key in keys {
            if let Some(count) = counts.get_mut(key) {
                *count += 1;
            }
        }
    }

    /// Number of keys currently cached.
    pub async fn cached_keys(&self) -> usize {
        self.counts.lock().await.len()
    }

    #[cfg(test)]
    async fn cached_count(&self, key: &ReferenceKey) -> Option<i64> {
        self.counts.lock().await.get(key).copied()
    }
}
