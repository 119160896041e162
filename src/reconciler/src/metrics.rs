//! Reconciliation counters
//!
//! Shared by every worker of a pass and read by the progress reporter. All
//! updates are relaxed atomic increments; snapshots are best-effort.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Thread-safe counters for deletion and migration passes
#[derive(Debug, Clone)]
pub struct ReclaimMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    migration: bool,
    active_workers: AtomicUsize,
    chunks_processed: AtomicUsize,
    rows_deleted: AtomicUsize,
    errors: AtomicUsize,
    still_referenced: AtomicUsize,
    bytes_freed: AtomicU64,
    exempt_skipped: AtomicUsize,
    scope_skipped: AtomicUsize,
    paths_migrated: AtomicUsize,
    migration_failures: AtomicUsize,
    bytes_migrated: AtomicU64,
}

impl Default for ReclaimMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReclaimMetrics {
    /// Counters for a deletion pass
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    /// Counters for a migration pass; the progress line includes migration totals
    pub fn for_migration() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                migration: true,
                ..Default::default()
            }),
        }
    }

    pub fn worker_started(&self) {
        self.inner.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a worker leaving its chunk, whatever the outcome
    pub fn worker_finished(&self) {
        self.inner.chunks_processed.fetch_add(1, Ordering::Relaxed);
        self.inner.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_rows_deleted(&self, rows: usize) {
        self.inner.rows_deleted.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_still_referenced(&self) {
        self.inner.still_referenced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_freed(&self, bytes: u64) {
        self.inner.bytes_freed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_exempt_skipped(&self, rows: usize) {
        self.inner.exempt_skipped.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_scope_skipped(&self, rows: usize) {
        self.inner.scope_skipped.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_migrated(&self, bytes: u64) {
        self.inner.paths_migrated.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_migrated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A failed migration item is also counted as an error
    pub fn record_migration_failure(&self) {
        self.inner.migration_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            migration: inner.migration,
            active_workers: inner.active_workers.load(Ordering::Relaxed),
            chunks_processed: inner.chunks_processed.load(Ordering::Relaxed),
            rows_deleted: inner.rows_deleted.load(Ordering::Relaxed),
            errors: inner.errors.load(Ordering::Relaxed),
            still_referenced: inner.still_referenced.load(Ordering::Relaxed),
            bytes_freed: inner.bytes_freed.load(Ordering::Relaxed),
            exempt_skipped: inner.exempt_skipped.load(Ordering::Relaxed),
            scope_skipped: inner.scope_skipped.load(Ordering::Relaxed),
            paths_migrated: inner.paths_migrated.load(Ordering::Relaxed),
            migration_failures: inner.migration_failures.load(Ordering::Relaxed),
            bytes_migrated: inner.bytes_migrated.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ReclaimMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub migration: bool,
    pub active_workers: usize,
    pub chunks_processed: usize,
    pub rows_deleted: usize,
    pub errors: usize,
    pub still_referenced: usize,
    pub bytes_freed: u64,
    pub exempt_skipped: usize,
    pub scope_skipped: usize,
    pub paths_migrated: usize,
    pub migration_failures: usize,
    pub bytes_migrated: u64,
}

impl MetricsSnapshot {
    /// Bytes freed, in GiB
    pub fn gigabytes_freed(&self) -> f64 {
        self.bytes_freed as f64 / 1024.0 / 1024.0 / 1024.0
    }
}

/// Group digits in thousands: `1234567` becomes `1,234,567`.
fn grouped(value: usize) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "active {} chunks {} delrows {} errors {} dupes {} space {:.1}GB pro {} skip {}",
            self.active_workers,
            grouped(self.chunks_processed),
            grouped(self.rows_deleted),
            grouped(self.errors),
            grouped(self.still_referenced),
            self.gigabytes_freed(),
            grouped(self.exempt_skipped),
            grouped(self.scope_skipped),
        )?;
        if self.migration {
            write!(
                f,
                " migrated {} failed {}",
                grouped(self.paths_migrated),
                grouped(self.migration_failures)
            )?;
        }
        Ok(())
    }
}
