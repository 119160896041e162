//! Upload garbage collection and endpoint migration.
//!
//! A [`DeletionPass`] removes expired uploads from the catalog and their
//! objects from storage, deleting a shared object only once its last catalog
//! reference is gone. A [`MigrationRunner`] moves every object of one endpoint
//! to another and re-points the catalog.

pub mod bootstrap;
pub mod deletion;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod migration;
pub mod partition;
pub mod progress;

pub use deletion::{DeletionPass, DeletionSummary, EndpointMap};
pub use error::ReconcileError;
pub use guard::DedupGuard;
pub use metrics::{MetricsSnapshot, ReclaimMetrics};
pub use migration::{MigrationRunner, MigrationSummary};
pub use partition::{PartitionExt, Partitioned, partition_rows};
pub use progress::ProgressReporter;
