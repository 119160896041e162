//! Test configuration builder for creating test setups quickly.

use std::path::Path;
use std::time::Duration;

use crate::config::{Configuration, DatabaseConfig, EndpointConfig};

/// Builder for creating test configurations.
///
/// # Example
///
/// ```rust,ignore
/// use common::testing::TestConfigBuilder;
///
/// let config = TestConfigBuilder::new()
///     .in_memory()
///     .with_endpoint(1)
///     .with_archival_endpoint(2)
///     .with_log_dir(temp.path())
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: Configuration,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    /// Create a new test configuration builder with default settings and
    /// a fast progress interval.
    pub fn new() -> Self {
        let mut config = Configuration::default();
        config.deletion.progress_interval = Duration::from_millis(50);
        Self { config }
    }

    /// Use an in-memory SQLite catalog.
    pub fn in_memory(mut self) -> Self {
        self.config.database = DatabaseConfig::in_memory();
        self
    }

    /// Add an endpoint whose deletes reach the bucket.
    pub fn with_endpoint(self, pool_id: i32) -> Self {
        self.push_endpoint(pool_id, true)
    }

    /// Add an endpoint whose deletes are audited only.
    pub fn with_archival_endpoint(self, pool_id: i32) -> Self {
        self.push_endpoint(pool_id, false)
    }

    fn push_endpoint(mut self, pool_id: i32, requires_physical_deletion: bool) -> Self {
        self.config.endpoints.push(EndpointConfig {
            pool_id,
            access_key: "test-access".to_string(),
            secret_key: "test-secret".to_string(),
            bucket: format!("pool-{pool_id}"),
            service_url: None,
            region: None,
            requires_physical_deletion,
        });
        self
    }

    /// Point an already added endpoint at an S3-compatible service.
    pub fn with_service_url(mut self, pool_id: i32, service_url: &str) -> Self {
        if let Some(endpoint) = self
            .config
            .endpoints
            .iter_mut()
            .find(|e| e.pool_id == pool_id)
        {
            endpoint.service_url = Some(service_url.to_string());
        }
        self
    }

    pub fn with_run_endpoints(mut self, pool_ids: &[i32]) -> Self {
        self.config.run_endpoints = pool_ids.to_vec();
        self
    }

    pub fn with_log_dir(mut self, dir: &Path) -> Self {
        self.config.logs.directory = dir.to_path_buf();
        self
    }

    pub fn with_partition_size(mut self, partition_size: usize) -> Self {
        self.config.deletion.partition_size = partition_size;
        self.config.migration.partition_size = partition_size;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.config.deletion.worker_count = worker_count;
        self.config.migration.worker_count = worker_count;
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> Configuration {
        self.config
    }
}
