use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Catalog database connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Primary catalog DSN (`mysql://...` or `sqlite:...`), used for every mutation
    pub dsn: String,
    /// Optional read replica used for the large snapshot read of a deletion pass
    #[serde(default)]
    pub replica_dsn: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/reclaim.db"),
            replica_dsn: None,
        }
    }
}

impl DatabaseConfig {
    /// Create an in-memory database configuration for local runs and tests
    pub fn in_memory() -> Self {
        Self {
            dsn: String::from("sqlite::memory:"),
            replica_dsn: None,
        }
    }
}

/// One remote bucket that uploads of a pool are stored in.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Pool (store) id as recorded in the catalog's `filestore` column
    pub pool_id: i32,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    /// S3-compatible service URL; AWS S3 is used when absent
    #[serde(default)]
    pub service_url: Option<String>,
    /// Region override for AWS S3
    #[serde(default)]
    pub region: Option<String>,
    /// When false, deletes are audited but never sent to the bucket (archival endpoints)
    #[serde(default = "default_requires_physical_deletion")]
    pub requires_physical_deletion: bool,
}

fn default_requires_physical_deletion() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeletionConfig {
    /// Number of catalog rows handed to a worker at once
    pub partition_size: usize,
    /// Maximum number of partitions processed concurrently
    pub worker_count: usize,
    /// Uploads not accessed within this window are eligible for deletion
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// How often the progress line is emitted
    #[serde(with = "humantime_serde")]
    pub progress_interval: Duration,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            partition_size: 1000,
            worker_count: 16,
            retention: Duration::from_secs(90 * 24 * 60 * 60),
            progress_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Number of paths handed to a migration worker at once
    pub partition_size: usize,
    /// Maximum number of path partitions migrated concurrently
    pub worker_count: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            partition_size: 100,
            worker_count: 4,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory receiving `deleted-*.log`, `migrated-*.log` and `migrated-error-*.log`
    pub directory: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
        }
    }
}

/// OTLP export of the deleted-object and catalog-query counters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Counters are recorded but never exported unless enabled
    pub enabled: bool,
    /// OTLP gRPC collector endpoint
    pub endpoint: String,
    /// Export interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:4317".to_string(),
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Catalog database configuration
    pub database: DatabaseConfig,
    /// All known storage endpoints
    pub endpoints: Vec<EndpointConfig>,
    /// Default deletion scope; empty means every configured endpoint
    pub run_endpoints: Vec<i32>,
    /// Deletion pass tuning
    pub deletion: DeletionConfig,
    /// Migration pass tuning
    pub migration: MigrationConfig,
    /// Side log placement
    pub logs: LogConfig,
    /// Counter export
    pub telemetry: TelemetryConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Path::new("reclaim.toml"))
            .extract()
            .map_err(Box::new)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(path).extract().map_err(Box::new)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("RECLAIM__").split("__"))
    }

    pub fn endpoint(&self, pool_id: i32) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.pool_id == pool_id)
    }

    /// Resolve which endpoints a deletion pass touches.
    ///
    /// Explicit overrides win over `run_endpoints`; with neither, every
    /// configured endpoint is in scope.
    pub fn deletion_scope(&self, overrides: &[i32]) -> Vec<i32> {
        let mut scope = if !overrides.is_empty() {
            overrides.to_vec()
        } else if !self.run_endpoints.is_empty() {
            self.run_endpoints.clone()
        } else {
            self.endpoints.iter().map(|e| e.pool_id).collect()
        };
        scope.sort_unstable();
        scope.dedup();
        scope
    }

    /// Copy of this configuration with endpoint credentials masked, for display.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for endpoint in &mut config.endpoints {
            endpoint.secret_key = "********".to_string();
        }
        config
    }
}
