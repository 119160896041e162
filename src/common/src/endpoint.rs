//! Storage endpoints: one remote bucket per pool.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, AttributeValue, Attributes, ObjectStore};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::append_log::{AppendLog, deletion_log_name};
use crate::config::EndpointConfig;
use crate::telemetry::ReclaimCounters;

/// Region used for AWS S3 endpoints when none is configured.
pub const DEFAULT_REGION: &str = "us-west-2";

/// Prefix listed by the startup liveness probe.
const LIVENESS_PREFIX: &str = "test_lookup";

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid configuration for endpoint {pool_id}: {message}")]
    Config { pool_id: i32, message: String },
    #[error("endpoint {endpoint} failed liveness check: {source}")]
    Probe {
        endpoint: String,
        #[source]
        source: object_store::Error,
    },
    #[error(transparent)]
    Store(#[from] object_store::Error),
    #[error("failed to write deletion audit log: {0}")]
    Audit(#[source] io::Error),
    #[error("content length mismatch for {key}: expected {expected} bytes, wrote {actual}")]
    LengthMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },
}

/// A fetched object: its bytes as a stream plus the metadata needed to re-upload it.
pub struct ObjectBody {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub stream: BoxStream<'static, object_store::Result<Bytes>>,
}

impl ObjectBody {
    pub fn from_bytes(data: Bytes, content_type: Option<String>) -> Self {
        Self {
            content_length: data.len() as u64,
            content_type,
            stream: stream::once(async move { Ok(data) }).boxed(),
        }
    }
}

/// Operations the reconciliation passes perform against a storage endpoint.
#[async_trait]
pub trait ObjectEndpoint: Send + Sync {
    fn pool_id(&self) -> i32;

    /// Delete one object. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<(), EndpointError>;

    /// Delete a set of objects in as few remote calls as the backend allows.
    async fn delete_batch(&self, keys: &[String]) -> Result<(), EndpointError>;

    async fn get(&self, key: &str) -> Result<ObjectBody, EndpointError>;

    /// Store `body` under `key`, returning the number of bytes written.
    async fn put(&self, key: &str, body: ObjectBody) -> Result<u64, EndpointError>;
}

/// An object-store bucket bound to a pool id, with its deletion audit log.
pub struct Endpoint {
    pool_id: i32,
    bucket: String,
    service_url: Option<String>,
    requires_physical_deletion: bool,
    label: String,
    store: Arc<dyn ObjectStore>,
    audit: AppendLog,
    counters: ReclaimCounters,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

fn endpoint_label(config: &EndpointConfig) -> String {
    format!(
        "{} ({}/{})",
        config.pool_id,
        config.service_url.as_deref().unwrap_or("s3"),
        config.bucket
    )
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("pool_id", &self.pool_id)
            .field("bucket", &self.bucket)
            .field("service_url", &self.service_url)
            .field("requires_physical_deletion", &self.requires_physical_deletion)
            .finish()
    }
}

impl Endpoint {
    /// Build the S3 client for `config` and verify the bucket is reachable.
    pub async fn connect(config: &EndpointConfig, log_dir: &Path) -> Result<Self, EndpointError> {
        let store = create_s3_builder(config)?
            .build()
            .map_err(|e| EndpointError::Config {
                pool_id: config.pool_id,
                message: e.to_string(),
            })?;
        Self::with_store(config, Arc::new(store), log_dir).await
    }

    /// Wrap an already constructed store. The liveness probe still runs, and
    /// the audit log is only opened once it passed.
    pub async fn with_store(
        config: &EndpointConfig,
        store: Arc<dyn ObjectStore>,
        log_dir: &Path,
    ) -> Result<Self, EndpointError> {
        let label = endpoint_label(config);
        probe(store.as_ref(), &label).await?;

        let audit = AppendLog::open(log_dir, &deletion_log_name(config.pool_id))
            .await
            .map_err(EndpointError::Audit)?;

        Ok(Self {
            pool_id: config.pool_id,
            bucket: config.bucket.clone(),
            service_url: config.service_url.clone(),
            requires_physical_deletion: config.requires_physical_deletion,
            label,
            store,
            audit,
            counters: ReclaimCounters::global(),
        })
    }

    pub fn with_counters(mut self, counters: ReclaimCounters) -> Self {
        self.counters = counters;
        self
    }

    pub fn requires_physical_deletion(&self) -> bool {
        self.requires_physical_deletion
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn audit_log_path(&self) -> &Path {
        self.audit.path()
    }

    async fn remove_one(&self, key: &str) -> Result<(), EndpointError> {
        match self.store.delete(&ObjectPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn probe(store: &dyn ObjectStore, label: &str) -> Result<(), EndpointError> {
    tracing::info!(endpoint = %label, "Checking connection to endpoint");
    store
        .list_with_delimiter(Some(&ObjectPath::from(LIVENESS_PREFIX)))
        .await
        .map_err(|source| EndpointError::Probe {
            endpoint: label.to_string(),
            source,
        })?;
    tracing::info!(endpoint = %label, "Endpoint reachable");
    Ok(())
}

#[async_trait]
impl ObjectEndpoint for Endpoint {
    fn pool_id(&self) -> i32 {
        self.pool_id
    }

    async fn delete(&self, key: &str) -> Result<(), EndpointError> {
        self.audit
            .append(&format!("single: {key}"))
            .await
            .map_err(EndpointError::Audit)?;

        if !self.requires_physical_deletion {
            return Ok(());
        }
        self.remove_one(key).await
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<(), EndpointError> {
        if keys.is_empty() {
            return Ok(());
        }

        self.audit
            .append(&format!("batch: {}", keys.join(" ")))
            .await
            .map_err(EndpointError::Audit)?;
        self.counters.record_deleted(self.pool_id, keys.len() as u64);

        if !self.requires_physical_deletion {
            return Ok(());
        }

        if let [key] = keys {
            return self.delete(key).await;
        }

        let locations = stream::iter(keys.iter().map(|k| Ok(ObjectPath::from(k.as_str())))).boxed();
        let results: Vec<_> = self.store.delete_stream(locations).collect().await;
        for result in results {
            match result {
                Ok(_) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        tracing::debug!(pool_id = self.pool_id, count = keys.len(), "Batch delete complete");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<ObjectBody, EndpointError> {
        let result = self.store.get(&ObjectPath::from(key)).await?;
        let content_type = result
            .attributes
            .get(&Attribute::ContentType)
            .map(|value| AsRef::<str>::as_ref(value).to_owned());
        let content_length = result.meta.size as u64;

        Ok(ObjectBody {
            content_length,
            content_type,
            stream: result.into_stream(),
        })
    }

    async fn put(&self, key: &str, body: ObjectBody) -> Result<u64, EndpointError> {
        let mut attributes = Attributes::new();
        if let Some(content_type) = body.content_type {
            attributes.insert(Attribute::ContentType, AttributeValue::from(content_type));
        }

        let mut writer =
            BufWriter::new(self.store.clone(), ObjectPath::from(key)).with_attributes(attributes);

        let mut written = 0u64;
        let mut chunks = body.stream;
        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e.into());
                }
            };
            written += chunk.len() as u64;
            if let Err(e) = writer.put(chunk).await {
                let _ = writer.abort().await;
                return Err(e.into());
            }
        }

        if written != body.content_length {
            let _ = writer.abort().await;
            return Err(EndpointError::LengthMismatch {
                key: key.to_string(),
                expected: body.content_length,
                actual: written,
            });
        }

        writer
            .shutdown()
            .await
            .map_err(|e| EndpointError::Store(object_store::Error::Generic {
                store: "BufWriter",
                source: Box::new(e),
            }))?;
        Ok(written)
    }
}

/// Create an S3 builder for an endpoint.
///
/// A configured `service_url` selects an S3-compatible service addressed
/// path-style over plain HTTP; otherwise AWS S3 in the configured (or
/// default) region is used.
pub fn create_s3_builder(config: &EndpointConfig) -> Result<AmazonS3Builder, EndpointError> {
    if config.bucket.is_empty() {
        return Err(EndpointError::Config {
            pool_id: config.pool_id,
            message: "bucket must not be empty".to_string(),
        });
    }

    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(&config.bucket)
        .with_access_key_id(&config.access_key)
        .with_secret_access_key(&config.secret_key);

    match &config.service_url {
        Some(service_url) => {
            Url::parse(service_url).map_err(|e| EndpointError::Config {
                pool_id: config.pool_id,
                message: format!("invalid service URL '{service_url}': {e}"),
            })?;
            builder = builder
                .with_endpoint(service_url)
                .with_allow_http(true)
                .with_virtual_hosted_style_request(false)
                .with_region(config.region.as_deref().unwrap_or("us-east-1"));
        }
        None => {
            builder = builder.with_region(config.region.as_deref().unwrap_or(DEFAULT_REGION));
        }
    }

    Ok(builder)
}
