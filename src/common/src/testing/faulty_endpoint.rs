//! Endpoint wrapper that records calls and injects failures.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tokio::sync::Mutex;

use crate::config::EndpointConfig;
use crate::endpoint::{Endpoint, EndpointError, ObjectBody, ObjectEndpoint};

fn injected(operation: &str) -> EndpointError {
    EndpointError::Store(object_store::Error::Generic {
        store: "faulty",
        source: format!("injected {operation} failure").into(),
    })
}

/// An in-memory [`Endpoint`] whose deletes and writes can be made to fail.
pub struct FaultyEndpoint {
    inner: Endpoint,
    fail_batch_deletes: AtomicBool,
    fail_puts: AtomicBool,
    deleted: Mutex<Vec<String>>,
}

impl FaultyEndpoint {
    pub async fn in_memory(pool_id: i32, log_dir: &Path) -> Arc<Self> {
        Self::in_memory_with(pool_id, true, log_dir).await
    }

    pub async fn in_memory_with(
        pool_id: i32,
        requires_physical_deletion: bool,
        log_dir: &Path,
    ) -> Arc<Self> {
        let config = EndpointConfig {
            pool_id,
            access_key: String::new(),
            secret_key: String::new(),
            bucket: format!("pool-{pool_id}"),
            service_url: None,
            region: None,
            requires_physical_deletion,
        };
        let inner = Endpoint::with_store(&config, Arc::new(InMemory::new()), log_dir)
            .await
            .expect("in-memory endpoint");

        Arc::new(Self {
            inner,
            fail_batch_deletes: AtomicBool::new(false),
            fail_puts: AtomicBool::new(false),
            deleted: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_batch_deletes(&self, fail: bool) {
        self.fail_batch_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &Endpoint {
        &self.inner
    }

    /// Keys passed to successful delete calls, in call order.
    pub async fn deleted_keys(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }

    pub async fn seed(&self, key: &str, data: &'static [u8]) {
        self.inner
            .store()
            .put(&ObjectPath::from(key), PutPayload::from_static(data))
            .await
            .expect("seed object");
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.store().head(&ObjectPath::from(key)).await.is_ok()
    }

    pub async fn read(&self, key: &str) -> Option<Bytes> {
        match self.inner.store().get(&ObjectPath::from(key)).await {
            Ok(result) => result.bytes().await.ok(),
            Err(_) => None,
        }
    }
}

#[async_trait]
impl ObjectEndpoint for FaultyEndpoint {
    fn pool_id(&self) -> i32 {
        self.inner.pool_id()
    }

    async fn delete(&self, key: &str) -> Result<(), EndpointError> {
        self.inner.delete(key).await?;
        self.deleted.lock().await.push(key.to_string());
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<(), EndpointError> {
        if self.fail_batch_deletes.load(Ordering::SeqCst) {
            return Err(injected("batch delete"));
        }
        self.inner.delete_batch(keys).await?;
        self.deleted.lock().await.extend(keys.iter().cloned());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<ObjectBody, EndpointError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, body: ObjectBody) -> Result<u64, EndpointError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(injected("put"));
        }
        self.inner.put(key, body).await
    }
}
