//! Wiring from configuration to connected passes.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use common::config::Configuration;
use common::{Catalog, Endpoint, InstrumentedCatalog, ObjectEndpoint, ReclaimCounters, UploadCatalog};

use crate::deletion::{DeletionPass, EndpointMap};
use crate::migration::MigrationRunner;

/// Connect and probe the endpoints for `pool_ids`. Any unreachable endpoint aborts startup.
///
/// Endpoints record deleted-object counts through the global meter provider.
pub async fn connect_endpoints(
    config: &Configuration,
    pool_ids: &[i32],
    log_dir: &Path,
) -> Result<EndpointMap> {
    let mut endpoints = EndpointMap::new();
    for pool_id in pool_ids {
        let endpoint_config = config
            .endpoint(*pool_id)
            .with_context(|| format!("No endpoint configured for pool {pool_id}"))?;
        let endpoint = Endpoint::connect(endpoint_config, log_dir)
            .await
            .with_context(|| format!("Failed to connect to endpoint {pool_id}"))?;
        endpoints.insert(*pool_id, Arc::new(endpoint) as Arc<dyn ObjectEndpoint>);
    }
    Ok(endpoints)
}

/// Build a deletion pass from already connected collaborators.
///
/// `overrides` restrict the scope ahead of `run_endpoints`; endpoints outside
/// the resulting scope are dropped.
pub async fn deletion_pass(
    config: &Configuration,
    catalog: Arc<dyn UploadCatalog>,
    mut endpoints: EndpointMap,
    overrides: &[i32],
) -> Result<DeletionPass> {
    let scope = config.deletion_scope(overrides);
    endpoints.retain(|pool_id, _| scope.contains(pool_id));
    if let Some(missing) = scope.iter().find(|id| !endpoints.contains_key(*id)) {
        anyhow::bail!("No connected endpoint for store {missing}");
    }

    tracing::info!("Populating pro users...");
    let exempt_users = catalog
        .exempt_user_ids()
        .await
        .context("Failed to load exempt users")?;
    tracing::info!(count = exempt_users.len(), "Pro users found");

    let scope_list = scope
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    tracing::info!(
        exempt_users = exempt_users.len(),
        endpoints = %scope_list,
        partition_size = config.deletion.partition_size,
        workers = config.deletion.worker_count,
        "Deletion pass configured"
    );

    Ok(
        DeletionPass::new(catalog, endpoints, config.deletion.clone())
            .with_scope(scope)
            .with_exempt_users(exempt_users),
    )
}

/// Connect the catalog, counting its queries through the global meter provider.
async fn connect_catalog(config: &Configuration) -> Result<InstrumentedCatalog<Catalog>> {
    let catalog = Catalog::connect(&config.database)
        .await
        .context("Failed to connect to catalog")?;
    Ok(InstrumentedCatalog::new(catalog, ReclaimCounters::global()))
}

/// Connect the catalog and in-scope endpoints and build a deletion pass.
pub async fn prepare_deletion(config: &Configuration, overrides: &[i32]) -> Result<DeletionPass> {
    let scope = config.deletion_scope(overrides);
    if scope.is_empty() {
        anyhow::bail!("No endpoints configured; nothing to delete");
    }

    let catalog = connect_catalog(config).await?;
    let endpoints = connect_endpoints(config, &scope, &config.logs.directory).await?;

    deletion_pass(config, Arc::new(catalog), endpoints, overrides).await
}

/// Connect the catalog and both endpoints and build a migration runner.
pub async fn prepare_migration(
    config: &Configuration,
    source: i32,
    destination: i32,
) -> Result<MigrationRunner> {
    if source == destination {
        anyhow::bail!("Source and destination must differ (both are {source})");
    }

    let catalog = connect_catalog(config).await?;
    let mut endpoints =
        connect_endpoints(config, &[source, destination], &config.logs.directory).await?;

    let (Some(source_endpoint), Some(destination_endpoint)) =
        (endpoints.remove(&source), endpoints.remove(&destination))
    else {
        anyhow::bail!("Endpoints {source} and {destination} must both be configured");
    };

    tracing::info!(source, destination, "Migration configured");

    let runner = MigrationRunner::new(
        Arc::new(catalog),
        source_endpoint,
        destination_endpoint,
        config.migration.clone(),
        &config.logs.directory,
    )
    .await
    .context("Failed to open migration logs")?
    .with_progress_interval(config.deletion.progress_interval);
    Ok(runner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::EndpointError;
    use common::testing::{FaultyEndpoint, MemoryCatalog, TestConfigBuilder};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_deletion_pass_scope_and_exempt_users() {
        let dir = TempDir::new().unwrap();
        let config = TestConfigBuilder::new()
            .in_memory()
            .with_endpoint(1)
            .with_endpoint(2)
            .with_run_endpoints(&[2])
            .with_log_dir(dir.path())
            .build();

        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_user(7, true, 0).await;
        catalog.add_user(8, false, 0).await;

        let mut endpoints = EndpointMap::new();
        for pool_id in [1, 2] {
            let endpoint = FaultyEndpoint::in_memory(pool_id, dir.path()).await;
            endpoints.insert(pool_id, endpoint as Arc<dyn ObjectEndpoint>);
        }

        let pass = deletion_pass(&config, catalog.clone(), endpoints, &[])
            .await
            .unwrap();
        assert_eq!(pass.scope(), &[2]);

        let endpoints = EndpointMap::new();
        let error = deletion_pass(&config, catalog, endpoints, &[1]).await;
        assert!(error.is_err());
    }

    #[tokio::test]
    async fn test_missing_endpoint_config_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = TestConfigBuilder::new().with_log_dir(dir.path()).build();
        assert!(connect_endpoints(&config, &[9], dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = TestConfigBuilder::new()
            .with_endpoint(4)
            .with_service_url(4, "http://127.0.0.1:1")
            .with_log_dir(dir.path())
            .build();

        let Err(error) = connect_endpoints(&config, &[4], dir.path()).await else {
            panic!("an unreachable endpoint was accepted");
        };
        assert!(matches!(
            error.downcast_ref::<EndpointError>(),
            Some(EndpointError::Probe { .. })
        ));
        assert!(!dir.path().join("deleted-4.log").exists());
    }

    #[tokio::test]
    async fn test_migration_requires_distinct_endpoints() {
        let config = TestConfigBuilder::new().in_memory().with_endpoint(1).build();
        assert!(prepare_migration(&config, 1, 1).await.is_err());
    }
}
