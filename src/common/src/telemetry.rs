//! Operational counters exported over OTLP.
//!
//! Counters are recorded through the global meter provider and are no-ops
//! until [`init_telemetry`] installs an exporting one.

use anyhow::{Context, Result};
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

use crate::config::Configuration;

pub const METER_NAME: &str = "reclaim";

/// Per-pool deleted-object counter and catalog query counter.
#[derive(Clone)]
pub struct ReclaimCounters {
    deleted: Counter<u64>,
    database_queries: Counter<u64>,
}

impl ReclaimCounters {
    pub fn new(meter: &Meter) -> Self {
        Self {
            deleted: meter
                .u64_counter("reclaim.deleted")
                .with_description("Objects handed to an endpoint for deletion")
                .build(),
            database_queries: meter
                .u64_counter("reclaim.database_queries")
                .with_description("Catalog queries issued")
                .build(),
        }
    }

    /// Counters bound to the global meter provider.
    pub fn global() -> Self {
        Self::new(&global::meter(METER_NAME))
    }

    pub fn record_deleted(&self, pool_id: i32, count: u64) {
        self.deleted
            .add(count, &[KeyValue::new("pool", i64::from(pool_id))]);
    }

    pub fn record_query(&self, operation: &'static str) {
        self.database_queries
            .add(1, &[KeyValue::new("operation", operation)]);
    }
}

pub struct Telemetry {
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn meter_provider(&self) -> &SdkMeterProvider {
        &self.meter_provider
    }

    /// Flush pending counters and stop the exporter.
    pub fn shutdown(self) {
        if let Err(e) = self.meter_provider.force_flush() {
            tracing::warn!(error = %e, "Failed to flush meter provider");
        }
        if let Err(e) = self.meter_provider.shutdown() {
            tracing::warn!(error = %e, "Failed to shutdown meter provider");
        }
    }
}

/// Install an OTLP-exporting global meter provider when telemetry is enabled.
pub fn init_telemetry(config: &Configuration) -> Result<Option<Telemetry>> {
    if !config.telemetry.enabled {
        return Ok(None);
    }

    let endpoint = &config.telemetry.endpoint;
    let resource = Resource::builder()
        .with_attributes(vec![
            KeyValue::new("service.name", METER_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();

    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.to_string())
        .build()
        .context("Failed to build metric exporter")?;
    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.telemetry.interval)
        .build();
    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    global::set_meter_provider(meter_provider.clone());
    tracing::info!(endpoint = %endpoint, interval = ?config.telemetry.interval, "Exporting counters over OTLP");

    Ok(Some(Telemetry { meter_provider }))
}


#[cfg(test)]
mod tests {
    use super::test_support::MeterHarness;
    use super::*;

    #[test]
    fn test_disabled_returns_none() {
        let config = Configuration::default();
        assert!(!config.telemetry.enabled);
        assert!(init_telemetry(&config).unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enabled_creates_telemetry() {
        let mut config = Configuration::default();
        config.telemetry.enabled = true;
        config.telemetry.endpoint = "http://127.0.0.1:4317".to_string();

        let telemetry = init_telemetry(&config).unwrap().unwrap();
        telemetry.shutdown();
    }

    #[test]
    fn test_deleted_counter_is_tagged_by_pool() {
        let harness = MeterHarness::new();
        let counters = harness.counters();

        counters.record_deleted(1, 3);
        counters.record_deleted(1, 2);
        counters.record_deleted(2, 7);

        assert_eq!(harness.total("reclaim.deleted", &KeyValue::new("pool", 1_i64)), 5);
        assert_eq!(harness.total("reclaim.deleted", &KeyValue::new("pool", 2_i64)), 7);
    }

    #[test]
    fn test_query_counter_is_tagged_by_operation() {
        let harness = MeterHarness::new();
        let counters = harness.counters();

        counters.record_query("count_references");
        counters.record_query("count_references");
        counters.record_query("remove_upload");

        assert_eq!(
            harness.total(
                "reclaim.database_queries",
                &KeyValue::new("operation", "count_references")
            ),
            2
        );
    }
}
