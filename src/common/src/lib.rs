pub mod append_log;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod endpoint;
pub mod telemetry;
pub mod upload;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use catalog::{Catalog, CatalogError, InstrumentedCatalog, UploadCatalog, UploadStream};
pub use endpoint::{Endpoint, EndpointError, ObjectEndpoint};
pub use telemetry::ReclaimCounters;
pub use upload::{ReferenceKey, UploadRecord};
