use common::{CatalogError, EndpointError};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("no endpoint configured for store {0}")]
    MissingEndpoint(i32),
    #[error("side log write failed: {0}")]
    Io(#[from] std::io::Error),
}
