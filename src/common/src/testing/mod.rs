//! Test utilities for the reclaim tools.
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! common = { path = "../common", features = ["testing"] }
//! ```

mod config_builder;
mod faulty_endpoint;
mod memory_catalog;

pub use config_builder::TestConfigBuilder;
pub use faulty_endpoint::FaultyEndpoint;
pub use memory_catalog::MemoryCatalog;
