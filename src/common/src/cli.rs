use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared by the reclaim commands
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Subcommands that inspect the configuration instead of running a pass
#[derive(Subcommand, Debug, Clone)]
pub enum CommonCommands {
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use std::collections::HashSet;
    use tracing_subscriber::EnvFilter;

    /// Default log level for the given flags
    pub fn log_level(args: &CommonArgs) -> &'static str {
        if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Initialize logging based on CLI arguments. `RUST_LOG` still wins when set.
    pub fn init_logging(args: &CommonArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level(args)));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading configuration");
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format. Secrets are masked.
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        let config = config.redacted();
        if json {
            let json = serde_json::to_string_pretty(&config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
            return Ok(());
        }

        println!("Reclaim Configuration:");
        println!("======================");
        println!("Catalog DSN: {}", crate::catalog::redact_dsn(&config.database.dsn));
        match &config.database.replica_dsn {
            Some(replica) => println!("Catalog replica DSN: {}", crate::catalog::redact_dsn(replica)),
            None => println!("Catalog replica: none"),
        }

        for endpoint in &config.endpoints {
            println!(
                "Endpoint {}: bucket={} url={} physical_deletion={}",
                endpoint.pool_id,
                endpoint.bucket,
                endpoint.service_url.as_deref().unwrap_or("s3"),
                endpoint.requires_physical_deletion
            );
        }
        if config.run_endpoints.is_empty() {
            println!("Deletion scope: all endpoints");
        } else {
            println!("Deletion scope: {:?}", config.run_endpoints);
        }

        println!(
            "Deletion: partition_size={} workers={} retention={:?}",
            config.deletion.partition_size, config.deletion.worker_count, config.deletion.retention
        );
        println!(
            "Migration: partition_size={} workers={}",
            config.migration.partition_size, config.migration.worker_count
        );
        println!("Log directory: {}", config.logs.directory.display());
        if config.telemetry.enabled {
            println!(
                "Telemetry: OTLP endpoint={} interval={:?}",
                config.telemetry.endpoint, config.telemetry.interval
            );
        } else {
            println!("Telemetry: disabled");
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        tracing::info!("Validating configuration...");

        if config.database.dsn.is_empty() {
            anyhow::bail!("Database DSN cannot be empty");
        }

        if config.deletion.partition_size == 0 || config.migration.partition_size == 0 {
            anyhow::bail!("Partition sizes must be greater than zero");
        }

        if config.deletion.worker_count == 0 || config.migration.worker_count == 0 {
            anyhow::bail!("Worker counts must be greater than zero");
        }

        let mut seen = HashSet::new();
        for endpoint in &config.endpoints {
            if !seen.insert(endpoint.pool_id) {
                anyhow::bail!("Endpoint pool id {} is configured twice", endpoint.pool_id);
            }
            if endpoint.bucket.is_empty() {
                anyhow::bail!("Endpoint {} has an empty bucket", endpoint.pool_id);
            }
            if let Some(url) = &endpoint.service_url {
                url::Url::parse(url).with_context(|| {
                    format!("Endpoint {} has an invalid service URL", endpoint.pool_id)
                })?;
            }
        }

        if config.telemetry.enabled {
            url::Url::parse(&config.telemetry.endpoint)
                .context("Telemetry endpoint is not a valid URL")?;
        }

        for pool_id in &config.run_endpoints {
            if config.endpoint(*pool_id).is_none() {
                anyhow::bail!("run_endpoints names unknown endpoint {pool_id}");
            }
        }

        tracing::info!("✅ Configuration validation passed");
        Ok(())
    }

    /// Handle the configuration commands
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<()> {
        match command {
            CommonCommands::Config { json } => display_config(config, *json),
            CommonCommands::Validate => validate_config(config),
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(())
            }
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}
