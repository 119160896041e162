use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use common::telemetry;
use reconciler::bootstrap;

#[derive(Parser)]
#[command(name = "reclaim")]
#[command(about = "Garbage-collects expired uploads and migrates objects between storage endpoints")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one deletion pass over expired uploads
    Delete {
        #[arg(long = "store", help = "Restrict the pass to this store id (repeatable)")]
        stores: Vec<i32>,

        #[arg(long, help = "Override the configured partition size")]
        partition_size: Option<usize>,
    },
    /// Move every object of one endpoint to another
    Migrate {
        #[arg(long, help = "Source store id")]
        from: i32,

        #[arg(long, help = "Destination store id")]
        to: i32,
    },
    #[command(flatten)]
    Common(CommonCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    utils::init_logging(&cli.common);

    let mut config = utils::load_config(cli.common.config.as_ref())?;

    if let Commands::Common(ref command) = cli.command {
        return utils::handle_common_command(command, &config);
    }

    let telemetry = telemetry::init_telemetry(&config)?;
    let result = run(cli.command, &mut config).await;
    if let Some(telemetry) = telemetry {
        telemetry.shutdown();
    }
    result
}

async fn run(command: Commands, config: &mut common::config::Configuration) -> Result<()> {
    match command {
        Commands::Common(ref command) => utils::handle_common_command(command, config),
        Commands::Delete {
            stores,
            partition_size,
        } => {
            if let Some(partition_size) = partition_size {
                config.deletion.partition_size = partition_size;
            }
            utils::validate_config(config)?;

            let pass = bootstrap::prepare_deletion(config, &stores).await?;
            pass.run().await.context("Deletion pass failed")?;
            Ok(())
        }
        Commands::Migrate { from, to } => {
            utils::validate_config(config)?;

            let runner = bootstrap::prepare_migration(config, from, to).await?;
            runner.run().await.context("Migration pass failed")?;
            Ok(())
        }
    }
}
