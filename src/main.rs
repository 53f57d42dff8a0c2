mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use roster_sync::config::Config;

#[derive(Parser)]
#[command(
    name = "roster-sync",
    version,
    about = "Reconcile a time-windowed membership roster against a remote group directory",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); environment variables are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides logging.format
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one locked reconciliation pass
    Sync {
        /// Print the run report as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Show the changes a sync would make, without locking or mutating
    Plan {
        /// Print the plan as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Sync periodically until interrupted
    Watch {
        /// Seconds between runs
        #[arg(short, long, default_value = "300")]
        interval: u64,
    },

    /// Create the roster database and schema
    Init,

    /// Set the maintenance flag so runs wait
    Pause,

    /// Clear the maintenance flag
    Resume,

    /// Show the maintenance flag and last change time
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // Initialize tracing/logging
    let format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    setup_tracing(format, &config.logging.level, cli.verbose)?;

    tracing::debug!(
        roster = %config.roster.path.display(),
        directory = %config.directory.base_url,
        "Configuration loaded"
    );

    match cli.command {
        Commands::Sync { json } => {
            tracing::info!("Starting sync command");
            commands::sync(config, json).await?;
        }
        Commands::Plan { json } => {
            tracing::info!("Starting plan command");
            commands::plan(config, json).await?;
        }
        Commands::Watch { interval } => {
            anyhow::ensure!(interval > 0, "--interval must be at least 1 second");
            tracing::info!(interval, "Starting watch command");
            commands::watch(config, Duration::from_secs(interval)).await?;
        }
        Commands::Init => commands::init(&config)?,
        Commands::Pause => commands::pause(&config)?,
        Commands::Resume => commands::resume(&config)?,
        Commands::Status => commands::status(&config)?,
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("roster_sync=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("roster_sync={level},warn"))
            .context("Invalid logging.level")?
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
