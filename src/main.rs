use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use wattbench::config::Settings;
use wattbench::runner::{Runner, TestConfig};
use wattbench::telemetry::BroadcastSink;

#[derive(Parser)]
#[command(
    name = "wattbench",
    about = "Network-load vs. power-draw test bench for devices under test",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (control API + telemetry stream)
    Serve {
        /// Bind address (overrides WATTBENCH_LISTEN)
        #[arg(long)]
        bind: Option<String>,

        /// SQLite database path (overrides WATTBENCH_DB)
        #[arg(long)]
        db: Option<String>,

        /// Use the mock power source
        #[arg(long)]
        mock: bool,
    },

    /// Check connectivity to the configured power source
    Probe {
        /// Use the mock power source
        #[arg(long)]
        mock: bool,
    },

    /// Run a single test from a JSON config file and store the result
    Run {
        /// Path to a TestConfig JSON file
        #[arg(long)]
        config: String,

        /// SQLite database path (overrides WATTBENCH_DB)
        #[arg(long)]
        db: Option<String>,

        /// Use the mock power source
        #[arg(long)]
        mock: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env();

    match cli.command {
        Commands::Serve { bind, db, mock } => {
            if let Some(bind) = bind {
                settings.listen_addr = bind;
            }
            if let Some(db) = db {
                settings.db_path = db;
            }
            settings.mock_power |= mock;

            info!(listen = %settings.listen_addr, "starting wattbench daemon");
            wattbench::serve(settings).await?;
        }
        Commands::Probe { mock } => {
            settings.mock_power |= mock;
            let power = wattbench::power::from_settings(&settings)?;
            let reading = tokio::task::spawn_blocking(move || {
                power.probe()?;
                power.current_power_mw()
            })
            .await??;
            println!("power source reachable, current draw: {:.1} mW", reading);
        }
        Commands::Run { config, db, mock } => {
            if let Some(db) = db {
                settings.db_path = db;
            }
            settings.mock_power |= mock;

            let raw = std::fs::read_to_string(&config)
                .with_context(|| format!("failed to read config file {}", config))?;
            let test_config: TestConfig =
                serde_json::from_str(&raw).context("failed to parse test config")?;

            let power = wattbench::power::from_settings(&settings)?;
            let pool = wattbench::storage::open_pool(&settings.db_path)?;
            let store = wattbench::storage::RunStore::new(pool);

            let runner = Arc::new(Runner::new(power));
            let sink = Arc::new(BroadcastSink::new(64));

            // Ctrl-C cancels the run; the partial result is still stored.
            tokio::spawn({
                let runner = Arc::clone(&runner);
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        runner.stop();
                    }
                }
            });

            let handle = runner.try_start(test_config, sink)?;
            let result = handle.await.context("test task failed")?;

            let summary = wattbench::storage::summary::summarize(&result);
            println!("{}", serde_json::to_string_pretty(&summary)?);

            let id = tokio::task::spawn_blocking(move || store.save(&result)).await??;
            info!(run_id = id, "run stored");
        }
    }

    Ok(())
}
