//! # Credential Sync Main Entry Point
//!
//! `serve` (the default) runs the API and scheduler, `migrate` applies schema
//! migrations, and `sync` performs a one-off provider sync.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use credential_sync::{
    adapters::AdapterRegistry,
    config::ConfigLoader,
    db,
    handlers::types::SyncJobResultView,
    orchestrator::{Orchestrator, SyncTrigger},
    seeds,
    server::run_server,
    telemetry,
};

#[derive(Parser)]
#[command(
    name = "credential-sync",
    about = "External credential ingestion and reconciliation service",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and the sync scheduler
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Run one sync for a provider and print the result as JSON
    Sync {
        /// Provider id (e.g. "nsdc")
        #[arg(long)]
        provider: String,
        /// Resync from the epoch instead of the last successful sync
        #[arg(long)]
        full: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config)?;

    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Loaded configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            db::run_migrations(&db).await?;
            run_server(config, db).await
        }
        Command::Migrate => {
            db::run_migrations(&db).await?;
            tracing::info!("Migrations applied");
            Ok(())
        }
        Command::Sync { provider, full } => {
            db::run_migrations(&db).await?;
            let config = Arc::new(config);
            let db = Arc::new(db);
            let registry = Arc::new(AdapterRegistry::from_config(&config)?);
            seeds::seed_providers(&db, &registry).await?;

            let orchestrator = Arc::new(Orchestrator::new(db, config, registry)?);
            orchestrator.recover_stale().await?;
            let result = orchestrator
                .force_sync(&provider, full, SyncTrigger::Cli)
                .await?;

            println!(
                "{}",
                serde_json::to_string_pretty(&SyncJobResultView::from(result))?
            );
            Ok(())
        }
    }
}
