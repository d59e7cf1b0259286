use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use voidscan_pipeline::{DetectionPipeline, DetectorConfig};
use voidscan_storage::PgOpportunityStore;

#[derive(Debug, Parser)]
#[command(name = "voidscan-cli")]
#[command(about = "Ecosystem void scanner command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one detection pass and print the run summary.
    Detect,
    /// Run detection on the configured cron schedule until interrupted.
    Schedule,
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = DetectorConfig::from_env();

    match cli.command.unwrap_or(Commands::Detect) {
        Commands::Detect => {
            let pipeline = DetectionPipeline::new(config).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "detection complete: run_id={} created={} updated={} error={}",
                summary.run_id,
                summary.created,
                summary.updated,
                summary.error.as_deref().unwrap_or("none"),
            );
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let pipeline = Arc::new(DetectionPipeline::new(config).await?);
            let mut sched = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler was not built despite being enabled")?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
        }
        Commands::Migrate => {
            let store = PgOpportunityStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
