use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use tamalog_storage::{Database, ObservationStore, WeatherArchive};
use tamalog_sync::{build_cycle, shutdown_channel, AppConfig, BulkLoader, Scheduler};

#[derive(Debug, Parser)]
#[command(name = "tamalog")]
#[command(about = "Hourly Tokyo weather and Tama Monorail delay logger")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler daemon (bulk-syncs the snapshot first).
    Run,
    /// Run a single collection cycle and exit.
    Collect,
    /// Reload the weather archive from the snapshot file if it changed.
    Import {
        /// Override the configured snapshot path.
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Print stored rows in insertion order.
    Show {
        /// Dump the bulk-loaded archive table instead of observations.
        #[arg(long)]
        archive: bool,
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
    let config = AppConfig::from_env();
    let db = Database::open(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(&config, &db).await?,
        Commands::Collect => {
            let store = ObservationStore::new(&db);
            store.ensure_schema().await?;
            let cycle = build_cycle(&config, store)?;
            let obs = cycle.run().await;
            println!(
                "{} {} weather={} delay_status={}",
                obs.captured_date, obs.captured_time, obs.weather_value, obs.delay_status_value
            );
        }
        Commands::Import { snapshot } => {
            let archive = WeatherArchive::new(&db);
            archive.ensure_schema().await?;
            let loader = BulkLoader::new(archive);
            let path = snapshot.unwrap_or_else(|| config.snapshot_path.clone());
            let report = loader.sync_report(&path).await?;
            if report.reloaded {
                println!(
                    "reloaded: {} rows inserted, {} duplicates skipped, {} malformed skipped",
                    report.inserted, report.skipped_duplicates, report.skipped_malformed
                );
            } else {
                println!("no-op: snapshot missing or unchanged");
            }
        }
        Commands::Show { archive } => {
            if archive {
                let archive = WeatherArchive::new(&db);
                archive.ensure_schema().await?;
                for row in archive.all().await? {
                    println!(
                        "{}\t{}\t{}\t{}",
                        row.id, row.area_name, row.date, row.weather_desc
                    );
                }
            } else {
                let store = ObservationStore::new(&db);
                store.ensure_schema().await?;
                for row in store.all().await? {
                    println!(
                        "{}\t{}\t{}\t{}\t{}",
                        row.id,
                        row.observation.captured_date,
                        row.observation.captured_time,
                        row.observation.weather_value,
                        row.observation.delay_status_value
                    );
                }
            }
        }
    }

    Ok(())
}

async fn run_daemon(config: &AppConfig, db: &Database) -> Result<()> {
    let store = ObservationStore::new(db);
    store.ensure_schema().await?;

    let archive = WeatherArchive::new(db);
    archive.ensure_schema().await?;
    let loader = BulkLoader::new(archive);
    // A bulk-sync failure degrades the archive, not the schedule.
    match loader.sync_if_changed(&config.snapshot_path).await {
        Ok(true) => info!("archive reloaded from snapshot"),
        Ok(false) => info!("archive already up to date"),
        Err(err) => error!(%err, "startup bulk sync failed"),
    }

    let cycle = build_cycle(config, store)?;
    let (handle, rx) = shutdown_channel();
    let mut scheduler = Scheduler::new(cycle, rx)
        .with_poll_interval(Duration::from_secs(config.poll_interval_secs.max(1)));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing current cycle");
            handle.shutdown();
        }
    });

    scheduler.run().await;
    Ok(())
}
