use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flipscan_storage::DedupStore;
use flipscan_sync::{EngineConfig, RunSummary, StopMessage, StopSignal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "flipscan")]
#[command(about = "Scan regional listings for items priced below their resale value")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every task in the tasks file once (default).
    Run {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create the store tables.
    Migrate,
    /// Delete stored listings older than the retention window.
    Prune {
        #[arg(long)]
        days: Option<i64>,
    },
}

fn init_tracing() {
    let default_level = if std::env::var_os("FLIPSCAN_DEBUG").is_some() {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).context("serializing run summary")?
        );
        return Ok(());
    }
    println!(
        "run complete: run_id={} tasks={} completed={} skipped={} unprofitable={} failed={} regions_failed={} found={} reported={} notified={} pruned={}{}",
        summary.run_id,
        summary.tasks_total,
        summary.tasks_completed,
        summary.tasks_skipped_recent,
        summary.tasks_unprofitable,
        summary.tasks_failed,
        summary.regions_failed,
        summary.candidates_found,
        summary.candidates_reported,
        summary.notifications_sent,
        summary.pruned_rows,
        if summary.stopped { " (stopped)" } else { "" }
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { json: false }) {
        Commands::Run { json } => {
            let (tx, mut stop) = StopSignal::channel();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current region");
                    let _ = tx.send(StopMessage::now());
                }
            });
            let summary = flipscan_sync::run_from_env(&mut stop).await?;
            print_summary(&summary, json)?;
        }
        Commands::Migrate => {
            let config = EngineConfig::from_env();
            let store = DedupStore::open(&config.database_url)
                .await
                .with_context(|| format!("opening store {}", config.database_url))?;
            store.close().await;
            info!(database_url = %config.database_url, "store tables ready");
            println!("migrate complete: {}", config.database_url);
        }
        Commands::Prune { days } => {
            let config = EngineConfig::from_env();
            let days = days.unwrap_or(config.max_days_to_keep);
            let store = DedupStore::open(&config.database_url)
                .await
                .with_context(|| format!("opening store {}", config.database_url))?;
            let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
            let pruned = store
                .prune_listings_older_than(cutoff)
                .await
                .context("pruning listings")?;
            store.close().await;
            println!("prune complete: removed {pruned} listings older than {days} days");
        }
    }

    Ok(())
}
