use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use whc_storage::TargetStore;
use whc_sync::{SyncConfig, SYNC_FAILED_MESSAGE};

#[derive(Debug, Parser)]
#[command(name = "whc-cli")]
#[command(about = "WHC supplier offer blog sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync and exit non-zero if it fails.
    Sync,
    /// Apply back-office migrations.
    Migrate,
    /// Serve the back-office API, with the cron job when enabled.
    Serve,
    /// Print when the mirror last synced.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,whc_sync=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let sync = whc_sync::connect_from_config(&config).await?;
            if !sync.sync().await {
                bail!(SYNC_FAILED_MESSAGE);
            }
            if let whc_sync::SyncState::Succeeded { summary } = sync.state() {
                info!(
                    run_id = %summary.run_id,
                    chunks = summary.chunks,
                    rows_read = summary.rows_read,
                    rows_skipped_sold = summary.rows_skipped_sold,
                    rows_upserted = summary.rows_upserted,
                    "sync complete"
                );
            }
        }
        Commands::Migrate => {
            let target = whc_sync::connect_target(&config).await?;
            target.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Serve => {
            whc_web::serve_from_env().await?;
        }
        Commands::Status => {
            let target = whc_sync::connect_target(&config).await?;
            let ledger = target
                .last_synced()
                .await
                .context("reading last sync time")?;
            println!(
                "{}",
                serde_json::json!({ "last_synced": ledger.map(|l| l.last_synced) })
            );
        }
    }

    Ok(())
}
