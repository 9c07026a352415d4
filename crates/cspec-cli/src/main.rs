use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cspec_storage::{PgRecordStore, RecordStore};
use cspec_sync::SyncConfig;
use cspec_web::WebConfig;
use futures::TryStreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cspec")]
#[command(about = "Campaign spec tracker: seed, inspect and serve campaign specifications")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the seed file with the database and download spec PDFs.
    Seed {
        /// Seed file to read instead of CSPEC_SEED_FILE.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Create the database tables if missing.
    Migrate,
    /// Print every stored campaign.
    List,
    /// Run the web UI.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Seed { file: None }) {
        Commands::Seed { file } => {
            if let Some(file) = file {
                config.seed_file = file;
            }
            let run = cspec_sync::run_seed(&config, cspec_sync::stop_on_ctrl_c()).await?;
            let s = &run.summary;
            println!(
                "seed complete: run_id={} total={} processed={} created={} updated={} skipped={} downloads_ok={} downloads_failed={} reused={}{}",
                s.run_id,
                s.total,
                s.processed,
                s.created,
                s.updated,
                s.skipped,
                s.downloads_succeeded,
                s.downloads_failed,
                s.downloads_reused,
                if s.interrupted { " (interrupted)" } else { "" },
            );
            for failure in &s.failures {
                println!(
                    "  failed: {} / {} [{:?}] {}",
                    failure.name, failure.client, failure.kind, failure.reason
                );
            }
            println!("report: {}", run.report_path.display());
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            let result = store.ensure_schema().await;
            store.close().await;
            result?;
            println!("schema ready");
        }
        Commands::List => {
            let store = connect(&config).await?;
            let result = print_campaigns(&store).await;
            store.close().await;
            result?;
        }
        Commands::Serve { port } => {
            let mut web = WebConfig::from_env();
            if let Some(port) = port {
                web.port = port;
            }
            let store = Arc::new(connect(&config).await?);
            store.ensure_schema().await?;
            info!(pdf_dir = %web.pdf_dir.display(), "starting web UI");
            cspec_web::serve(&web, store).await?;
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<PgRecordStore> {
    PgRecordStore::connect(&config.database)
        .await
        .context("connecting to the campaign database")
}

async fn print_campaigns(store: &PgRecordStore) -> Result<()> {
    let mut rows = store.list_all();
    let mut count = 0usize;
    while let Some(row) = rows.try_next().await? {
        count += 1;
        println!(
            "{:>4}  {:<32}  {:<24}  {:<10}  {}",
            row.id,
            row.name,
            row.client,
            row.status,
            row.pdf_filename.as_deref().unwrap_or("-"),
        );
    }
    println!("{count} campaign(s)");
    Ok(())
}
