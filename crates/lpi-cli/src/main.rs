use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use lpi_storage::PgStore;
use lpi_sync::{IngestionRequest, RunReport, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "lpi-cli")]
#[command(about = "Legal publication ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch publications for one OAB registration and derive processes and clients.
    Ingest {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        oab_number: String,
        #[arg(long)]
        oab_state: String,
        /// First publication date (YYYY-MM-DD); defaults to the configured window.
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last publication date (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Re-derive processes and clients from stored publications.
    Reprocess {
        #[arg(long)]
        owner: String,
        #[arg(long = "id", required = true, num_args = 1..)]
        ids: Vec<Uuid>,
    },
    Serve,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lpi_sync=info,lpi_web=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Ingest {
            owner,
            oab_number,
            oab_state,
            from,
            to,
        } => {
            let (config, runner) = lpi_sync::runner_from_env().await?;
            let date_to = to.unwrap_or_else(|| Utc::now().date_naive());
            let mut request = IngestionRequest::last_days(
                owner,
                oab_number,
                oab_state,
                config.default_window_days,
                date_to,
            );
            if let Some(date_from) = from {
                request.date_from = date_from;
            }
            if request.date_from > request.date_to {
                bail!(
                    "--from {} is after --to {}",
                    request.date_from,
                    request.date_to
                );
            }
            let report = runner
                .run_ingestion(&request)
                .await
                .context("ingestion run failed")?;
            print_report(&report)?;
        }
        Commands::Reprocess { owner, ids } => {
            let (_, runner) = lpi_sync::runner_from_env().await?;
            let report = runner.reprocess(&owner, &ids).await;
            print_report(&report)?;
        }
        Commands::Serve => {
            lpi_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connect to postgres")?;
            store.migrate().await.context("apply migrations")?;
            info!("migrations applied");
        }
    }

    Ok(())
}

fn print_report(report: &RunReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
