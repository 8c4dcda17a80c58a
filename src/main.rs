// Train punctuality tracker: fetches timetable snapshots, reconciles them into
// arrival records and serves the results to the dashboard.

use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

mod api;
mod config;
mod error;
mod fetcher;
mod importer;
mod models;
mod parser;
mod rate_limiter;
mod reconcile;
mod scheduler;
mod snapshot;
mod stations;
mod store;

use config::Config;
use importer::DateOutcome;
use rate_limiter::RateLimiter;
use store::PgStore;

#[derive(Parser, Debug)]
#[command(name = "zugspaet", version, about = "Train punctuality tracker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch plan and change snapshots for every configured station.
    Fetch,
    /// Import snapshot folders into the database.
    Import {
        /// Only import this date (YYYY-MM-DD).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Create the database tables.
    InitDb,
    /// Run the HTTP server together with the scheduled jobs.
    Serve,
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env().context("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level())
        .with_target(false)
        .init();

    let limiter = Arc::new(RateLimiter::new(config.rate_limit, config.rate_period));

    match cli.command {
        Command::Fetch => {
            let folder = fetcher::run_fetch_cycle(&config, limiter)?;
            tracing::info!("Data saved to {:?}", folder);
        }
        Command::Import { date: Some(date) } => match importer::run_import_for_date(&config, date)? {
            DateOutcome::AlreadyProcessed => tracing::info!("{} was already imported", date),
            DateOutcome::Imported { arrivals } => tracing::info!("Imported {} arrivals for {}", arrivals, date),
        },
        Command::Import { date: None } => {
            let dates = importer::run_import_cycle(&config)?;
            let dates: Vec<String> = dates.iter().map(|d| d.to_string()).collect();
            tracing::info!("Successfully processed dates: {}", dates.join(", "));
        }
        Command::InitDb => {
            let mut store = PgStore::connect(&config.database)?;
            store.init_schema()?;
            tracing::info!("Database initialization completed successfully");
        }
        Command::Serve => {
            config.require_credentials()?;
            config.require_private_api_key()?;
            actix_web::rt::System::new().block_on(api::run_server(Arc::new(config), limiter))?;
        }
    }

    Ok(())
}
