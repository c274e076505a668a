use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leads_ingest::{maybe_build_scheduler, IngestConfig, ScrapePipeline};
use leads_storage::LeadStore;
use leads_web::WebConfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "leads-cli")]
#[command(about = "Lead intake: form endpoint and listing scraper")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape sweep and print the summary.
    Scrape,
    /// Serve the intake endpoint, with scheduled sweeps when enabled.
    Serve,
    /// Create the leads table if missing.
    InitDb,
    /// Print the most recent leads.
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,sqlx=warn".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Scrape) {
        Commands::Scrape => {
            let summary = leads_ingest::run_scrape_once_from_env().await?;
            println!(
                "scrape complete: run_id={} url={} fetch_failed={} considered={} saved={} duplicates={} skipped={} failed={}",
                summary.run_id,
                summary.listing_url,
                summary.fetch_failed,
                summary.considered(),
                summary.saved(),
                summary.save.duplicates,
                summary.skipped_items,
                summary.save.failed,
            );
        }
        Commands::Serve => serve().await?,
        Commands::InitDb => {
            let config = IngestConfig::from_env();
            let store = open_store(&config.database_url).await?;
            println!("schema ready: {}", config.database_url);
            store.close().await;
        }
        Commands::List { limit } => {
            let config = IngestConfig::from_env();
            let store = open_store(&config.database_url).await?;
            for lead in store.list_recent(limit).await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    lead.id,
                    lead.timestamp.to_rfc3339(),
                    lead.source,
                    lead.email.as_deref().unwrap_or("-"),
                    lead.details
                );
            }
            store.close().await;
        }
    }

    Ok(())
}

async fn serve() -> Result<()> {
    let ingest = IngestConfig::from_env();
    let web = WebConfig::from_env();
    let store = open_store(&web.database_url).await?;

    let pipeline = Arc::new(ScrapePipeline::new(&ingest, store.clone())?);
    let scheduler = maybe_build_scheduler(pipeline, &ingest).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %ingest.scrape_cron, "scheduled scraping enabled");
    }

    let result = leads_web::serve(&web, store.clone()).await;
    store.close().await;
    result
}

async fn open_store(database_url: &str) -> Result<LeadStore> {
    LeadStore::open(&leads_storage::StoreConfig::new(database_url.to_string()))
        .await
        .with_context(|| format!("opening lead store {database_url}"))
}
