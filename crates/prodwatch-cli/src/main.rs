use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prodwatch_core::Artikul;
use prodwatch_sched::{refresh_product, RefreshScheduler, WatchConfig};
use prodwatch_store::PgStore;
use prodwatch_upstream::{CardApiFetcher, UpstreamConfig};
use prodwatch_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "prodwatch")]
#[command(about = "Product watch service command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ensure the schema, restore persisted subscriptions and serve the API.
    Serve,
    /// Fetch one product from upstream and upsert it into storage.
    Fetch { artikul: Artikul },
    /// Create or update the database schema.
    Migrate,
}

fn fetcher_from_config(config: &WatchConfig) -> Result<CardApiFetcher> {
    CardApiFetcher::new(UpstreamConfig {
        base_url: config.card_base_url.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = WatchConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.ensure_schema().await.context("ensuring schema")?;
            let store = Arc::new(store);
            let fetcher = Arc::new(fetcher_from_config(&config)?);

            let scheduler = RefreshScheduler::start(
                fetcher,
                store.clone(),
                store.clone(),
                config.refresh_interval_secs,
            )
            .await?;
            // Timers are restored before the API starts taking requests.
            scheduler.reload().await?;
            let scheduler = Arc::new(scheduler);

            let state = AppState::new(scheduler.clone());
            info!(port = config.web_port, "serving HTTP API");
            tokio::select! {
                result = prodwatch_web::serve(state, config.web_port) => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received, draining scheduler");
                    scheduler.shutdown().await?;
                }
            }
        }
        Commands::Fetch { artikul } => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.ensure_schema().await.context("ensuring schema")?;
            let fetcher = fetcher_from_config(&config)?;

            let record = refresh_product(&fetcher, &store, artikul).await?;
            println!(
                "fetched artikul={} name={:?} price={:?} rating={:?} stock={:?}",
                record.artikul, record.name, record.price, record.rating, record.stock
            );
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.ensure_schema().await.context("ensuring schema")?;
            println!("schema is up to date");
        }
    }

    Ok(())
}
