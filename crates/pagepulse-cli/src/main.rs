use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use pagepulse_store::Store;
use pagepulse_sync::{GraphClient, RateLimiter, SyncConfig, SyncEngine, TokenMap};

#[derive(Parser)]
#[command(name = "pagepulse")]
#[command(about = "Incremental sync of page conversations and messages")]
#[command(version)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = "pagepulse.toml")]
    config: PathBuf,

    /// Override the database path from the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an incremental sync across all configured pages
    Sync {
        /// Override the token file path from the config
        #[arg(long)]
        tokens: Option<PathBuf>,

        /// Override the worker-pool width from the config
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Recompute response latency for all stored messages
    RecalcLatency,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = SyncConfig::load(&cli.config)?;
    if let Some(db) = cli.db {
        config.database = db;
    }

    match cli.command {
        Commands::Sync { tokens, workers } => {
            if let Some(tokens) = tokens {
                config.tokens = tokens;
            }
            if let Some(workers) = workers {
                config.max_workers = workers;
            }
            run_sync(config).await
        }
        Commands::RecalcLatency => run_recalc(config).await,
    }
}

async fn run_sync(config: SyncConfig) -> Result<()> {
    let store = Store::open(&config.database).await?;
    let tokens = TokenMap::load(&config.tokens)?;
    let limiter = Arc::new(RateLimiter::new(config.min_call_interval()));
    let http = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()?;
    let api = Arc::new(GraphClient::new(
        http,
        config.api_base_url.clone(),
        config.page_size,
        limiter.clone(),
    ));

    let engine = SyncEngine::new(store, api, tokens, limiter, config);
    let summary = engine.run().await?;

    println!("{}", "-".repeat(60));
    for outcome in &summary.outcomes {
        let status = if outcome.is_ok() { "[ok] " } else { "[err]" };
        println!(
            "  {} {}: {} convos ({} skipped), {} msgs",
            status,
            outcome.page_name,
            outcome.conversations_upserted,
            outcome.conversations_skipped,
            outcome.messages_upserted
        );
    }
    println!("{}", "-".repeat(60));
    println!(
        "Total: {} conversations, {} messages ({} unchanged skipped)",
        summary.total_conversations(),
        summary.total_messages(),
        summary.total_skipped()
    );
    println!(
        "API calls: {} ({:.1}/min)",
        summary.limiter.calls, summary.limiter.calls_per_minute
    );
    if summary.pages_without_token > 0 {
        println!("Pages without a token: {}", summary.pages_without_token);
    }

    let failures = summary.failures();
    if !failures.is_empty() {
        println!("\nErrors ({}):", failures.len());
        for outcome in failures {
            println!(
                "  - {}: {}",
                outcome.page_name,
                outcome.error.as_deref().unwrap_or("unknown")
            );
        }
    }

    // Page-level failures are reported above but do not fail the process.
    Ok(())
}

async fn run_recalc(config: SyncConfig) -> Result<()> {
    let store = Store::open(&config.database).await?;
    let processed = pagepulse_sync::recalculate_all_latencies(&store).await?;
    println!("Recalculated latency for {} conversations", processed);
    Ok(())
}
