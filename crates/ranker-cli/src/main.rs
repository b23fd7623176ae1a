use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ranker_adapters::{extract_from_html, RecordExtractor, SearchSelectors};
use ranker_sync::{live_validator, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ranker-cli")]
#[command(about = "Shopify app search ranking scraper")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one validate, extract, filter and load pass.
    Sync,
    /// Run the sync on the configured cron until Ctrl-C.
    Schedule,
    /// Check the search page structure without writing anything.
    Validate {
        #[arg(long)]
        url: Option<String>,
    },
    /// Print extracted records as JSON without touching the database.
    Extract {
        #[arg(long)]
        url: Option<String>,
        #[arg(long, conflicts_with = "url")]
        html_file: Option<PathBuf>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = ranker_sync::run_sync_once_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Schedule => {
            ranker_sync::run_scheduler_from_env().await?;
        }
        Commands::Validate { url } => {
            let config = SyncConfig::from_env();
            let url = url.unwrap_or_else(|| config.target_url.clone());
            let report = live_validator(&config)?.check(&url).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.passed {
                bail!("validation failed for {url}");
            }
        }
        Commands::Extract { url, html_file } => {
            if let Some(path) = html_file {
                let html = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let batch = extract_from_html(&html, &SearchSelectors::default())?;
                println!("{}", serde_json::to_string_pretty(&batch)?);
            } else {
                let config = SyncConfig::from_env();
                let url = url.unwrap_or_else(|| config.target_url.clone());
                let extraction = RecordExtractor::new(live_validator(&config)?).extract(&url).await?;
                println!("{}", serde_json::to_string_pretty(&extraction)?);
            }
        }
    }

    Ok(())
}
