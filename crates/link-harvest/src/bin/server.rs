//! Link harvest server binary
//!
//! Run with: cargo run -p link-harvest --bin link-harvest-server -- --config harvest.toml

use std::path::PathBuf;

use clap::Parser;
use link_harvest::{config::HarvestConfig, server::HarvestServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "link-harvest-server", version, about = "Batch social link harvesting service")]
struct Args {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long, env = "LINK_HARVEST_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "link_harvest=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => HarvestConfig::from_file(path)?,
        None => HarvestConfig::default(),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    tracing::info!("Configuration loaded");
    tracing::info!("  - Key column: {}", config.extraction.key_column);
    tracing::info!(
        "  - Platforms: {}",
        config
            .extraction
            .platforms
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    tracing::info!(
        "  - Chunk size: {} (max {})",
        config.processing.default_chunk_size,
        config.processing.max_chunk_size
    );
    tracing::info!(
        "  - Retries: {}, record timeout: {}s",
        config.retry.max_retries,
        config.processing.record_timeout_secs
    );

    // Create and start server
    let server = HarvestServer::new(config).await?;
    let addr = server.address()?;

    println!("\nServer starting...");
    println!("  API: http://{}", addr);
    println!("  Health: http://{}/health", addr);
    println!("  API Info: http://{}/api/info", addr);
    println!("\nEndpoints:");
    println!("  POST /api/jobs            - Queue a spreadsheet");
    println!("  POST /api/scrape          - Process a spreadsheet and download the result");
    println!("  GET  /api/jobs/:id        - Poll job status");
    println!("  GET  /api/jobs/:id/events - Stream job progress");
    println!("\nPress Ctrl+C to stop\n");

    server.start().await?;

    Ok(())
}
