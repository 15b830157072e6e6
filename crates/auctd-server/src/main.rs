//! auctd: real-time multi-party auction simulation server.
//!
//! Drives remote buyers, sellers and market operators through a
//! lock-step game/day/round phase sequence over persistent TCP sessions.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Auction simulation server.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via AUCTD_CONFIG).
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    auctd_server::logging::init_logging();

    info!("Starting auctd v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args
        .config
        .or_else(|| std::env::var("AUCTD_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let config = auctd_server::ServerConfig::from_file(&config_path)?;
    info!(listen = %config.listen_addr, ?config.delivery, "Configuration loaded");

    let app = auctd_server::Application::new(config)?;
    let shutdown = app.shutdown_token();

    // Ctrl-C triggers a graceful stop; exit code 0 after SimulationOver
    // or an operator-requested shutdown.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            shutdown.cancel();
        }
    });

    app.run().await?;
    Ok(())
}
