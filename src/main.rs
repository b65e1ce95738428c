use anyhow::Context;
use clap::Parser;

use camrtsp::config::Config;
use camrtsp::integration;

#[derive(Parser)]
#[command(
    name = "camrtsp",
    about = "Native RTSP server for streaming surveillance cameras"
)]
struct Args {
    /// Path to the configuration file
    #[arg(long, short, default_value = "camrtsp.toml")]
    config: String,

    /// Override the listen port from the configuration
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camrtsp=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => {
            tracing::info!(path = %args.config, "loaded configuration");
            config
        }
        Err(e) => {
            tracing::warn!(path = %args.config, error = %e, "using default configuration");
            Config::default()
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    if !config.server.enabled {
        tracing::info!("RTSP server disabled in configuration, exiting");
        return Ok(());
    }
    if config.cameras.is_empty() {
        tracing::warn!("no cameras configured; clients will get 404 for every mount");
    }

    let handle = integration::start(config)
        .await
        .context("failed to start RTSP server")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    handle.stop().await;
    Ok(())
}
