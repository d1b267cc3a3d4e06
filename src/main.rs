use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gantry::config::{self, ServerConfig};
use gantry::service::ServiceCore;
use gantry::ws;

const DEFAULT_PORT: u16 = 41071;
const CACHE_SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "gantry", version, about = "Content-addressed calculation service core")]
struct Cli {
    /// Path to the JSON config file; discovered through the platform
    /// config directories when omitted.
    #[arg(long)]
    config_file: Option<PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let path = match &cli.config_file {
        Some(path) => Some(path.clone()),
        None => config::find_config_file(),
    };
    match path {
        Some(path) => config::load_server_config(&path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(ServerConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let core = Arc::new(ServiceCore::new(config.service_config()));
    let _sweeper = core.spawn_cache_sweeper(CACHE_SWEEP_PERIOD);

    let host = if config.open { "0.0.0.0" } else { "127.0.0.1" };
    let port = config.port.unwrap_or(DEFAULT_PORT);
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("binding {host}:{port}"))?;
    tracing::info!(%host, port, "serving WebSocket clients");

    ws::serve(listener, core).await?;
    Ok(())
}
