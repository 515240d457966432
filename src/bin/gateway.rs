use clap::Parser;
use dotenvy::dotenv;
use std::path::PathBuf;
use tracing::info;

use gateway_core::runtime::{initialize_logging, Gateway};
use gateway_core::GatewayConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a gateway.toml overriding the default config lookup
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address override
    #[arg(short, long)]
    bind: Option<String>,

    /// Port override
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    let args = Args::parse();

    let mut config = GatewayConfig::load_from_path(args.config.as_ref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    initialize_logging(&config);
    info!(
        workers = config.workers.len(),
        queue_capacity = config.queue.capacity,
        external = config.external.enabled,
        "starting inference gateway"
    );

    let gateway = Gateway::new(config)?;
    let runtime = gateway.start().await?;
    info!(addr = %runtime.local_addr(), "gateway listening");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    runtime.shutdown().await?;

    Ok(())
}
