//! timegrain server binary

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use timegrain::api;
use timegrain::config::NodeConfig;
use timegrain::guardian::NodeGuardian;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "timegraind", about = "timegrain database node")]
struct Args {
    /// Node identifier in the cluster view
    #[arg(long)]
    node_id: Option<String>,

    /// HTTP bind address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Filesystem root for persisted state
    #[arg(long)]
    base_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> timegrain::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .with_target(true)
        .init();

    let mut config = NodeConfig::from_env()?;
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if let Some(http_addr) = args.http_addr {
        config.http_addr = http_addr;
    }
    if let Some(base_path) = args.base_path {
        config.base_path = base_path;
    }

    info!(
        node_id = %config.node_id,
        base_path = %config.base_path.display(),
        "starting timegrain node"
    );

    let addr = config.http_addr;
    let guardian = NodeGuardian::start(config);
    api::serve(guardian, addr).await
}
