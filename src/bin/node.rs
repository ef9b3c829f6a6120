//! The `raftkv-node` binary: load a config file, start a node, and run
//! until interrupted.

use clap::Parser;

use raftkv::Config;
use raftkv::Node;

#[derive(Parser)]
#[command(name = "raftkv-node", about = "Run one member of a raftkv cluster")]
struct Args {
    /// Path to this node's TOML config file.
    #[arg(long, default_value = "raftkv.toml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = Config::from_file(&args.config)?;
    tracing::info!(node_id = config.node_id, addr = %config.raft_bind_addr, "starting node");

    let node = Node::start(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    node.shutdown().await?;
    Ok(())
}
