#![forbid(unsafe_code)]
//! Network node for duochain

use clap::Parser;
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;

use duochain::config::{load_config_from, ConsensusMode, DEFAULT_CONFIG_PATH};
use duochain::node::Node;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Admission policy: pow or pos
    #[arg(long)]
    mode: Option<ConsensusMode>,

    /// Leading zero hex characters required of a mined hash
    #[arg(long)]
    difficulty: Option<u32>,

    #[arg(long)]
    p2p_port: Option<u16>,

    #[arg(long)]
    api_port: Option<u16>,

    /// Peer to dial at startup (repeatable), e.g. 127.0.0.1:9000
    #[arg(long = "peer")]
    peers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut config = load_config_from(&cli.config)?;
    if let Some(mode) = cli.mode {
        config.consensus.mode = mode;
    }
    if let Some(difficulty) = cli.difficulty {
        config.consensus.difficulty = difficulty;
    }
    if let Some(port) = cli.p2p_port {
        config.network.p2p_port = port;
    }
    if let Some(port) = cli.api_port {
        config.network.api_port = port;
    }
    config.network.bootstrap_peers.extend(cli.peers);

    let node = Arc::new(Node::init(config)?);

    println!("{}", "duochain node".bright_cyan().bold());
    println!(
        "  consensus {}  p2p {}  api {}",
        node.ledger.policy().name().bright_white(),
        node.config.network.p2p_port.to_string().bright_white(),
        node.config.network.api_port.to_string().bright_white()
    );

    node.start().await
}
