use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use basalt_chain::api;
use basalt_chain::config::NodeConfig;
use basalt_chain::crypto::{address_of, generate_keypair, save_keypair};
use basalt_chain::node::Node;

#[derive(Parser)]
#[command(author, version, about = "basalt-chain proof-of-stake node")]
struct Cli {
    /// Path to the node configuration file
    #[arg(short, long, global = true, default_value = "config/node.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node and its peer API
    Start,
    /// Write a default configuration file
    GenerateConfig,
    /// Create a fresh node keypair at the configured key path
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Start => start(cli.config).await,
        Command::GenerateConfig => generate_config(cli.config),
        Command::Keygen => keygen(cli.config),
    }
}

async fn start(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let api_addr = config.rpc_listen;
    let node = Node::new(config)?;
    let handle = node.handle();

    // Poll the node loop, the API server and the shutdown signal in one
    // place; whichever finishes first ends the process.
    tokio::select! {
        outcome = node.start() => outcome.context("node loop stopped")?,
        outcome = api::serve(handle, api_addr) => outcome.context("api server stopped")?,
        _ = signal::ctrl_c() => info!("shutdown signal received"),
    }
    Ok(())
}

fn load_config(path: &PathBuf) -> Result<NodeConfig> {
    if path.exists() {
        return NodeConfig::load(path).with_context(|| format!("loading {}", path.display()));
    }
    info!(path = %path.display(), "no configuration found, writing defaults");
    let config = NodeConfig::default();
    config.save(path)?;
    Ok(config)
}

fn generate_config(path: PathBuf) -> Result<()> {
    if path.exists() {
        bail!("refusing to overwrite existing configuration at {}", path.display());
    }
    let config = NodeConfig::default();
    config.save(&path)?;
    config.ensure_directories()?;
    info!(path = %path.display(), "wrote default configuration");
    Ok(())
}

fn keygen(config_path: PathBuf) -> Result<()> {
    let key_path = if config_path.exists() {
        NodeConfig::load(&config_path)?.key_path
    } else {
        NodeConfig::default().key_path
    };
    if key_path.exists() {
        bail!("a keypair already exists at {}", key_path.display());
    }
    let keypair = generate_keypair();
    save_keypair(&key_path, &keypair)?;
    info!(
        path = %key_path.display(),
        address = %address_of(&keypair),
        "generated node keypair"
    );
    Ok(())
}
