#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fluxlb_control::orchestrator::Orchestrator;
use fluxlb_control::load_from_path;

mod error;
use error::Result;

#[derive(Parser, Debug)]
#[command(author, version, about = "FluxLB control plane")]
struct Cli {
    /// Path to the proxy configuration TOML file.
    #[arg(short, long, value_name = "FILE", default_value = "fluxlb.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!(%err, "fluxlb exited with error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_from_path(&cli.config)?;
    info!(proxies = config.proxies.len(), "configuration loaded");

    let orchestrator = Orchestrator::new(config.settings);

    let mut interfaces = HashSet::new();
    for proxy in &config.proxies {
        for iface in &proxy.listen.interfaces {
            interfaces.insert(iface.clone());
        }
    }
    for iface in &interfaces {
        orchestrator.attach_interface(iface).await?;
    }

    for proxy in config.proxies {
        let name = proxy.name.clone();
        orchestrator.add_proxy(proxy).await?;
        info!(proxy = %name, "proxy registered");
    }

    info!("fluxlb running, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;

    info!("shutdown signal received, draining and tearing down");
    orchestrator.shutdown().await?;
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
