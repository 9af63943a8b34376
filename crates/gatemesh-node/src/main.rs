//! gatemesh-node: one node of the gate mesh.
//!
//! Connects to its configured peers over persistent framed-TCP links,
//! mirrors their gates, and carries teleport reservations, chat, and API
//! calls across the federation.

mod api;
mod config;
mod economy;
mod gate;
#[cfg(test)]
mod mesh_test;
mod net;
mod node;
mod options;
mod permissions;
mod registry;
mod relay;
mod reservation;
mod server;
mod world;

use clap::Parser;
use config::ConfigFile;
use node::Node;
use std::path::PathBuf;
use tracing::{error, info};

/// gatemesh-node — game-server gate federation daemon
#[derive(Parser, Debug)]
#[command(name = "gatemesh-node", version, about = "Gate mesh node")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "gatemesh.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print a fresh shared key for a server entry and exit
    #[arg(long)]
    generate_key: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if cli.generate_key {
        println!("{}", gatemesh_core::secret::generate_key());
        return;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "starting gatemesh-node"
    );

    let config = match ConfigFile::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let node = match Node::new(&config) {
        Ok(n) => n,
        Err(e) => {
            error!(error = %e, "failed to build node");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                error!(error = %e, "node error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("gatemesh-node stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
