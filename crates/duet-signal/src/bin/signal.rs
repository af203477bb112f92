//! Duet Signal Server
//!
//! Rendezvous service for duet peers.
//!
//! # Usage
//!
//! ```bash
//! duet-signal --port 8080
//!
//! # With room settings from a config file
//! duet-signal --config /etc/duet/config.toml
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use duet_core::Config;
use duet_signal::SignalServer;

#[derive(Parser, Debug)]
#[command(name = "duet-signal")]
#[command(about = "Duet rendezvous server for room matching")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Config file path (defaults to the per-user config)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?.signal,
        None => Config::load().signal,
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let addr = SocketAddr::new(config.bind, config.port);

    info!("Starting Duet Signal Server");
    info!(
        "Room TTL {:?}, join wait {:?}, {} hub key(s)",
        config.room_ttl(),
        config.join_wait(),
        config.hub_keys.len()
    );

    let server = SignalServer::new(config);
    server.serve(addr).await?;

    Ok(())
}
