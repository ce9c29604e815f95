//! Huddle Signal Server
//!
//! Presence, identity claims and signal relay over HTTP and WebSocket.
//!
//! # Usage
//!
//! ```bash
//! huddle-signal --port 3000
//!
//! # Shorter idle window, explicit config file
//! huddle-signal --staleness 30 --config ./huddle.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use huddle_core::Config;
use huddle_signal::SignalServer;

#[derive(Parser, Debug)]
#[command(name = "huddle-signal")]
#[command(about = "Huddle signal service for room presence and signal relay")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Room idle window in seconds
    #[arg(long)]
    staleness: Option<u64>,

    /// Sweep interval in seconds
    #[arg(long)]
    sweep_interval: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    let mut signal = config.signal;

    if let Some(port) = args.port {
        signal.port = port;
    }
    if let Some(bind) = &args.bind {
        signal.bind = bind.parse()?;
    }
    if let Some(secs) = args.staleness {
        signal.staleness_secs = secs;
    }
    if let Some(secs) = args.sweep_interval {
        signal.sweep_interval_secs = secs;
    }

    let addr = SocketAddr::new(signal.bind, signal.port);

    info!("Starting Huddle Signal Server");
    info!(
        "Rooms expire after {}s idle, swept every {}s",
        signal.staleness_secs, signal.sweep_interval_secs
    );

    let server = SignalServer::new(signal);
    server.serve(addr).await?;

    Ok(())
}
