//! Huddle CLI - Signal service and client tools
//!
//! Usage:
//!   huddle serve                      Run the signal service
//!   huddle roster <room>              List participants in a room
//!   huddle announce <room> [id]       Mark an identity present in a room
//!   huddle health                     Check a signal service
//!   huddle demo [room]                Run loopback participants through a service
//!   huddle config                     Print a sample config

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use huddle_core::{Config, DiscoveryMode, IdentityStrategy, ParticipantId, RoomName};
use huddle_mesh::{transport_for, CallSession, LoopbackEngine, LoopbackNetwork, MeshEvent, SignalClient};
use huddle_signal::SignalServer;

#[derive(Parser)]
#[command(name = "huddle")]
#[command(about = "Small mesh calls: signal service and client tools", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Signal service URL (overrides config)
    #[arg(short, long, global = true, env = "HUDDLE_SERVER")]
    server: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signal service
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// List the participants of a room
    Roster {
        /// Room name
        room: String,
    },

    /// Mark an identity present in a room (expires like any other)
    Announce {
        /// Room name
        room: String,

        /// Participant ID (default: a fresh opaque ID)
        id: Option<String>,
    },

    /// Check that a signal service is up
    Health,

    /// Join loopback participants to a room and report what they see
    ///
    /// Without --server an in-process signal service is started on an
    /// ephemeral port.
    Demo {
        /// Room name
        #[arg(default_value = "demo")]
        room: String,

        /// Number of participants
        #[arg(short = 'n', long, default_value = "3")]
        peers: usize,

        /// Use WebSocket push discovery
        #[arg(long)]
        push: bool,

        /// Use slot identities (<room>-1, <room>-2, ...)
        #[arg(long)]
        slots: bool,

        /// Seconds to stay in the room
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },

    /// Print a sample config, or the config path
    Config {
        /// Print the default config path instead
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load(),
    };
    let external_server = cli.server.is_some();
    if let Some(server) = cli.server {
        config.client.server_url = server;
    }

    match cli.command {
        Commands::Serve { port, bind } => run_serve(config, port, bind).await,
        Commands::Roster { room } => run_roster(config, &room).await,
        Commands::Announce { room, id } => run_announce(config, &room, id).await,
        Commands::Health => run_health(config).await,
        Commands::Demo {
            room,
            peers,
            push,
            slots,
            duration,
        } => {
            let mut demo = config;
            if push {
                demo.client.discovery = DiscoveryMode::Push;
            }
            if slots {
                demo.client.identity = IdentityStrategy::Slot;
            }
            run_demo(demo, external_server, &room, peers, Duration::from_secs(duration)).await
        }
        Commands::Config { path } => {
            if path {
                match Config::default_path() {
                    Some(path) => println!("{}", path.display()),
                    None => anyhow::bail!("no config directory on this platform"),
                }
            } else {
                print!("{}", Config::sample());
            }
            Ok(())
        }
    }
}

async fn run_serve(config: Config, port: Option<u16>, bind: Option<String>) -> anyhow::Result<()> {
    let mut signal_config = config.signal;
    if let Some(port) = port {
        signal_config.port = port;
    }
    if let Some(bind) = bind {
        signal_config.bind = bind.parse().context("invalid bind address")?;
    }

    let addr = SocketAddr::new(signal_config.bind, signal_config.port);
    info!("Starting Huddle signal service on {}", addr);
    let server = SignalServer::new(signal_config);

    tokio::select! {
        result = server.serve(addr) => {
            if let Err(e) = result {
                error!("Signal service error: {}", e);
                return Err(e.into());
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }
    Ok(())
}

async fn run_roster(config: Config, room: &str) -> anyhow::Result<()> {
    let room = RoomName::parse(room)?;
    let client = SignalClient::new(&config.client.server_url, &config.network)?;
    let participants = client.list(&room).await?;

    if participants.is_empty() {
        println!("Room {} is empty", room);
    }
    for id in participants {
        println!("{}", id);
    }
    Ok(())
}

async fn run_announce(config: Config, room: &str, id: Option<String>) -> anyhow::Result<()> {
    let room = RoomName::parse(room)?;
    let id = match id {
        Some(id) => ParticipantId::new(id),
        None => ParticipantId::generate()?,
    };
    let client = SignalClient::new(&config.client.server_url, &config.network)?;
    client.announce(&id, &room).await?;
    println!("{} present in {}", id, room);
    Ok(())
}

async fn run_health(config: Config) -> anyhow::Result<()> {
    let client = SignalClient::new(&config.client.server_url, &config.network)?;
    let health = client.health().await?;
    println!(
        "{}: {} ({} rooms, {} participants)",
        client.base(),
        health.status,
        health.rooms,
        health.participants
    );
    Ok(())
}

async fn run_demo(
    mut config: Config,
    external_server: bool,
    room: &str,
    peers: usize,
    duration: Duration,
) -> anyhow::Result<()> {
    let room = RoomName::parse(room)?;

    let server_task = if external_server {
        None
    } else {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        config.client.server_url = format!("http://{}", addr);
        info!("In-process signal service on {}", addr);

        let server = SignalServer::new(config.signal.clone());
        Some(tokio::spawn(async move { server.serve_on(listener).await }))
    };

    let network = LoopbackNetwork::new();
    let mut sessions = Vec::with_capacity(peers);
    for _ in 0..peers {
        let transport = transport_for(&config.client, &config.network)?;
        let engine = Arc::new(LoopbackEngine::new(Arc::clone(&network)));
        let session = CallSession::join(&config.client, room.clone(), engine, transport)
            .await
            .context("failed to join")?;
        watch_events(&session);
        sessions.push(session);
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = signal::ctrl_c() => info!("Interrupted"),
    }

    for session in &sessions {
        let streams: Vec<_> = session
            .remote_streams()
            .into_iter()
            .map(|stream| stream.peer.to_string())
            .collect();
        println!(
            "{} sees {} of {}: {}",
            session.local_id(),
            streams.len(),
            peers.saturating_sub(1),
            streams.join(", ")
        );
    }

    for session in &sessions {
        if let Err(e) = session.leave().await {
            warn!("{} failed to leave: {}", session.local_id(), e);
        }
    }

    if let Some(task) = server_task {
        task.abort();
    }
    Ok(())
}

fn watch_events(session: &CallSession) {
    let mut events = session.subscribe();
    let local = session.local_id().clone();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(MeshEvent::StreamAdded(stream)) => {
                    info!("[{}] stream from {}", local.short(), stream.peer)
                }
                Ok(MeshEvent::StreamRemoved(peer)) => {
                    info!("[{}] stream from {} gone", local.short(), peer)
                }
                Ok(MeshEvent::PeerState { peer, state }) => {
                    debug!("[{}] {} is {:?}", local.short(), peer, state)
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("[{}] missed {} events", local.short(), missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
