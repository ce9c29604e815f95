//! Huddle Mesh - Client side of a small mesh call
//!
//! This crate provides:
//! - Discovery transports: HTTP polling, WebSocket push, and in-process
//! - The mesh orchestrator that keeps one media link per remote participant
//! - Call sessions tying media capture, identity and discovery together
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       CallSession                          │
//! │  capture → allocate identity → connect discovery           │
//! └─────────────────────────────┬──────────────────────────────┘
//!                               │ spawns
//!                               ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │                 Driver task (single owner)                 │
//! │  tick ─────────▶ transport.tick + reconcile                │
//! │  discovery ────▶ roster / joined / left / relayed signals  │
//! │  link events ──▶ candidates, remote streams, closures      │
//! └─────────────────────────────┬──────────────────────────────┘
//!                               │ owns
//!                               ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │  MeshOrchestrator ── ConnectionRecord per remote ── PeerLink│
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The media stack itself is behind [`MediaEngine`]; [`LoopbackEngine`]
//! wires links together in-process.

pub mod client;
pub mod connection;
pub mod discovery;
pub mod loopback;
pub mod media;
pub mod memory;
pub mod orchestrator;
pub mod poll;
pub mod push;
pub mod session;

use std::sync::Arc;

use huddle_core::{ClientConfig, DiscoveryMode, HuddleError, NetworkConfig};

pub use client::SignalClient;
pub use connection::{ConnectionRecord, PeerState, Role, MAX_PENDING_CANDIDATES};
pub use discovery::{DiscoveryEvent, DiscoveryEvents, DiscoveryTransport, TransportClaimer};
pub use loopback::{LoopbackEngine, LoopbackNetwork};
pub use media::{LinkEvent, LinkEvents, LocalMedia, MediaEngine, PeerLink, PeerLinkEvent, RemoteStream};
pub use memory::{MemoryHub, MemoryTransport};
pub use orchestrator::{DiscoverySource, MeshEvent, MeshOrchestrator, MeshSettings};
pub use poll::PollTransport;
pub use push::PushTransport;
pub use session::CallSession;

/// Build the discovery transport `config` asks for
pub fn transport_for(
    config: &ClientConfig,
    network: &NetworkConfig,
) -> Result<Arc<dyn DiscoveryTransport>, HuddleError> {
    let client = SignalClient::new(&config.server_url, network)?;
    let transport: Arc<dyn DiscoveryTransport> = match config.discovery {
        DiscoveryMode::Poll => Arc::new(PollTransport::new(client)),
        DiscoveryMode::Push => Arc::new(PushTransport::new(client, network.connect_timeout())),
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_for_rejects_bad_url() {
        let config = ClientConfig {
            server_url: "::nope".into(),
            ..ClientConfig::default()
        };
        assert!(transport_for(&config, &NetworkConfig::default()).is_err());
    }

    #[test]
    fn test_transport_for_both_modes() {
        for discovery in [DiscoveryMode::Poll, DiscoveryMode::Push] {
            let config = ClientConfig {
                discovery,
                ..ClientConfig::default()
            };
            assert!(transport_for(&config, &NetworkConfig::default()).is_ok());
        }
    }
}
