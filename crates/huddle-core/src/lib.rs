//! Huddle Core - Shared types, signaling payloads and configuration
//!
//! This crate contains the foundational types used by the signal service and
//! the mesh client. It has no dependencies on networking code.

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ClientConfig, Config, DiscoveryMode, NetworkConfig, SignalConfig, MIN_RECONCILE_INTERVAL,
    MIN_SWEEP_INTERVAL,
};
pub use error::*;
pub use identity::{IdentityAllocator, IdentityClaimer, IdentityStrategy};
pub use protocol::*;
pub use types::*;

/// Room used when a client does not name one
pub const DEFAULT_ROOM: &str = "global";

/// Maximum room name length in bytes
pub const MAX_ROOM_NAME_LEN: usize = 64;
