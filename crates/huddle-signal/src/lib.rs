//! Huddle Signal Service
//!
//! Room presence, identity claims and signal relay for small mesh calls.
//! Media never passes through here; peers exchange offers, answers and
//! candidates through the relay and then talk directly.
//!
//! # Protocol
//!
//! 1. A client claims or mints an identity in a room
//! 2. It announces itself (poll) or joins over a WebSocket (push)
//! 3. It learns the other members and sends each an offer via the relay
//! 4. Liveness is refreshed by announce, poll or ping; idle rooms expire

pub mod messages;
pub mod registry;
pub mod relay;
pub mod room;
pub mod server;

pub use messages::{ClientEvent, RelayedSignal, ServerEvent};
pub use registry::PresenceRegistry;
pub use relay::{Delivery, SignalRelay};
pub use room::Room;
pub use server::{ApiError, SignalServer};
