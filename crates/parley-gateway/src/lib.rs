//! WebSocket transport for voice sessions.
//!
//! Each WebSocket connection carries one voice session: binary messages are
//! little-endian 16-bit PCM frames in both directions, text messages are JSON
//! (client commands inbound, session events outbound).

pub mod connection;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use server::{router, start_gateway};
pub use state::GatewayState;
