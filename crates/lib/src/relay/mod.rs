//! Multi-role session relay: chatbot and portal clients over one WebSocket endpoint,
//! plus the portal's HTTP API.

pub mod api;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod server;

pub use hub::{Relay, RelaySettings};
pub use protocol::{ClientEvent, ClientRole, ImagePayload, ServerEvent};
pub use server::{build_relay, router, run_relay, serve, RelayState};
