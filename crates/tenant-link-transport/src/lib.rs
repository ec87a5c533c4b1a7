//! Transport layer for tenant event subscribers.
//!
//! Provides:
//! - Wire protocol (tagged JSON)
//! - WebSocket and status routes (feature: websocket)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use protocol::{ClientMessage, ServerMessage};
