//! Core abstractions for multi-tenant messaging sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `TenantId` / `KeyId` - Tenant and credential record identifiers
//! - `Payload` - Binary-safe credential payload with a tagged JSON encoding
//! - `LifecycleEvent` - Events published to per-tenant subscribers
//! - `EventBroadcaster` - Per-tenant fan-out of lifecycle events
//! - Credential store and protocol connector traits

pub mod broadcaster;
pub mod codec;
pub mod event;
pub mod tenant;
pub mod traits;

pub use broadcaster::EventBroadcaster;
pub use codec::Payload;
pub use event::LifecycleEvent;
pub use tenant::{KeyId, TenantId};
pub use traits::{
    AuthState, Connection, ConnectionHandle, Connector, CredentialStore, DisconnectReason,
    KeyUpdate, MessageReceipt, OutgoingDocument, ProtocolError, ProtocolEvent, StorageError,
    TenantKeys,
};
