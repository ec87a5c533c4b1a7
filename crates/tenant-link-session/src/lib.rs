//! Per-tenant messaging sessions.
//!
//! Provides:
//! - `SessionManager` - Initialize, query, send through and log out tenants
//! - `Supervisor` - One supervision task per tenant connection
//! - `MessageDispatcher` - Outbound text and documents
//! - Credential storage implementations (memory, SQLite)

pub mod config;
pub mod dispatcher;
pub mod guard;
pub mod manager;
pub mod phone;
pub mod registry;
pub mod storage;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, ManagerConfig};
pub use dispatcher::{DispatchError, MessageDispatcher};
pub use manager::SessionManager;
pub use phone::PhoneFormat;
pub use registry::{SessionRegistry, SessionStatus, StatusSnapshot};
pub use supervisor::{InitOutcome, Supervisor, SupervisorError};
