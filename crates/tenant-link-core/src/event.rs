//! Lifecycle events published to per-tenant subscribers.

use serde::{Deserialize, Serialize};

/// Connection lifecycle event for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LifecycleEvent {
    /// A pairing code is waiting to be scanned or entered on the phone.
    PairingCode { code: String },
    /// The connection is open and messages can be sent.
    Ready,
    /// The connection went away.
    Disconnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Initialization or protocol error.
    Error { message: String },
}

impl LifecycleEvent {
    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PairingCode { .. } => "pairing-code",
            Self::Ready => "ready",
            Self::Disconnected { .. } => "disconnected",
            Self::Error { .. } => "error",
        }
    }

    /// Create a pairing-code event.
    #[must_use]
    pub fn pairing_code(code: impl Into<String>) -> Self {
        Self::PairingCode { code: code.into() }
    }

    /// Create a disconnected event.
    #[must_use]
    pub fn disconnected(reason: Option<String>) -> Self {
        Self::Disconnected { reason }
    }

    /// Create an error event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
