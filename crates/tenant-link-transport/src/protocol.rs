//! Wire protocol for event subscribers.

use serde::{Deserialize, Serialize};
use tenant_link_core::{LifecycleEvent, TenantId};
use tenant_link_session::{SessionStatus, StatusSnapshot};

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask for the tenant's current status.
    Status,
    /// Ping for keepalive.
    Ping,
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Current session status.
    Status {
        tenant_id: TenantId,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pairing_code: Option<String>,
    },
    /// Lifecycle event of the tenant.
    Event {
        tenant_id: TenantId,
        event: LifecycleEvent,
    },
    /// Events were dropped because the client fell behind.
    Lagged { skipped: u64 },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    /// Status message from a registry snapshot.
    #[must_use]
    pub fn status(tenant_id: &TenantId, snapshot: StatusSnapshot) -> Self {
        Self::Status {
            tenant_id: tenant_id.clone(),
            status: snapshot.status,
            pairing_code: snapshot.pairing_code,
        }
    }

    /// Event message for a tenant.
    #[must_use]
    pub fn event(tenant_id: &TenantId, event: LifecycleEvent) -> Self {
        Self::Event {
            tenant_id: tenant_id.clone(),
            event,
        }
    }
}
