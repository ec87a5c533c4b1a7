//! Core traits for credential storage and the messaging protocol.

use std::{collections::BTreeMap, collections::HashMap, fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{KeyId, Payload, TenantId};

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Trait for credential storage backends.
///
/// Records are keyed by `(tenant, key)`. Implementations are responsible
/// for per-key atomicity; callers never lock around these methods.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read a record. A missing record is `Ok(None)`.
    async fn get(&self, tenant: &TenantId, key: &KeyId) -> Result<Option<Payload>, StorageError>;

    /// Insert or replace a record.
    async fn set(&self, tenant: &TenantId, key: &KeyId, payload: &Payload)
    -> Result<(), StorageError>;

    /// Delete a record. Deleting a missing record is a no-op.
    async fn delete(&self, tenant: &TenantId, key: &KeyId) -> Result<(), StorageError>;

    /// Delete every record of a tenant, returning how many were removed.
    async fn delete_tenant(&self, tenant: &TenantId) -> Result<u64, StorageError>;

    /// List the tenants holding a record under `key`.
    async fn tenants_with(&self, key: &KeyId) -> Result<Vec<TenantId>, StorageError>;
}

/// Batch of key writes across categories. `None` deletes the record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyUpdate {
    entries: BTreeMap<String, BTreeMap<String, Option<Payload>>>,
}

impl KeyUpdate {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write.
    #[must_use]
    pub fn set(mut self, category: &str, id: &str, payload: Payload) -> Self {
        self.entries
            .entry(category.to_owned())
            .or_default()
            .insert(id.to_owned(), Some(payload));
        self
    }

    /// Queue a delete.
    #[must_use]
    pub fn remove(mut self, category: &str, id: &str) -> Self {
        self.entries
            .entry(category.to_owned())
            .or_default()
            .insert(id.to_owned(), None);
        self
    }

    /// Number of records touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_records(self) -> impl Iterator<Item = (KeyId, Option<Payload>)> {
        self.entries.into_iter().flat_map(|(category, ids)| {
            ids.into_iter()
                .map(move |(id, payload)| (KeyId::new(&category, Some(id.as_str())), payload))
        })
    }
}

/// Tenant-scoped view of the credential store handed to the protocol layer.
#[derive(Clone)]
pub struct TenantKeys {
    store: Arc<dyn CredentialStore>,
    tenant: TenantId,
}

impl TenantKeys {
    /// Scope a store to one tenant.
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, tenant: TenantId) -> Self {
        Self { store, tenant }
    }

    /// The tenant this view is scoped to.
    #[must_use]
    pub const fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Fetch keys of one category. Missing or unreadable ids are omitted.
    pub async fn get(&self, category: &str, ids: &[String]) -> HashMap<String, Payload> {
        let lookups = ids.iter().map(|id| async move {
            let key = KeyId::new(category, Some(id.as_str()));
            match self.store.get(&self.tenant, &key).await {
                Ok(found) => found.map(|payload| (id.clone(), payload)),
                Err(e) => {
                    tracing::warn!(tenant = %self.tenant, key = %key, error = %e, "Key read failed, treating as absent");
                    None
                }
            }
        });

        futures::future::join_all(lookups)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Apply a batch of writes and deletes.
    ///
    /// Every record is attempted; the first failure is returned afterwards.
    ///
    /// # Errors
    /// Returns the first storage error encountered.
    pub async fn apply(&self, update: KeyUpdate) -> Result<(), StorageError> {
        let writes = update.into_records().map(|(key, payload)| async move {
            let result = match &payload {
                Some(payload) => self.store.set(&self.tenant, &key, payload).await,
                None => self.store.delete(&self.tenant, &key).await,
            };
            result.map_err(|e| {
                tracing::warn!(tenant = %self.tenant, key = %key, error = %e, "Key write failed");
                e
            })
        });

        futures::future::join_all(writes)
            .await
            .into_iter()
            .collect::<Result<Vec<()>, _>>()
            .map(drop)
    }
}

/// Why a protocol connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The device was unlinked from the phone. The only terminal reason.
    LoggedOut,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    BadSession,
    RestartRequired,
    MultideviceMismatch,
    Forbidden,
    UnavailableService,
    /// Status code without a known meaning.
    Other(u16),
    /// The protocol supplied no status code.
    Unknown,
}

impl DisconnectReason {
    /// Map a protocol close status code.
    #[must_use]
    pub const fn from_status_code(code: Option<u16>) -> Self {
        match code {
            Some(401) => Self::LoggedOut,
            Some(403) => Self::Forbidden,
            Some(408) => Self::ConnectionLost,
            Some(411) => Self::MultideviceMismatch,
            Some(428) => Self::ConnectionClosed,
            Some(440) => Self::ConnectionReplaced,
            Some(500) => Self::BadSession,
            Some(503) => Self::UnavailableService,
            Some(515) => Self::RestartRequired,
            Some(other) => Self::Other(other),
            None => Self::Unknown,
        }
    }

    /// Whether the remote side revoked the session. No reconnect follows.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::LoggedOut => "logged_out",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionLost => "connection_lost",
            Self::ConnectionReplaced => "connection_replaced",
            Self::BadSession => "bad_session",
            Self::RestartRequired => "restart_required",
            Self::MultideviceMismatch => "multidevice_mismatch",
            Self::Forbidden => "forbidden",
            Self::UnavailableService => "unavailable_service",
            Self::Other(code) => return write!(f, "status_{code}"),
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Event emitted by a live protocol connection.
#[derive(Debug)]
pub enum ProtocolEvent {
    /// A new pairing code is available.
    PairingCode(String),
    /// Handshake finished; the connection is usable.
    Open,
    /// The full credential set changed. Must be persisted before `ack` fires.
    CredentialsUpdated {
        creds: Payload,
        ack: oneshot::Sender<()>,
    },
    /// Signal keys changed. Must be persisted before `ack` fires.
    KeysUpdated {
        update: KeyUpdate,
        ack: oneshot::Sender<()>,
    },
    /// The connection closed.
    Closed(DisconnectReason),
}

/// Protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Connection is not open")]
    NotConnected,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifier of a sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceipt {
    pub id: String,
}

/// Document attachment ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingDocument {
    pub path: PathBuf,
    pub file_name: String,
    pub mimetype: String,
    pub caption: Option<String>,
}

/// Credential material handed to the protocol on connect.
pub struct AuthState {
    /// Primary credential set, restored or freshly generated.
    pub creds: Payload,
    /// Whether `creds` came from the store.
    pub restored: bool,
    /// Lazily loaded signal keys.
    pub keys: TenantKeys,
}

/// A freshly opened protocol connection.
pub struct Connection {
    /// Handle used to send and tear down.
    pub handle: Arc<dyn ConnectionHandle>,
    /// Lifecycle events in protocol order.
    pub events: mpsc::Receiver<ProtocolEvent>,
}

/// Live connection handle.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Send a text message to a protocol address.
    async fn send_text(&self, to: &str, text: &str) -> Result<MessageReceipt, ProtocolError>;

    /// Send a document to a protocol address.
    async fn send_document(
        &self,
        to: &str,
        document: OutgoingDocument,
    ) -> Result<MessageReceipt, ProtocolError>;

    /// Unlink this device from the account.
    async fn logout(&self) -> Result<(), ProtocolError>;

    /// Close the transport without unlinking.
    async fn close(&self);
}

/// Trait for messaging protocol clients.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Generate a credential set for a device that was never paired.
    fn fresh_credentials(&self) -> Payload;

    /// Open a connection for a tenant.
    async fn connect(&self, tenant: &TenantId, auth: AuthState)
    -> Result<Connection, ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_logged_out_is_terminal() {
        for code in [403, 408, 411, 428, 440, 500, 503, 515, 999] {
            assert!(!DisconnectReason::from_status_code(Some(code)).is_terminal());
        }
        assert!(!DisconnectReason::from_status_code(None).is_terminal());
        assert!(DisconnectReason::from_status_code(Some(401)).is_terminal());
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(DisconnectReason::LoggedOut.to_string(), "logged_out");
        assert_eq!(DisconnectReason::Other(499).to_string(), "status_499");
    }

    #[test]
    fn test_key_update_flattens_to_composed_keys() {
        let update = KeyUpdate::new()
            .set("pre-key", "1", Payload::bytes(vec![1]))
            .remove("pre-key", "2")
            .set("session", "628.0", Payload::Null);
        assert_eq!(update.len(), 3);

        let keys: Vec<_> = update
            .into_records()
            .map(|(key, payload)| (key.to_string(), payload.is_some()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("pre-key-1".to_owned(), true),
                ("pre-key-2".to_owned(), false),
                ("session-628.0".to_owned(), true),
            ]
        );
    }
}
