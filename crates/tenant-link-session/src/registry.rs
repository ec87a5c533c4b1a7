//! In-memory registry of live tenant sessions.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tenant_link_core::{ConnectionHandle, TenantId};

/// Session status as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Handshake in progress.
    Connecting,
    /// Waiting for the user to pair the device.
    AwaitingPairing,
    /// Connected and able to send.
    Ready,
    /// No live session.
    Disconnected,
}

/// Point-in-time view of a tenant's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: SessionStatus,
    pub pairing_code: Option<String>,
}

impl StatusSnapshot {
    /// Snapshot for a tenant without a live session.
    #[must_use]
    pub const fn disconnected() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            pairing_code: None,
        }
    }
}

/// Live session state for one tenant.
#[derive(Clone)]
pub struct SessionEntry {
    /// Connection this entry belongs to.
    pub generation: u64,
    pub status: SessionStatus,
    pub pairing_code: Option<String>,
    pub handle: Option<Arc<dyn ConnectionHandle>>,
    /// Unix seconds when the connection became ready.
    pub connected_at: Option<i64>,
    pub updated_at: i64,
}

impl fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEntry")
            .field("generation", &self.generation)
            .field("status", &self.status)
            .field("pairing_code", &self.pairing_code)
            .field("has_handle", &self.handle.is_some())
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

impl SessionEntry {
    /// New entry in the connecting state.
    #[must_use]
    pub fn connecting(generation: u64) -> Self {
        Self {
            generation,
            status: SessionStatus::Connecting,
            pairing_code: None,
            handle: None,
            connected_at: None,
            updated_at: now(),
        }
    }
}

pub(crate) fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Map from tenant to live session.
///
/// The only structure callers read directly for status polling. Reads take
/// a short shared lock and never wait on protocol work.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<TenantId, SessionEntry>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status; unknown tenants are disconnected.
    #[must_use]
    pub fn status(&self, tenant: &TenantId) -> StatusSnapshot {
        self.read(tenant, |entry| StatusSnapshot {
            status: entry.status,
            pairing_code: entry.pairing_code.clone(),
        })
        .unwrap_or_else(StatusSnapshot::disconnected)
    }

    /// Clone of a tenant's entry.
    #[must_use]
    pub fn get(&self, tenant: &TenantId) -> Option<SessionEntry> {
        self.read(tenant, SessionEntry::clone)
    }

    /// Insert or replace a tenant's entry.
    pub fn upsert(&self, tenant: TenantId, entry: SessionEntry) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant, entry);
    }

    /// Mutate the entry only if it still belongs to `generation`.
    ///
    /// Returns whether the entry was updated.
    pub fn transition<F>(&self, tenant: &TenantId, generation: u64, f: F) -> bool
    where
        F: FnOnce(&mut SessionEntry),
    {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(tenant) {
            Some(entry) if entry.generation == generation => {
                f(entry);
                entry.updated_at = now();
                true
            }
            _ => false,
        }
    }

    /// Remove a tenant's entry.
    pub fn remove(&self, tenant: &TenantId) -> Option<SessionEntry> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tenant)
    }

    /// Remove the entry only if it still belongs to `generation`.
    pub fn remove_generation(&self, tenant: &TenantId, generation: u64) -> Option<SessionEntry> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.get(tenant)?.generation == generation {
            sessions.remove(tenant)
        } else {
            None
        }
    }

    /// Tenants with a registry entry.
    #[must_use]
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        tenants.sort();
        tenants
    }

    fn read<T>(&self, tenant: &TenantId, f: impl FnOnce(&SessionEntry) -> T) -> Option<T> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .map(f)
    }
}
