//! Per-tenant connection supervision.
//!
//! Each tenant connection is driven by its own task, which drains the
//! protocol's event channel in order. Tenants never share a task, so one
//! tenant's churn cannot stall another. The task is the only writer of its
//! tenant's registry entry; entries carry a generation so that events from
//! a superseded connection are ignored.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tenant_link_core::{
    AuthState, Connection, ConnectionHandle, Connector, CredentialStore, DisconnectReason,
    EventBroadcaster, KeyId, LifecycleEvent, ProtocolError, ProtocolEvent, StorageError,
    TenantId, TenantKeys,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    ManagerConfig,
    guard::InitializationGuard,
    registry::{SessionEntry, SessionRegistry, SessionStatus, now},
};

/// Supervisor error.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Handshake failed for tenant {tenant}: {source}")]
    Handshake {
        tenant: TenantId,
        #[source]
        source: ProtocolError,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result of an initialization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitOutcome {
    /// A new connection was opened.
    Started,
    /// The tenant is already connected.
    AlreadyReady,
    /// Another initialization or handshake for the tenant is under way.
    InProgress,
    /// The tenant was logged out while the handshake ran. The new
    /// connection was closed.
    Superseded,
}

/// Registry entry of a handshake in flight.
///
/// Removed again on drop unless a connection was attached, so an abandoned
/// `initialize` never leaves the tenant connecting.
struct ConnectingEntry<'a> {
    registry: &'a SessionRegistry,
    tenant: TenantId,
    generation: u64,
    attached: bool,
}

impl<'a> ConnectingEntry<'a> {
    fn insert(registry: &'a SessionRegistry, tenant: &TenantId, generation: u64) -> Self {
        registry.upsert(tenant.clone(), SessionEntry::connecting(generation));
        Self {
            registry,
            tenant: tenant.clone(),
            generation,
            attached: false,
        }
    }

    /// Hand the connection to the entry. False if the entry is gone.
    fn attach(&mut self, handle: &Arc<dyn ConnectionHandle>) -> bool {
        self.attached = self.registry.transition(&self.tenant, self.generation, |entry| {
            entry.handle = Some(Arc::clone(handle));
        });
        self.attached
    }
}

impl Drop for ConnectingEntry<'_> {
    fn drop(&mut self) {
        if !self.attached
            && self
                .registry
                .remove_generation(&self.tenant, self.generation)
                .is_some()
        {
            tracing::debug!(tenant = %self.tenant, generation = self.generation, "Cleared unfinished handshake");
        }
    }
}

/// Delayed reconnect of one tenant.
struct PendingReconnect {
    seq: u64,
    task: JoinHandle<()>,
}

/// Running supervision task of one tenant.
struct TenantUnit {
    generation: u64,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns every tenant's connection lifecycle.
pub struct Supervisor {
    store: Arc<dyn CredentialStore>,
    connector: Arc<dyn Connector>,
    registry: Arc<SessionRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    guard: InitializationGuard,
    units: Mutex<HashMap<TenantId, TenantUnit>>,
    reconnects: Mutex<HashMap<TenantId, PendingReconnect>>,
    generations: AtomicU64,
    reconnect_delay: Duration,
    startup_stagger: Duration,
}

impl Supervisor {
    /// Create a supervisor.
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
        registry: Arc<SessionRegistry>,
        broadcaster: Arc<EventBroadcaster>,
        config: &ManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            connector,
            registry,
            broadcaster,
            guard: InitializationGuard::new(),
            units: Mutex::new(HashMap::new()),
            reconnects: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(1),
            reconnect_delay: config.reconnect_delay(),
            startup_stagger: config.startup_stagger(),
        })
    }

    /// Start a tenant's session.
    ///
    /// Idempotent: a tenant that is mid-initialization, mid-handshake or
    /// already ready is left alone. Dropping the returned future before it
    /// completes leaves the tenant disconnected, never stuck connecting.
    ///
    /// # Errors
    /// Returns error if the protocol handshake fails. No reconnect follows.
    pub async fn initialize(
        self: &Arc<Self>,
        tenant: &TenantId,
    ) -> Result<InitOutcome, SupervisorError> {
        self.initialize_with(tenant, None).await
    }

    /// Initialize on behalf of the reconnect numbered `reconnect`, whose
    /// slot is released once the new connection is registered.
    async fn initialize_with(
        self: &Arc<Self>,
        tenant: &TenantId,
        reconnect: Option<u64>,
    ) -> Result<InitOutcome, SupervisorError> {
        let Some(_ticket) = self.guard.try_acquire(tenant) else {
            tracing::debug!(tenant = %tenant, "Initialization already in flight");
            return Ok(InitOutcome::InProgress);
        };

        if let Some(entry) = self.registry.get(tenant) {
            match entry.status {
                SessionStatus::Ready => return Ok(InitOutcome::AlreadyReady),
                SessionStatus::Connecting | SessionStatus::AwaitingPairing => {
                    tracing::debug!(tenant = %tenant, status = ?entry.status, "Handshake already under way");
                    return Ok(InitOutcome::InProgress);
                }
                SessionStatus::Disconnected => {}
            }
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let mut pending = ConnectingEntry::insert(&self.registry, tenant, generation);

        let (creds, restored) = match self.store.get(tenant, &KeyId::creds()).await {
            Ok(Some(creds)) => (creds, true),
            Ok(None) => (self.connector.fresh_credentials(), false),
            Err(e) => {
                tracing::warn!(tenant = %tenant, error = %e, "Failed to load credentials, starting fresh");
                (self.connector.fresh_credentials(), false)
            }
        };

        tracing::info!(tenant = %tenant, restored, generation, "Opening connection");
        let auth = AuthState {
            creds,
            restored,
            keys: TenantKeys::new(Arc::clone(&self.store), tenant.clone()),
        };

        let Connection { handle, events } = match self.connector.connect(tenant, auth).await {
            Ok(connection) => connection,
            Err(source) => {
                tracing::error!(tenant = %tenant, error = %source, "Handshake failed");
                drop(pending);
                self.broadcaster
                    .publish(tenant, LifecycleEvent::error(source.to_string()));
                return Err(SupervisorError::Handshake {
                    tenant: tenant.clone(),
                    source,
                });
            }
        };

        // Attaching and registering the unit happen under the units lock, so
        // a concurrent logout either removes the entry first or finds the unit.
        let attached = {
            let mut units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
            let attached = pending.attach(&handle);
            if attached {
                if let Some(seq) = reconnect {
                    self.release_reconnect(tenant, seq);
                }
                self.spawn_unit(&mut units, tenant.clone(), generation, events);
            }
            attached
        };

        if attached {
            Ok(InitOutcome::Started)
        } else {
            tracing::info!(tenant = %tenant, generation, "Session torn down during handshake, closing connection");
            handle.close().await;
            Ok(InitOutcome::Superseded)
        }
    }

    fn spawn_unit(
        self: &Arc<Self>,
        units: &mut HashMap<TenantId, TenantUnit>,
        tenant: TenantId,
        generation: u64,
        events: mpsc::Receiver<ProtocolEvent>,
    ) {
        let (stop_tx, stop_rx) = oneshot::channel();

        // The caller holds the units lock, so the task cannot deregister before it is registered.
        let this = Arc::clone(self);
        let unit_tenant = tenant.clone();
        let task = tokio::spawn(async move {
            this.run_unit(unit_tenant, generation, events, stop_rx).await;
        });

        let previous = units.insert(
            tenant.clone(),
            TenantUnit {
                generation,
                stop_tx,
                task,
            },
        );
        if let Some(previous) = previous {
            if previous.stop_tx.send(()).is_err() {
                tracing::debug!(tenant = %tenant, generation = previous.generation, "Replaced unit had already stopped");
            }
        }
    }

    async fn run_unit(
        self: Arc<Self>,
        tenant: TenantId,
        generation: u64,
        mut events: mpsc::Receiver<ProtocolEvent>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let reason = loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    tracing::debug!(tenant = %tenant, generation, "Supervision stopped");
                    return;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        break DisconnectReason::ConnectionLost;
                    };
                    if let Some(reason) = self.handle_event(&tenant, generation, event).await {
                        break reason;
                    }
                }
            }
        };

        self.forget_unit(&tenant, generation);
        self.handle_close(&tenant, generation, reason).await;
    }

    /// Apply one protocol event. Returns the close reason once the
    /// connection has closed.
    async fn handle_event(
        &self,
        tenant: &TenantId,
        generation: u64,
        event: ProtocolEvent,
    ) -> Option<DisconnectReason> {
        match event {
            ProtocolEvent::PairingCode(code) => {
                let applied = self.registry.transition(tenant, generation, |entry| {
                    entry.status = SessionStatus::AwaitingPairing;
                    entry.pairing_code = Some(code.clone());
                });
                if applied {
                    tracing::info!(tenant = %tenant, "Pairing code issued");
                    self.broadcaster
                        .publish(tenant, LifecycleEvent::pairing_code(code));
                }
            }
            ProtocolEvent::Open => {
                let applied = self.registry.transition(tenant, generation, |entry| {
                    entry.status = SessionStatus::Ready;
                    entry.pairing_code = None;
                    entry.connected_at = Some(now());
                });
                if applied {
                    tracing::info!(tenant = %tenant, "Connection ready");
                    self.broadcaster.publish(tenant, LifecycleEvent::Ready);
                }
            }
            ProtocolEvent::CredentialsUpdated { creds, ack } => {
                if let Err(e) = self.store.set(tenant, &KeyId::creds(), &creds).await {
                    tracing::warn!(tenant = %tenant, error = %e, "Failed to persist credentials");
                }
                if ack.send(()).is_err() {
                    tracing::debug!(tenant = %tenant, "Credentials ack dropped by protocol");
                }
            }
            ProtocolEvent::KeysUpdated { update, ack } => {
                let count = update.len();
                let keys = TenantKeys::new(Arc::clone(&self.store), tenant.clone());
                match keys.apply(update).await {
                    Ok(()) => tracing::debug!(tenant = %tenant, count, "Persisted key update"),
                    Err(e) => {
                        tracing::warn!(tenant = %tenant, count, error = %e, "Failed to persist key update");
                    }
                }
                if ack.send(()).is_err() {
                    tracing::debug!(tenant = %tenant, count, "Key update ack dropped by protocol");
                }
            }
            ProtocolEvent::Closed(reason) => return Some(reason),
        }
        None
    }

    async fn handle_close(self: &Arc<Self>, tenant: &TenantId, generation: u64, reason: DisconnectReason) {
        let Some(entry) = self.registry.remove_generation(tenant, generation) else {
            tracing::debug!(tenant = %tenant, generation, "Close of a superseded connection");
            return;
        };
        if let Some(handle) = entry.handle {
            handle.close().await;
        }

        if reason.is_terminal() {
            tracing::info!(tenant = %tenant, %reason, "Session revoked, deleting credentials");
            match self.store.delete_tenant(tenant).await {
                Ok(removed) => tracing::info!(tenant = %tenant, removed, "Credentials deleted"),
                Err(e) => {
                    tracing::warn!(tenant = %tenant, error = %e, "Failed to delete credentials");
                }
            }
            self.broadcaster
                .publish(tenant, LifecycleEvent::disconnected(Some(reason.to_string())));
        } else {
            tracing::warn!(
                tenant = %tenant,
                %reason,
                delay_secs = self.reconnect_delay.as_secs(),
                "Connection closed, scheduling reconnect"
            );
            self.schedule_reconnect(tenant.clone());
            self.broadcaster
                .publish(tenant, LifecycleEvent::disconnected(Some(reason.to_string())));
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, tenant: TenantId) {
        let mut reconnects = self
            .reconnects
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if reconnects
            .get(&tenant)
            .is_some_and(|pending| !pending.task.is_finished())
        {
            tracing::debug!(tenant = %tenant, "Reconnect already pending");
            return;
        }

        // The slot stays taken until the attempt settles, so logout can abort
        // a reconnect that is mid-handshake.
        let seq = self.generations.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        let delay = self.reconnect_delay;
        let task_tenant = tenant.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match this.initialize_with(&task_tenant, Some(seq)).await {
                Ok(outcome) => {
                    tracing::debug!(tenant = %task_tenant, ?outcome, "Reconnect attempted");
                }
                Err(e) => tracing::warn!(tenant = %task_tenant, error = %e, "Reconnect failed"),
            }
            this.release_reconnect(&task_tenant, seq);
        });
        reconnects.insert(tenant, PendingReconnect { seq, task });
    }

    /// Free the tenant's reconnect slot if it still belongs to `seq`.
    fn release_reconnect(&self, tenant: &TenantId, seq: u64) {
        let mut reconnects = self
            .reconnects
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if reconnects
            .get(tenant)
            .is_some_and(|pending| pending.seq == seq)
        {
            reconnects.remove(tenant);
        }
    }

    /// Whether a reconnect is waiting to fire for a tenant.
    #[must_use]
    pub fn reconnect_pending(&self, tenant: &TenantId) -> bool {
        self.reconnects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .is_some_and(|pending| !pending.task.is_finished())
    }

    fn cancel_reconnect(&self, tenant: &TenantId) {
        let pending = self
            .reconnects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tenant);
        if let Some(pending) = pending {
            tracing::debug!(tenant = %tenant, "Cancelled pending reconnect");
            pending.task.abort();
        }
    }

    fn forget_unit(&self, tenant: &TenantId, generation: u64) {
        let mut units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        if units
            .get(tenant)
            .is_some_and(|unit| unit.generation == generation)
        {
            units.remove(tenant);
        }
    }

    async fn stop_unit(&self, tenant: &TenantId) {
        let unit = self
            .units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tenant);
        if let Some(unit) = unit {
            if unit.stop_tx.send(()).is_err() {
                tracing::debug!(tenant = %tenant, generation = unit.generation, "Unit already stopping");
            }
            if let Err(e) = unit.task.await {
                tracing::warn!(tenant = %tenant, error = %e, "Supervision task ended abnormally");
            }
        }
    }

    /// Log a tenant out and forget its credentials.
    ///
    /// Completes only after the connection is torn down, the registry entry
    /// is gone and every credential record is deleted.
    ///
    /// # Errors
    /// Returns error if the credentials cannot be deleted.
    pub async fn logout(&self, tenant: &TenantId) -> Result<(), SupervisorError> {
        self.cancel_reconnect(tenant);
        // Removing the entry first makes an in-flight handshake find it gone.
        let entry = self.registry.remove(tenant);
        self.stop_unit(tenant).await;

        if let Some(handle) = entry.and_then(|entry| entry.handle) {
            if let Err(e) = handle.logout().await {
                tracing::warn!(tenant = %tenant, error = %e, "Protocol logout failed, tearing down anyway");
            }
            handle.close().await;
        }

        let removed = self.store.delete_tenant(tenant).await?;
        self.cancel_reconnect(tenant);

        tracing::info!(tenant = %tenant, removed, "Logged out");
        self.broadcaster.publish(
            tenant,
            LifecycleEvent::disconnected(Some(DisconnectReason::LoggedOut.to_string())),
        );
        Ok(())
    }

    /// Reconnect every tenant with stored credentials, one at a time.
    ///
    /// Returns how many tenants were found.
    ///
    /// # Errors
    /// Returns error if the tenants cannot be listed.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, SupervisorError> {
        let tenants = self.store.tenants_with(&KeyId::creds()).await?;
        tracing::info!(count = tenants.len(), "Recovering stored sessions");

        for (i, tenant) in tenants.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.startup_stagger).await;
            }
            if let Err(e) = self.initialize(tenant).await {
                tracing::warn!(tenant = %tenant, error = %e, "Recovery failed");
            }
        }

        Ok(tenants.len())
    }

    /// Run [`Self::recover`] in the background.
    pub fn spawn_recovery(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.recover().await {
                tracing::error!(error = %e, "Session recovery aborted");
            }
        })
    }

    /// Stop every tenant and close connections, keeping credentials.
    pub async fn shutdown(&self) {
        let pending: Vec<_> = self
            .reconnects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, pending)| pending.task)
            .collect();
        for task in pending {
            task.abort();
        }

        let tenants: Vec<TenantId> = self
            .units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for tenant in &tenants {
            self.stop_unit(tenant).await;
        }

        let handles: Vec<_> = self
            .registry
            .tenants()
            .into_iter()
            .filter_map(|tenant| self.registry.remove(&tenant).and_then(|entry| entry.handle))
            .collect();
        join_all(handles.iter().map(|handle| handle.close())).await;
        tracing::info!(tenants = tenants.len(), "Supervisor shut down");
    }
}
