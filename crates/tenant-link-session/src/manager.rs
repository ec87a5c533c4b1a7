//! Session manager facade over supervision, status and dispatch.

use std::{path::Path, sync::Arc};

use tenant_link_core::{
    Connector, CredentialStore, EventBroadcaster, KeyId, LifecycleEvent, TenantId,
};
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    ManagerConfig,
    dispatcher::MessageDispatcher,
    registry::{SessionRegistry, StatusSnapshot},
    supervisor::{InitOutcome, Supervisor, SupervisorError},
};

/// Entry point for every tenant operation.
pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    registry: Arc<SessionRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    supervisor: Arc<Supervisor>,
    dispatcher: MessageDispatcher,
}

impl SessionManager {
    /// Create a session manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
        config: &ManagerConfig,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Arc::new(EventBroadcaster::with_capacity(config.event_capacity));
        let supervisor = Supervisor::new(
            Arc::clone(&store),
            connector,
            Arc::clone(&registry),
            Arc::clone(&broadcaster),
            config,
        );
        let dispatcher = MessageDispatcher::new(Arc::clone(&registry), config.phone_format());

        Self {
            store,
            registry,
            broadcaster,
            supervisor,
            dispatcher,
        }
    }

    /// Start a tenant's session if it is not already live.
    ///
    /// # Errors
    /// Returns error if the protocol handshake fails.
    pub async fn initialize_session(
        &self,
        tenant: &TenantId,
    ) -> Result<InitOutcome, SupervisorError> {
        self.supervisor.initialize(tenant).await
    }

    /// Current status of a tenant.
    #[must_use]
    pub fn status(&self, tenant: &TenantId) -> StatusSnapshot {
        self.registry.status(tenant)
    }

    /// Send a text message. Returns whether the protocol accepted it.
    pub async fn send_text(&self, tenant: &TenantId, phone: &str, text: &str) -> bool {
        self.dispatcher.send_text(tenant, phone, text).await
    }

    /// Send a document. Returns whether the protocol accepted it.
    pub async fn send_document(
        &self,
        tenant: &TenantId,
        phone: &str,
        path: &Path,
        caption: Option<&str>,
        file_name: Option<&str>,
    ) -> bool {
        self.dispatcher
            .send_document(tenant, phone, path, caption, file_name)
            .await
    }

    /// Log a tenant out and delete its credentials.
    ///
    /// # Errors
    /// Returns error if the credentials cannot be deleted.
    pub async fn logout(&self, tenant: &TenantId) -> Result<(), SupervisorError> {
        self.supervisor.logout(tenant).await
    }

    /// Whether primary credentials are stored for a tenant.
    ///
    /// A storage failure reads as "no session".
    pub async fn has_stored_session(&self, tenant: &TenantId) -> bool {
        match self.store.get(tenant, &KeyId::creds()).await {
            Ok(creds) => creds.is_some(),
            Err(e) => {
                tracing::warn!(tenant = %tenant, error = %e, "Failed to read credentials");
                false
            }
        }
    }

    /// Subscribe to one tenant's lifecycle events.
    #[must_use]
    pub fn subscribe(&self, tenant: &TenantId) -> broadcast::Receiver<LifecycleEvent> {
        self.broadcaster.subscribe(tenant)
    }

    /// Reconnect every tenant with stored credentials.
    ///
    /// # Errors
    /// Returns error if stored tenants cannot be listed.
    pub async fn recover_stored_sessions(&self) -> Result<usize, SupervisorError> {
        self.supervisor.recover().await
    }

    /// Reconnect stored tenants in the background.
    pub fn spawn_recovery(&self) -> JoinHandle<()> {
        self.supervisor.spawn_recovery()
    }

    /// Close every connection, keeping credentials.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn broadcaster(&self) -> Arc<EventBroadcaster> {
        Arc::clone(&self.broadcaster)
    }
}

#[cfg(test)]
mod tests {
    use tenant_link_core::{Payload, ProtocolEvent};
    use tokio::sync::oneshot;
    use tokio_test::assert_ok;

    use super::*;
    use crate::{
        registry::SessionStatus,
        storage::MemoryCredentialStore,
        testing::{ScriptedConnector, eventually},
    };

    fn manager() -> (SessionManager, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::new());
        let manager = SessionManager::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::clone(&connector) as Arc<dyn Connector>,
            &ManagerConfig::default(),
        );
        (manager, connector)
    }

    async fn pair(manager: &SessionManager, connector: &ScriptedConnector, tenant: &TenantId) {
        assert_eq!(
            assert_ok!(manager.initialize_session(tenant).await),
            InitOutcome::Started
        );
        let session = connector.session(0);
        let (ack, acked) = oneshot::channel();
        session
            .emit(ProtocolEvent::CredentialsUpdated {
                creds: Payload::object([("me", Payload::from("628123"))]),
                ack,
            })
            .await;
        acked.await.unwrap();
        session.emit(ProtocolEvent::Open).await;
        eventually(|| manager.status(tenant).status == SessionStatus::Ready).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_tenant_has_no_stored_session() {
        let (manager, _) = manager();
        let tenant = TenantId::from("acme");

        assert!(!manager.has_stored_session(&tenant).await);
        assert_eq!(manager.status(&tenant), StatusSnapshot::disconnected());
        assert!(!manager.send_text(&tenant, "081234567890", "hi").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paired_tenant_sends_and_logs_out() {
        let (manager, connector) = manager();
        let tenant = TenantId::from("acme");
        pair(&manager, &connector, &tenant).await;

        assert!(manager.has_stored_session(&tenant).await);
        assert!(manager.send_text(&tenant, "081234567890", "hello").await);
        assert_eq!(connector.session(0).handle.texts().len(), 1);

        assert_ok!(manager.logout(&tenant).await);
        assert!(!manager.has_stored_session(&tenant).await);
        assert_eq!(manager.status(&tenant).status, SessionStatus::Disconnected);
        assert!(!manager.send_text(&tenant, "081234567890", "again").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_reach_tenant_subscribers_only() {
        let (manager, connector) = manager();
        let acme = TenantId::from("acme");
        let mut acme_rx = manager.subscribe(&acme);
        let mut other_rx = manager.subscribe(&TenantId::from("other"));

        assert_ok!(manager.initialize_session(&acme).await);
        connector
            .session(0)
            .emit(ProtocolEvent::PairingCode("2@ref".into()))
            .await;

        assert_eq!(
            acme_rx.recv().await.unwrap(),
            LifecycleEvent::pairing_code("2@ref")
        );
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_of_unknown_tenant_is_harmless() {
        let (manager, _) = manager();
        assert_ok!(manager.logout(&TenantId::from("ghost")).await);
    }
}
