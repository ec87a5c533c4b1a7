//! In-process protocol stand-in.
//!
//! Fresh tenants get a pairing code, then "pair" on their own after a short
//! delay. Restored tenants open straight away. Sends are logged and acked
//! with random message ids.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tenant_link_core::{
    AuthState, Connection, ConnectionHandle, Connector, KeyUpdate, MessageReceipt,
    OutgoingDocument, Payload, ProtocolError, ProtocolEvent, TenantId,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use uuid::Uuid;

pub struct LoopbackConnector {
    pairing_delay: Duration,
}

impl LoopbackConnector {
    pub const fn new(pairing_delay: Duration) -> Self {
        Self { pairing_delay }
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    fn fresh_credentials(&self) -> Payload {
        Payload::object([
            ("registered", Payload::Bool(false)),
            ("noiseKey", Payload::bytes(Uuid::new_v4().as_bytes().to_vec())),
        ])
    }

    async fn connect(
        &self,
        tenant: &TenantId,
        auth: AuthState,
    ) -> Result<Connection, ProtocolError> {
        let (tx, rx) = mpsc::channel(16);
        let driver = tokio::spawn(drive(tenant.clone(), auth, tx, self.pairing_delay));

        Ok(Connection {
            handle: Arc::new(LoopbackHandle {
                tenant: tenant.clone(),
                driver: Mutex::new(Some(driver)),
            }),
            events: rx,
        })
    }
}

async fn drive(
    tenant: TenantId,
    auth: AuthState,
    tx: mpsc::Sender<ProtocolEvent>,
    pairing_delay: Duration,
) {
    if auth.restored {
        let known = auth.keys.get("pre-key", &["1".to_owned()]).await;
        tracing::debug!(tenant = %tenant, pre_keys = known.len(), "Restored session");
    } else {
        let code = format!("2@{}", Uuid::new_v4().simple());
        if tx.send(ProtocolEvent::PairingCode(code)).await.is_err() {
            return;
        }
        tokio::time::sleep(pairing_delay).await;

        let mut creds = auth.creds;
        if let Payload::Object(fields) = &mut creds {
            fields.insert("registered".into(), Payload::Bool(true));
        }
        let (ack, acked) = oneshot::channel();
        if tx
            .send(ProtocolEvent::CredentialsUpdated { creds, ack })
            .await
            .is_err()
        {
            return;
        }
        let _ = acked.await;

        let pre_key = Payload::bytes(Uuid::new_v4().as_bytes().to_vec());
        let update = KeyUpdate::new().set("pre-key", "1", pre_key);
        let (ack, acked) = oneshot::channel();
        if tx
            .send(ProtocolEvent::KeysUpdated { update, ack })
            .await
            .is_err()
        {
            return;
        }
        let _ = acked.await;
    }

    if tx.send(ProtocolEvent::Open).await.is_ok() {
        tx.closed().await;
    }
}

struct LoopbackHandle {
    tenant: TenantId,
    driver: Mutex<Option<JoinHandle<()>>>,
}

fn receipt() -> MessageReceipt {
    MessageReceipt {
        id: Uuid::new_v4().simple().to_string().to_uppercase(),
    }
}

#[async_trait]
impl ConnectionHandle for LoopbackHandle {
    async fn send_text(&self, to: &str, text: &str) -> Result<MessageReceipt, ProtocolError> {
        tracing::info!(tenant = %self.tenant, to, len = text.len(), "Loopback text");
        Ok(receipt())
    }

    async fn send_document(
        &self,
        to: &str,
        document: OutgoingDocument,
    ) -> Result<MessageReceipt, ProtocolError> {
        tracing::info!(
            tenant = %self.tenant,
            to,
            file_name = %document.file_name,
            mimetype = %document.mimetype,
            "Loopback document"
        );
        Ok(receipt())
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        tracing::info!(tenant = %self.tenant, "Loopback logout");
        Ok(())
    }

    async fn close(&self) {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            driver.abort();
        }
    }
}
