//! Scripted protocol connector for tests.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tenant_link_core::{
    AuthState, Connection, ConnectionHandle, Connector, MessageReceipt, OutgoingDocument, Payload,
    ProtocolError, ProtocolEvent, TenantId, TenantKeys,
};
use tokio::sync::{Notify, mpsc};

/// Poll a condition until it holds, advancing time in small steps.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Connection handle recording what was asked of it.
#[derive(Default)]
pub struct FakeHandle {
    texts: Mutex<Vec<(String, String)>>,
    documents: Mutex<Vec<(String, OutgoingDocument)>>,
    fail_sends: AtomicBool,
    logged_out: AtomicBool,
    closed: AtomicBool,
}

impl FakeHandle {
    pub fn texts(&self) -> Vec<(String, String)> {
        self.texts.lock().unwrap().clone()
    }

    pub fn documents(&self) -> Vec<(String, OutgoingDocument)> {
        self.documents.lock().unwrap().clone()
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn receipt(&self, count: usize) -> Result<MessageReceipt, ProtocolError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ProtocolError::Send("rejected by server".into()));
        }
        Ok(MessageReceipt {
            id: format!("MSG{count}"),
        })
    }
}

#[async_trait]
impl ConnectionHandle for FakeHandle {
    async fn send_text(&self, to: &str, text: &str) -> Result<MessageReceipt, ProtocolError> {
        let count = {
            let mut texts = self.texts.lock().unwrap();
            texts.push((to.to_owned(), text.to_owned()));
            texts.len()
        };
        self.receipt(count)
    }

    async fn send_document(
        &self,
        to: &str,
        document: OutgoingDocument,
    ) -> Result<MessageReceipt, ProtocolError> {
        let count = {
            let mut documents = self.documents.lock().unwrap();
            documents.push((to.to_owned(), document));
            documents.len()
        };
        self.receipt(count)
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One connection opened by the scripted connector.
#[derive(Clone)]
pub struct ScriptedSession {
    pub tenant: TenantId,
    pub restored: bool,
    pub creds: Payload,
    pub keys: TenantKeys,
    pub handle: Arc<FakeHandle>,
    events: Arc<Mutex<Option<mpsc::Sender<ProtocolEvent>>>>,
}

impl ScriptedSession {
    /// Deliver a protocol event to the supervisor.
    pub async fn emit(&self, event: ProtocolEvent) {
        let sender = self.events.lock().unwrap().clone();
        sender
            .expect("session hung up")
            .send(event)
            .await
            .expect("supervisor stopped listening");
    }

    /// Deliver a protocol event. False if nobody is listening.
    pub async fn try_emit(&self, event: ProtocolEvent) -> bool {
        let sender = self.events.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Drop the event channel without a close event.
    pub fn hang_up(&self) {
        self.events.lock().unwrap().take();
    }
}

/// Connector whose connections are driven by the test.
#[derive(Default)]
pub struct ScriptedConnector {
    attempts: AtomicUsize,
    fail_next: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    holds: Mutex<HashMap<TenantId, Arc<Notify>>>,
    sessions: Mutex<Vec<ScriptedSession>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn session(&self, index: usize) -> ScriptedSession {
        self.sessions.lock().unwrap()[index].clone()
    }

    pub fn fail_next_connect(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Block the tenant's next handshake until [`Self::release`].
    pub fn hold(&self, tenant: &TenantId) {
        self.holds
            .lock()
            .unwrap()
            .insert(tenant.clone(), Arc::new(Notify::new()));
    }

    pub fn release(&self, tenant: &TenantId) {
        if let Some(gate) = self.holds.lock().unwrap().get(tenant) {
            gate.notify_one();
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn fresh_credentials(&self) -> Payload {
        Payload::object([("registered", Payload::Bool(false))])
    }

    async fn connect(
        &self,
        tenant: &TenantId,
        auth: AuthState,
    ) -> Result<Connection, ProtocolError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let gate = self.holds.lock().unwrap().get(tenant).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ProtocolError::Handshake("stream errored out".into()));
        }

        let (tx, rx) = mpsc::channel(16);
        let handle = Arc::new(FakeHandle::default());
        self.sessions.lock().unwrap().push(ScriptedSession {
            tenant: tenant.clone(),
            restored: auth.restored,
            creds: auth.creds,
            keys: auth.keys,
            handle: Arc::clone(&handle),
            events: Arc::new(Mutex::new(Some(tx))),
        });

        Ok(Connection {
            handle,
            events: rx,
        })
    }
}
