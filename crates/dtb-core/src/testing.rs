//! Hand-written fakes shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::{
    deferred::Deferred,
    domain::UserId,
    errors::Error,
    mtproto::{keepalive::FatalAuthHandler, login::LoginObserver},
    protocol::{
        ChannelPeer, Dialog, LoginPrompts, ProtocolClient, ProtocolConnector, ProtocolError,
        ProtocolResult, QrToken,
    },
    store::{MemoryStore, SessionRecord, SessionStore},
    Result,
};

pub(crate) struct FakeClient {
    pub session: Option<String>,
    pub connected: AtomicBool,
    pub fail_connect: AtomicBool,
    pub disconnects: AtomicUsize,
    pings: AtomicUsize,
    ping_errors: Mutex<VecDeque<ProtocolError>>,
    op_errors: Mutex<VecDeque<ProtocolError>>,
    persistent_op_error: Mutex<Option<ProtocolError>>,
    op_delay: Mutex<Option<Duration>>,
    dialogs: Mutex<Vec<Dialog>>,
    sent: Mutex<Vec<(ChannelPeer, String)>>,
    inputs: Mutex<Vec<String>>,
    require_password: AtomicBool,
    sign_in_error: Mutex<Option<ProtocolError>>,
    qr_scanned: Deferred<()>,
}

impl FakeClient {
    pub fn new(session: Option<&str>) -> Self {
        Self {
            session: session.map(str::to_string),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            ping_errors: Mutex::new(VecDeque::new()),
            op_errors: Mutex::new(VecDeque::new()),
            persistent_op_error: Mutex::new(None),
            op_delay: Mutex::new(None),
            dialogs: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
            require_password: AtomicBool::new(false),
            sign_in_error: Mutex::new(None),
            qr_scanned: Deferred::new(),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn push_ping_error(&self, err: ProtocolError) {
        self.ping_errors.lock().unwrap().push_back(err);
    }

    pub fn push_op_error(&self, err: ProtocolError) {
        self.op_errors.lock().unwrap().push_back(err);
    }

    pub fn sent(&self) -> Vec<(ChannelPeer, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Phone, code and password values the handshake pulled, in order.
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }

    pub fn scan_qr(&self) {
        self.qr_scanned.resolve(());
    }

    fn next_op_error(&self) -> Option<ProtocolError> {
        if let Some(e) = self.op_errors.lock().unwrap().pop_front() {
            return Some(e);
        }
        self.persistent_op_error.lock().unwrap().clone()
    }

    fn record_input(&self, value: String) {
        self.inputs.lock().unwrap().push(value);
    }

    async fn finish_sign_in(&self, prompts: &dyn LoginPrompts) -> ProtocolResult<()> {
        if let Some(e) = self.sign_in_error.lock().unwrap().clone() {
            return Err(e);
        }
        if self.require_password.load(Ordering::SeqCst) {
            let password = prompts.password(Some("hint".to_string())).await;
            self.record_input(password);
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn connect(&self) -> ProtocolResult<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ProtocolError::new("handshake failed"));
        }
        self.set_connected(true);
        Ok(())
    }

    async fn disconnect(&self) -> ProtocolResult<()> {
        self.set_connected(false);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn dc_id(&self) -> Option<i32> {
        Some(2)
    }

    async fn ping(&self) -> ProtocolResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        match self.ping_errors.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn sign_in_with_phone(&self, prompts: &dyn LoginPrompts) -> ProtocolResult<()> {
        let phone = prompts.phone_number().await;
        self.record_input(phone);
        let code = prompts.code().await;
        self.record_input(code);
        self.finish_sign_in(prompts).await
    }

    async fn sign_in_with_qr(&self, prompts: &dyn LoginPrompts) -> ProtocolResult<()> {
        prompts
            .qr_issued(QrToken {
                token: vec![1, 2, 3],
                expires_at: Utc::now() + chrono::Duration::seconds(30),
            })
            .await;
        self.qr_scanned.wait().await;
        self.finish_sign_in(prompts).await
    }

    fn export_session(&self) -> ProtocolResult<String> {
        Ok(self
            .session
            .clone()
            .unwrap_or_else(|| "exported-session".to_string()))
    }

    async fn dialogs(&self) -> ProtocolResult<Vec<Dialog>> {
        let delay = *self.op_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.next_op_error() {
            Some(e) => Err(e),
            None => Ok(self.dialogs.lock().unwrap().clone()),
        }
    }

    async fn send_message(&self, peer: ChannelPeer, text: &str) -> ProtocolResult<()> {
        if let Some(e) = self.next_op_error() {
            return Err(e);
        }
        self.sent.lock().unwrap().push((peer, text.to_string()));
        Ok(())
    }
}

/// Builds [`FakeClient`]s and keeps them for inspection. Settings apply to
/// every client created afterwards.
#[derive(Default)]
pub(crate) struct FakeConnector {
    clients: Mutex<Vec<Arc<FakeClient>>>,
    require_password: AtomicBool,
    sign_in_error: Mutex<Option<ProtocolError>>,
    op_error: Mutex<Option<ProtocolError>>,
    op_delay: Mutex<Option<Duration>>,
    dialogs: Mutex<Vec<Dialog>>,
}

impl FakeConnector {
    pub fn created(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakeClient> {
        self.clients
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no client created yet")
    }

    pub fn require_password(&self, on: bool) {
        self.require_password.store(on, Ordering::SeqCst);
    }

    pub fn fail_sign_in(&self, err: ProtocolError) {
        *self.sign_in_error.lock().unwrap() = Some(err);
    }

    pub fn fail_ops_with(&self, err: ProtocolError) {
        *self.op_error.lock().unwrap() = Some(err);
    }

    /// Make `dialogs` take this long on every client created afterwards.
    pub fn delay_ops(&self, delay: Duration) {
        *self.op_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_dialogs(&self, dialogs: Vec<Dialog>) {
        *self.dialogs.lock().unwrap() = dialogs;
    }
}

impl ProtocolConnector for FakeConnector {
    fn create(&self, session: Option<&str>) -> ProtocolResult<Arc<dyn ProtocolClient>> {
        let client = FakeClient::new(session);
        client
            .require_password
            .store(self.require_password.load(Ordering::SeqCst), Ordering::SeqCst);
        *client.sign_in_error.lock().unwrap() = self.sign_in_error.lock().unwrap().clone();
        *client.persistent_op_error.lock().unwrap() = self.op_error.lock().unwrap().clone();
        *client.op_delay.lock().unwrap() = *self.op_delay.lock().unwrap();
        *client.dialogs.lock().unwrap() = self.dialogs.lock().unwrap().clone();

        let client = Arc::new(client);
        self.clients.lock().unwrap().push(client.clone());
        let client: Arc<dyn ProtocolClient> = client;
        Ok(client)
    }
}

pub(crate) struct NoopFatalHandler;

#[async_trait]
impl FatalAuthHandler for NoopFatalHandler {
    async fn on_fatal_auth(&self, _user: UserId, _err: ProtocolError) {}
}

/// [`MemoryStore`] whose saves block until [`GatedStore::open`] is called.
#[derive(Default)]
pub(crate) struct GatedStore {
    inner: MemoryStore,
    gate: Deferred<()>,
}

impl GatedStore {
    pub fn open(&self) {
        self.gate.resolve(());
    }
}

#[async_trait]
impl SessionStore for GatedStore {
    async fn get(&self, user: UserId) -> Result<Option<SessionRecord>> {
        self.inner.get(user).await
    }

    async fn save(&self, user: UserId, record: &SessionRecord) -> Result<()> {
        self.gate.wait().await;
        self.inner.save(user, record).await
    }

    async fn delete(&self, user: UserId) -> Result<()> {
        self.inner.delete(user).await
    }
}

/// Store with a `session-<id>` blob for each user.
pub(crate) async fn logged_in_store(users: &[i64]) -> Arc<dyn SessionStore> {
    let store = MemoryStore::new();
    for &id in users {
        let record = SessionRecord {
            protocol_session: Some(format!("session-{id}")),
            ..Default::default()
        };
        store.save(UserId(id), &record).await.unwrap();
    }
    Arc::new(store)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LoginEvent {
    QrIssued(String),
    PasswordRequested(Option<String>),
    Success,
    Error(String),
}

pub(crate) struct RecordingObserver {
    tx: mpsc::UnboundedSender<LoginEvent>,
}

impl RecordingObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LoginEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl LoginObserver for RecordingObserver {
    async fn on_qr_issued(&self, qr: &QrToken) {
        let _ = self.tx.send(LoginEvent::QrIssued(qr.login_url()));
    }

    async fn on_password_requested(&self, hint: Option<String>) {
        let _ = self.tx.send(LoginEvent::PasswordRequested(hint));
    }

    async fn on_success(&self) {
        let _ = self.tx.send(LoginEvent::Success);
    }

    async fn on_error(&self, err: &Error) {
        let _ = self.tx.send(LoginEvent::Error(err.to_string()));
    }
}
