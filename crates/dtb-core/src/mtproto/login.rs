//! Multi-step login handshake.
//!
//! A login runs as a background task that drives the protocol handshake. The
//! handshake pulls the code and password through [`LoginPrompts`], which
//! suspend on single-resolution slots filled later by `submit_code` /
//! `submit_password` from the user's chat replies.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    deferred::Deferred,
    domain::UserId,
    errors::Error,
    mtproto::{handle::safely_disconnect, registry::ClientRegistry},
    protocol::{LoginPrompts, ProtocolClient, ProtocolConnector, ProtocolResult, QrToken},
    store::SessionStore,
    utils::lock,
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginMethod {
    Phone(String),
    Qr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginStage {
    Connecting,
    AwaitingCode,
    AwaitingQrScan,
    AwaitingPassword,
    /// Handshake finished; the session is being persisted. Cannot be cancelled.
    Completing,
}

/// Progress callbacks for one login attempt.
#[async_trait]
pub trait LoginObserver: Send + Sync {
    async fn on_qr_issued(&self, _qr: &QrToken) {}
    async fn on_password_requested(&self, hint: Option<String>);
    async fn on_success(&self);
    async fn on_error(&self, err: &Error);
}

struct LoginSession {
    method: LoginMethod,
    client: Arc<dyn ProtocolClient>,
    code: Deferred<String>,
    password: Deferred<String>,
    password_announced: AtomicBool,
    stage: Mutex<LoginStage>,
    qr: Mutex<Option<QrToken>>,
    cancel: CancellationToken,
    /// Resolved once the driving task stops touching the store and registry.
    finished: Deferred<()>,
}

impl LoginSession {
    fn new(method: LoginMethod, client: Arc<dyn ProtocolClient>) -> Self {
        Self {
            method,
            client,
            code: Deferred::new(),
            password: Deferred::new(),
            password_announced: AtomicBool::new(false),
            stage: Mutex::new(LoginStage::Connecting),
            qr: Mutex::new(None),
            cancel: CancellationToken::new(),
            finished: Deferred::new(),
        }
    }

    fn set_stage(&self, stage: LoginStage) {
        *lock(&self.stage) = stage;
    }
}

struct SessionPrompts {
    session: Arc<LoginSession>,
    observer: Arc<dyn LoginObserver>,
}

#[async_trait]
impl LoginPrompts for SessionPrompts {
    async fn phone_number(&self) -> String {
        match &self.session.method {
            LoginMethod::Phone(phone) => phone.clone(),
            LoginMethod::Qr => String::new(),
        }
    }

    async fn code(&self) -> String {
        self.session.set_stage(LoginStage::AwaitingCode);
        self.session.code.wait().await
    }

    async fn password(&self, hint: Option<String>) -> String {
        self.session.set_stage(LoginStage::AwaitingPassword);
        if !self.session.password_announced.swap(true, Ordering::SeqCst) {
            self.observer.on_password_requested(hint).await;
        }
        self.session.password.wait().await
    }

    async fn qr_issued(&self, qr: QrToken) {
        self.session.set_stage(LoginStage::AwaitingQrScan);
        *lock(&self.session.qr) = Some(qr.clone());
        self.observer.on_qr_issued(&qr).await;
    }
}

/// Owns every in-progress login, at most one per user.
pub struct LoginFlows {
    store: Arc<dyn SessionStore>,
    connector: Arc<dyn ProtocolConnector>,
    registry: Arc<ClientRegistry>,
    sessions: Mutex<HashMap<UserId, Arc<LoginSession>>>,
}

impl LoginFlows {
    pub fn new(
        store: Arc<dyn SessionStore>,
        connector: Arc<dyn ProtocolConnector>,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            store,
            connector,
            registry,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a login. Returns once the handshake task is spawned; progress is
    /// reported through `observer`.
    pub fn start(
        self: &Arc<Self>,
        user: UserId,
        method: LoginMethod,
        observer: Arc<dyn LoginObserver>,
    ) -> Result<()> {
        let session = {
            let mut sessions = lock(&self.sessions);
            if sessions.contains_key(&user) {
                return Err(Error::LoginInProgress);
            }
            let client = self.connector.create(None)?;
            let session = Arc::new(LoginSession::new(method, client));
            sessions.insert(user, session.clone());
            session
        };

        info!(user_id = %user, "telegram login started");
        tokio::spawn(self.clone().drive(user, session, observer));
        Ok(())
    }

    pub fn submit_code(&self, user: UserId, code: impl Into<String>) -> Result<()> {
        let session = self.session(user)?;
        if !session.code.resolve(code.into()) {
            debug!(user_id = %user, "login code already submitted");
        }
        Ok(())
    }

    pub fn submit_password(&self, user: UserId, password: impl Into<String>) -> Result<()> {
        let session = self.session(user)?;
        if !session.password.resolve(password.into()) {
            debug!(user_id = %user, "login password already submitted");
        }
        Ok(())
    }

    pub fn is_in_progress(&self, user: UserId) -> bool {
        lock(&self.sessions).contains_key(&user)
    }

    pub fn stage(&self, user: UserId) -> Option<LoginStage> {
        lock(&self.sessions).get(&user).map(|s| *lock(&s.stage))
    }

    /// Most recent QR token of an in-progress QR login.
    pub fn qr_token(&self, user: UserId) -> Option<QrToken> {
        lock(&self.sessions)
            .get(&user)
            .and_then(|s| lock(&s.qr).clone())
    }

    /// Abort the user's login. Pending prompts are abandoned and no callback fires.
    pub async fn cancel(&self, user: UserId) -> bool {
        let session = {
            let mut sessions = lock(&self.sessions);
            let cancellable = sessions
                .get(&user)
                .is_some_and(|s| *lock(&s.stage) != LoginStage::Completing);
            if !cancellable {
                return false;
            }
            match sessions.remove(&user) {
                Some(s) => s,
                None => return false,
            }
        };
        session.cancel.cancel();
        safely_disconnect(session.client.as_ref()).await;
        info!(user_id = %user, "telegram login cancelled");
        true
    }

    /// Make sure no login for `user` is running: cancel it, or wait for one
    /// that is already completing to finish persisting.
    pub async fn settle(&self, user: UserId) {
        if self.cancel(user).await {
            return;
        }
        let completing = lock(&self.sessions).get(&user).cloned();
        if let Some(session) = completing {
            debug!(user_id = %user, "waiting for telegram login to complete");
            session.finished.wait().await;
        }
    }

    fn session(&self, user: UserId) -> Result<Arc<LoginSession>> {
        lock(&self.sessions)
            .get(&user)
            .cloned()
            .ok_or(Error::LoginNotStarted)
    }

    /// Remove `session` if it is still the user's current one.
    fn discard(&self, user: UserId, session: &Arc<LoginSession>) -> bool {
        let mut sessions = lock(&self.sessions);
        if sessions.get(&user).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(&user);
            true
        } else {
            false
        }
    }

    /// Enter `Completing` if `session` is still current. From here on `cancel` refuses.
    fn mark_completing(&self, user: UserId, session: &Arc<LoginSession>) -> bool {
        let sessions = lock(&self.sessions);
        let current = sessions.get(&user).is_some_and(|s| Arc::ptr_eq(s, session));
        if current {
            session.set_stage(LoginStage::Completing);
        }
        current
    }

    async fn drive(
        self: Arc<Self>,
        user: UserId,
        session: Arc<LoginSession>,
        observer: Arc<dyn LoginObserver>,
    ) {
        let signed_in = tokio::select! {
            _ = session.cancel.cancelled() => None,
            r = handshake(&session, observer.clone()) => Some(r),
        };

        let outcome = match signed_in {
            None => None,
            Some(Ok(())) if self.mark_completing(user, &session) => {
                Some(self.complete(user, &session).await)
            }
            Some(Ok(())) => None,
            Some(Err(e)) => Some(Err(Error::from(e))),
        };

        if outcome.is_some() {
            self.discard(user, &session);
        }
        session.finished.resolve(());
        let Some(outcome) = outcome else {
            return;
        };
        match outcome {
            Ok(()) => {
                info!(user_id = %user, "telegram login completed");
                observer.on_success().await;
            }
            Err(e) => {
                warn!(user_id = %user, error = %e, "telegram login failed");
                safely_disconnect(session.client.as_ref()).await;
                observer.on_error(&e).await;
            }
        }
    }

    /// Persist the fresh session (dropping old channel bindings) and hand the
    /// connection over to the registry.
    async fn complete(&self, user: UserId, session: &LoginSession) -> Result<()> {
        let blob = session.client.export_session()?;
        let mut record = self.store.get(user).await?.unwrap_or_default();
        record.clear_protocol();
        record.protocol_session = Some(blob);
        self.store.save(user, &record).await?;
        self.registry.install(user, session.client.clone()).await;
        Ok(())
    }
}

async fn handshake(
    session: &Arc<LoginSession>,
    observer: Arc<dyn LoginObserver>,
) -> ProtocolResult<()> {
    session.client.connect().await?;
    let prompts = SessionPrompts {
        session: session.clone(),
        observer,
    };
    match session.method {
        LoginMethod::Phone(_) => session.client.sign_in_with_phone(&prompts).await,
        LoginMethod::Qr => session.client.sign_in_with_qr(&prompts).await,
    }
}
