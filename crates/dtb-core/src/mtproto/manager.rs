use std::{
    future::Future,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::{
    classify::{classify, ErrorClass},
    domain::UserId,
    errors::Error,
    limiter::RequestLimiter,
    mtproto::{
        handle::{ClientHandle, ClientStats},
        keepalive::{FatalAuthHandler, KeepAliveState, KeepAliveSupervisor},
        login::{LoginFlows, LoginMethod, LoginObserver, LoginStage},
        registry::ClientRegistry,
        ClientManagerConfig,
    },
    protocol::{ChannelPeer, ProtocolClient, ProtocolConnector, ProtocolError, ProtocolResult, QrToken},
    store::SessionStore,
    Result,
};

/// A channel the user can post into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSummary {
    pub id: i64,
    pub access_hash: i64,
    pub title: String,
    pub username: Option<String>,
}

struct ManagerInner {
    limiter: RequestLimiter,
    store: Arc<dyn SessionStore>,
    registry: Arc<ClientRegistry>,
    logins: Arc<LoginFlows>,
    error_alert_threshold: u32,
}

/// Entry point for everything that touches a user's protocol client.
///
/// Operations go through the global limiter, then the registry, then error
/// classification: transient failures reset the client and retry once, fatal
/// auth failures log the user out.
#[derive(Clone)]
pub struct ClientManager {
    inner: Arc<ManagerInner>,
}

/// Keepalive hook: a fatal probe logs the user out.
struct LogoutOnFatal {
    inner: Weak<ManagerInner>,
}

#[async_trait]
impl FatalAuthHandler for LogoutOnFatal {
    async fn on_fatal_auth(&self, user: UserId, _err: ProtocolError) {
        if let Some(inner) = self.inner.upgrade() {
            ClientManager { inner }.force_logout(user).await;
        }
    }
}

impl ClientManager {
    pub fn new(
        cfg: &ClientManagerConfig,
        store: Arc<dyn SessionStore>,
        connector: Arc<dyn ProtocolConnector>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let keepalive = Arc::new(KeepAliveSupervisor::new(
                cfg.keepalive,
                cfg.error_alert_threshold,
                Arc::new(LogoutOnFatal { inner: weak.clone() }),
            ));
            let registry = Arc::new(ClientRegistry::new(
                store.clone(),
                connector.clone(),
                keepalive,
                cfg.client_ttl,
                cfg.cleanup_interval,
            ));
            let logins = Arc::new(LoginFlows::new(store.clone(), connector, registry.clone()));
            ManagerInner {
                limiter: RequestLimiter::new(cfg.max_concurrent_requests),
                store,
                registry,
                logins,
                error_alert_threshold: cfg.error_alert_threshold.max(1),
            }
        });
        Self { inner }
    }

    /// Run `f` against the user's connected client.
    ///
    /// `f` may be called twice: once more after a transient failure and a fresh reconnect.
    pub async fn with_client<T, F, Fut>(&self, user: UserId, operation: &str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn ProtocolClient>) -> Fut,
        Fut: Future<Output = ProtocolResult<T>>,
    {
        self.inner
            .limiter
            .run(|| self.execute(user, operation, &f))
            .await
    }

    async fn execute<T, F, Fut>(&self, user: UserId, operation: &str, f: &F) -> Result<T>
    where
        F: Fn(Arc<dyn ProtocolClient>) -> Fut,
        Fut: Future<Output = ProtocolResult<T>>,
    {
        let handle = self.acquire(user).await?;
        let err = match f(handle.client().clone()).await {
            Ok(v) => return Ok(settle_success(&handle, v)),
            Err(e) => e,
        };
        if classify(&err) != ErrorClass::Transient {
            return Err(self.settle_failure(user, &handle, operation, err).await);
        }

        warn!(user_id = %user, operation, error = %err, "transient telegram error, reconnecting");
        self.inner.registry.reset(user).await;
        let handle = self.acquire(user).await?;
        match f(handle.client().clone()).await {
            Ok(v) => Ok(settle_success(&handle, v)),
            Err(e) => Err(self.settle_failure(user, &handle, operation, e).await),
        }
    }

    async fn acquire(&self, user: UserId) -> Result<Arc<ClientHandle>> {
        match self.inner.registry.get_or_create(user).await {
            Err(e @ Error::FatalAuth(_)) => {
                error!(user_id = %user, error = %e, "stored telegram session rejected, logging out");
                self.force_logout(user).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn settle_failure(
        &self,
        user: UserId,
        handle: &ClientHandle,
        operation: &str,
        err: ProtocolError,
    ) -> Error {
        if classify(&err) == ErrorClass::FatalAuth {
            error!(user_id = %user, operation, error = %err, "fatal telegram auth error, logging out");
            self.force_logout(user).await;
            return Error::FatalAuth(err);
        }
        let errors = handle.record_error();
        if errors == self.inner.error_alert_threshold {
            warn!(user_id = %user, operation, errors, "telegram client errors reached alert threshold");
        }
        Error::from(err)
    }

    /// Channels the user's account can see, with the credentials needed to post.
    pub async fn list_channels(&self, user: UserId) -> Result<Vec<ChannelSummary>> {
        let dialogs = self
            .with_client(user, "list_channels", |client| async move { client.dialogs().await })
            .await?;
        Ok(dialogs
            .into_iter()
            .filter(|d| d.is_channel)
            .filter_map(|d| {
                Some(ChannelSummary {
                    id: d.id?,
                    access_hash: d.access_hash?,
                    title: d
                        .title
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| "Untitled".to_string()),
                    username: d.username,
                })
            })
            .collect())
    }

    pub async fn send_channel_message(
        &self,
        user: UserId,
        channel_id: i64,
        access_hash: i64,
        text: &str,
    ) -> Result<()> {
        let peer = ChannelPeer {
            channel_id,
            access_hash,
        };
        self.with_client(user, "send_message", |client| async move {
            client.send_message(peer, text).await
        })
        .await
    }

    /// Forget the user's protocol session and channel bindings, and drop the live client.
    ///
    /// A login that is already completing is allowed to finish first, then undone.
    /// Teardown happens even if the store write fails; the store error is returned.
    pub async fn logout(&self, user: UserId) -> Result<()> {
        self.inner.logins.settle(user).await;
        let cleared = self.clear_record(user).await;
        self.inner.registry.reset(user).await;
        info!(user_id = %user, "telegram session logged out");
        cleared
    }

    async fn clear_record(&self, user: UserId) -> Result<()> {
        let store = &self.inner.store;
        if let Some(mut record) = store.get(user).await? {
            record.clear_protocol();
            store.save(user, &record).await?;
        }
        Ok(())
    }

    async fn force_logout(&self, user: UserId) {
        if let Err(e) = self.logout(user).await {
            warn!(user_id = %user, error = %e, "failed to clear telegram session");
        }
    }

    /// Connected client for calls outside `with_client`. Waits for a limiter slot
    /// like any other operation, and a rejected stored session logs the user out.
    pub async fn get_or_create_client(&self, user: UserId) -> Result<Arc<dyn ProtocolClient>> {
        self.inner
            .limiter
            .run(|| async {
                let handle = self.acquire(user).await?;
                Ok::<_, Error>(handle.client().clone())
            })
            .await
    }

    pub async fn is_logged_in(&self, user: UserId) -> Result<bool> {
        Ok(self
            .inner
            .store
            .get(user)
            .await?
            .is_some_and(|r| r.is_logged_in()))
    }

    pub fn client_stats(&self, user: UserId) -> Option<ClientStats> {
        self.inner.registry.peek(user).map(|h| h.stats())
    }

    pub fn keepalive_state(&self, user: UserId) -> Option<KeepAliveState> {
        self.keepalive().state(user)
    }

    fn keepalive(&self) -> &KeepAliveSupervisor {
        self.inner.registry.keepalive()
    }

    pub fn start_login(
        &self,
        user: UserId,
        phone: impl Into<String>,
        observer: Arc<dyn LoginObserver>,
    ) -> Result<()> {
        self.inner
            .logins
            .start(user, LoginMethod::Phone(phone.into()), observer)
    }

    pub fn start_qr_login(&self, user: UserId, observer: Arc<dyn LoginObserver>) -> Result<()> {
        self.inner.logins.start(user, LoginMethod::Qr, observer)
    }

    pub fn submit_code(&self, user: UserId, code: impl Into<String>) -> Result<()> {
        self.inner.logins.submit_code(user, code)
    }

    pub fn submit_password(&self, user: UserId, password: impl Into<String>) -> Result<()> {
        self.inner.logins.submit_password(user, password)
    }

    pub fn is_login_in_progress(&self, user: UserId) -> bool {
        self.inner.logins.is_in_progress(user)
    }

    pub fn login_stage(&self, user: UserId) -> Option<LoginStage> {
        self.inner.logins.stage(user)
    }

    pub fn login_qr_token(&self, user: UserId) -> Option<QrToken> {
        self.inner.logins.qr_token(user)
    }

    pub async fn cancel_login(&self, user: UserId) -> bool {
        self.inner.logins.cancel(user).await
    }
}

fn settle_success<T>(handle: &ClientHandle, value: T) -> T {
    handle.record_success();
    handle.touch();
    value
}
