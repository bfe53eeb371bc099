use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::{
    domain::UserId,
    errors::Error,
    mtproto::{
        handle::{safely_disconnect, ClientHandle, ConnectReason},
        keepalive::KeepAliveSupervisor,
    },
    protocol::{ProtocolClient, ProtocolConnector},
    store::SessionStore,
    utils::lock,
    Result,
};

/// Per-user async locks. Serializes creation and teardown of one user's handle.
///
/// An entry lives only while someone holds or waits for it.
#[derive(Default)]
struct UserLocks {
    inner: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

impl UserLocks {
    async fn lock_user(&self, user: UserId) -> UserGuard<'_> {
        let mutex = lock(&self.inner)
            .entry(user)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        UserGuard {
            locks: self,
            user,
            guard: Some(mutex.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.inner).len()
    }
}

struct UserGuard<'a> {
    locks: &'a UserLocks,
    user: UserId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        let mut map = lock(&self.locks.inner);
        // Release under the map lock so no waiter can clone the entry in between.
        drop(self.guard.take());
        if map.get(&self.user).is_some_and(|m| Arc::strong_count(m) == 1) {
            map.remove(&self.user);
        }
    }
}

/// Cache of live client handles, at most one per user.
///
/// Every path that creates or tears down a handle holds that user's lock, and
/// teardown disconnects before the entry leaves the map.
pub struct ClientRegistry {
    store: Arc<dyn SessionStore>,
    connector: Arc<dyn ProtocolConnector>,
    keepalive: Arc<KeepAliveSupervisor>,
    idle_ttl: Option<Duration>,
    cleanup_interval: Option<Duration>,
    handles: Mutex<HashMap<UserId, Arc<ClientHandle>>>,
    user_locks: UserLocks,
    cleanup_started: AtomicBool,
}

impl ClientRegistry {
    pub fn new(
        store: Arc<dyn SessionStore>,
        connector: Arc<dyn ProtocolConnector>,
        keepalive: Arc<KeepAliveSupervisor>,
        idle_ttl: Option<Duration>,
        cleanup_interval: Option<Duration>,
    ) -> Self {
        Self {
            store,
            connector,
            keepalive,
            idle_ttl,
            cleanup_interval,
            handles: Mutex::new(HashMap::new()),
            user_locks: UserLocks::default(),
            cleanup_started: AtomicBool::new(false),
        }
    }

    pub fn keepalive(&self) -> &KeepAliveSupervisor {
        &self.keepalive
    }

    /// Cached handle without touching it or checking the connection.
    pub fn peek(&self, user: UserId) -> Option<Arc<ClientHandle>> {
        lock(&self.handles).get(&user).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.handles).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return a connected handle for `user`, reconnecting or creating one as needed.
    pub async fn get_or_create(self: &Arc<Self>, user: UserId) -> Result<Arc<ClientHandle>> {
        let _guard = self.user_locks.lock_user(user).await;

        if let Some(handle) = self.peek(user) {
            if handle.is_connected() {
                handle.touch();
                return Ok(handle);
            }
            match handle.connect(user, ConnectReason::Reconnect).await {
                Ok(()) => {
                    handle.touch();
                    return Ok(handle);
                }
                Err(e) => {
                    warn!(user_id = %user, error = %e, "failed to reconnect cached telegram client");
                    self.teardown_locked(user, &handle).await;
                }
            }
        }

        let session = self
            .store
            .get(user)
            .await?
            .and_then(|r| r.protocol_session)
            .filter(|s| !s.is_empty())
            .ok_or(Error::NotAuthenticated)?;

        let client = self.connector.create(Some(&session))?;
        let handle = Arc::new(ClientHandle::new(client));
        if let Err(e) = handle.connect(user, ConnectReason::Initial).await {
            safely_disconnect(handle.client().as_ref()).await;
            return Err(e.into());
        }

        self.insert_locked(user, handle.clone());
        Ok(handle)
    }

    /// Adopt an already-connected, authorized client (fresh login), replacing any previous handle.
    pub async fn install(
        self: &Arc<Self>,
        user: UserId,
        client: Arc<dyn ProtocolClient>,
    ) -> Arc<ClientHandle> {
        let _guard = self.user_locks.lock_user(user).await;
        if let Some(old) = self.peek(user) {
            self.teardown_locked(user, &old).await;
        }
        let handle = Arc::new(ClientHandle::new(client));
        self.insert_locked(user, handle.clone());
        handle
    }

    /// Disconnect and forget the user's handle and keepalive. Returns whether one existed.
    pub async fn reset(&self, user: UserId) -> bool {
        let _guard = self.user_locks.lock_user(user).await;
        match self.peek(user) {
            Some(handle) => {
                self.teardown_locked(user, &handle).await;
                true
            }
            None => {
                self.keepalive.stop(user);
                false
            }
        }
    }

    /// Close every handle idle for longer than the TTL. Returns the evicted users.
    pub async fn evict_idle(&self) -> Vec<UserId> {
        let Some(ttl) = self.idle_ttl else {
            return Vec::new();
        };

        let candidates: Vec<UserId> = lock(&self.handles)
            .iter()
            .filter(|(_, h)| h.idle_for() > ttl)
            .map(|(u, _)| *u)
            .collect();

        let mut evicted = Vec::new();
        for user in candidates {
            let _guard = self.user_locks.lock_user(user).await;
            // Re-check: the handle may have been used or replaced meanwhile.
            let Some(handle) = self.peek(user) else {
                continue;
            };
            if handle.idle_for() <= ttl {
                continue;
            }
            info!(user_id = %user, "closing idle telegram client");
            self.teardown_locked(user, &handle).await;
            evicted.push(user);
        }
        evicted
    }

    fn insert_locked(self: &Arc<Self>, user: UserId, handle: Arc<ClientHandle>) {
        handle.touch();
        lock(&self.handles).insert(user, handle.clone());
        self.keepalive.start(user, handle);
        self.ensure_cleanup();
    }

    async fn teardown_locked(&self, user: UserId, handle: &Arc<ClientHandle>) {
        self.keepalive.stop(user);
        safely_disconnect(handle.client().as_ref()).await;
        let mut handles = lock(&self.handles);
        if handles.get(&user).is_some_and(|h| Arc::ptr_eq(h, handle)) {
            handles.remove(&user);
        }
    }

    /// Start the idle sweep once, on first handle creation. Stops when the registry is dropped.
    fn ensure_cleanup(self: &Arc<Self>) {
        let (Some(period), Some(_)) = (self.cleanup_interval, self.idle_ttl) else {
            return;
        };
        if self.cleanup_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(registry) = weak.upgrade() else {
                    return;
                };
                registry.evict_idle().await;
            }
        });
    }
}
