use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;
use tracing::{error, info};

use crate::{
    domain::UserId,
    protocol::{ProtocolClient, ProtocolResult},
    utils::lock,
};

/// Connection diagnostics for one user's client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub reconnects: u32,
    pub consecutive_errors: u32,
    pub last_connect: Option<Duration>,
    pub last_dc_id: Option<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectReason {
    Initial,
    Reconnect,
}

impl fmt::Display for ConnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectReason::Initial => "initial",
            ConnectReason::Reconnect => "reconnect",
        })
    }
}

/// A live protocol client plus its bookkeeping. Owned by the registry.
pub struct ClientHandle {
    client: Arc<dyn ProtocolClient>,
    last_used: Mutex<Instant>,
    stats: Mutex<ClientStats>,
}

impl ClientHandle {
    pub fn new(client: Arc<dyn ProtocolClient>) -> Self {
        Self {
            client,
            last_used: Mutex::new(Instant::now()),
            stats: Mutex::new(ClientStats::default()),
        }
    }

    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(*lock(&self.last_used))
    }

    pub fn stats(&self) -> ClientStats {
        lock(&self.stats).clone()
    }

    pub fn record_success(&self) {
        lock(&self.stats).consecutive_errors = 0;
    }

    /// Bump the consecutive-error counter and return the new value.
    pub fn record_error(&self) -> u32 {
        let mut stats = lock(&self.stats);
        stats.consecutive_errors = stats.consecutive_errors.saturating_add(1);
        stats.consecutive_errors
    }

    pub async fn connect(&self, user: UserId, reason: ConnectReason) -> ProtocolResult<()> {
        let started = Instant::now();
        self.client.connect().await?;
        let latency = started.elapsed();
        let dc_id = self.client.dc_id();

        {
            let mut stats = lock(&self.stats);
            stats.last_connect = Some(latency);
            stats.last_dc_id = dc_id;
            stats.consecutive_errors = 0;
            if reason == ConnectReason::Reconnect {
                stats.reconnects += 1;
            }
        }

        info!(
            user_id = %user,
            %reason,
            dc_id = ?dc_id,
            latency_ms = latency.as_millis() as u64,
            "telegram client connected"
        );
        Ok(())
    }
}

/// Disconnect, logging instead of propagating failures.
pub(crate) async fn safely_disconnect(client: &dyn ProtocolClient) {
    if let Err(e) = client.disconnect().await {
        error!(error = %e, "error disconnecting telegram client");
    }
}
