//! Supervision of per-user secondary-protocol (MTProto) clients.

use std::time::Duration;

pub mod handle;
pub mod keepalive;
pub mod login;
pub mod manager;
pub mod registry;

pub use handle::{ClientHandle, ClientStats};
pub use keepalive::{KeepAliveConfig, KeepAliveState};
pub use login::{LoginMethod, LoginObserver, LoginStage};
pub use manager::{ChannelSummary, ClientManager};

#[derive(Clone, Debug)]
pub struct ClientManagerConfig {
    pub max_concurrent_requests: usize,
    /// Consecutive-error count at which a warning is logged once.
    pub error_alert_threshold: u32,
    /// Idle time after which a handle is closed. `None` keeps handles forever.
    pub client_ttl: Option<Duration>,
    /// Period of the idle sweep. `None` disables it.
    pub cleanup_interval: Option<Duration>,
    /// `None` disables keepalive probes.
    pub keepalive: Option<KeepAliveConfig>,
}

impl Default for ClientManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 3,
            error_alert_threshold: 5,
            client_ttl: Some(Duration::from_secs(30 * 60)),
            cleanup_interval: Some(Duration::from_secs(5 * 60)),
            keepalive: KeepAliveConfig::from_raw(60_000, 300_000, None, None, 3, 3),
        }
    }
}
