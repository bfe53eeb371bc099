//! Adaptive per-user keepalive.
//!
//! Each user gets its own self-rescheduling loop: the next probe is scheduled
//! `interval` after the previous one finished. Failures shrink the interval
//! (bounded by `min_interval`), a streak of `success_threshold` successes grows
//! it (bounded by `max_interval`).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    classify::{classify, ErrorClass},
    domain::UserId,
    mtproto::handle::ClientHandle,
    protocol::ProtocolError,
    utils::lock,
};

const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
const DEFAULT_RECOVERY_FACTOR: f64 = 1.2;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KeepAliveConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Divisor applied on failure. Always > 1.
    pub backoff_factor: f64,
    /// Multiplier applied after a success streak. Always > 1.
    pub recovery_factor: f64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl KeepAliveConfig {
    /// Normalize raw settings. `min_ms == 0` disables keepalive entirely.
    pub fn from_raw(
        min_ms: u64,
        max_ms: u64,
        backoff_factor: Option<f64>,
        recovery_factor: Option<f64>,
        failure_threshold: u32,
        success_threshold: u32,
    ) -> Option<Self> {
        if min_ms == 0 {
            return None;
        }
        let max_ms = if max_ms == 0 { min_ms } else { max_ms.max(min_ms) };
        Some(Self {
            min_interval: Duration::from_millis(min_ms),
            max_interval: Duration::from_millis(max_ms),
            backoff_factor: backoff_factor
                .filter(|f| f.is_finite() && *f > 1.0)
                .unwrap_or(DEFAULT_BACKOFF_FACTOR),
            recovery_factor: recovery_factor
                .filter(|f| f.is_finite() && *f > 1.0)
                .unwrap_or(DEFAULT_RECOVERY_FACTOR),
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAliveState {
    pub interval: Duration,
    pub failures: u32,
    pub successes: u32,
}

impl KeepAliveState {
    pub fn new(cfg: &KeepAliveConfig) -> Self {
        Self {
            interval: cfg.min_interval,
            failures: 0,
            successes: 0,
        }
    }

    fn clamped(mut self, cfg: &KeepAliveConfig) -> Self {
        self.interval = self.interval.clamp(cfg.min_interval, cfg.max_interval);
        self
    }

    /// Returns true when the success streak grew the interval.
    pub fn record_success(&mut self, cfg: &KeepAliveConfig) -> bool {
        self.successes += 1;
        self.failures = 0;
        if self.successes < cfg.success_threshold {
            return false;
        }
        let grown = (self.interval.as_millis() as f64 * cfg.recovery_factor).floor() as u64;
        self.interval = Duration::from_millis(grown).min(cfg.max_interval);
        self.successes = 0;
        true
    }

    /// Returns true once consecutive failures reached the failure threshold.
    pub fn record_failure(&mut self, cfg: &KeepAliveConfig) -> bool {
        self.failures += 1;
        self.successes = 0;
        let shrunk = (self.interval.as_millis() as f64 / cfg.backoff_factor).floor() as u64;
        self.interval = Duration::from_millis(shrunk).max(cfg.min_interval);
        self.failures >= cfg.failure_threshold
    }
}

/// Invoked when a probe reports a fatal auth error. The loop stops afterwards.
#[async_trait]
pub trait FatalAuthHandler: Send + Sync {
    async fn on_fatal_auth(&self, user: UserId, err: ProtocolError);
}

struct LoopEntry {
    cancel: CancellationToken,
    state: Arc<Mutex<KeepAliveState>>,
}

pub struct KeepAliveSupervisor {
    cfg: Option<KeepAliveConfig>,
    error_alert_threshold: u32,
    on_fatal: Arc<dyn FatalAuthHandler>,
    loops: Mutex<HashMap<UserId, LoopEntry>>,
}

impl KeepAliveSupervisor {
    pub fn new(
        cfg: Option<KeepAliveConfig>,
        error_alert_threshold: u32,
        on_fatal: Arc<dyn FatalAuthHandler>,
    ) -> Self {
        Self {
            cfg,
            error_alert_threshold: error_alert_threshold.max(1),
            on_fatal,
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) the loop for `user`, probing through `handle`.
    pub fn start(&self, user: UserId, handle: Arc<ClientHandle>) {
        let Some(cfg) = self.cfg else {
            return;
        };

        let mut loops = lock(&self.loops);
        let state = match loops.remove(&user) {
            Some(old) => {
                old.cancel.cancel();
                let prev = *lock(&old.state);
                prev.clamped(&cfg)
            }
            None => KeepAliveState::new(&cfg),
        };

        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(state));
        loops.insert(
            user,
            LoopEntry {
                cancel: cancel.clone(),
                state: state.clone(),
            },
        );
        drop(loops);

        let task = KeepAliveTask {
            user,
            handle,
            cfg,
            error_alert_threshold: self.error_alert_threshold,
            on_fatal: self.on_fatal.clone(),
            state,
            cancel,
        };
        tokio::spawn(task.run());
    }

    /// Stop the loop and drop its state. An in-flight probe finishes but is not rescheduled.
    pub fn stop(&self, user: UserId) {
        if let Some(entry) = lock(&self.loops).remove(&user) {
            entry.cancel.cancel();
        }
    }

    pub fn is_running(&self, user: UserId) -> bool {
        lock(&self.loops).contains_key(&user)
    }

    pub fn state(&self, user: UserId) -> Option<KeepAliveState> {
        lock(&self.loops).get(&user).map(|e| *lock(&e.state))
    }
}

struct KeepAliveTask {
    user: UserId,
    handle: Arc<ClientHandle>,
    cfg: KeepAliveConfig,
    error_alert_threshold: u32,
    on_fatal: Arc<dyn FatalAuthHandler>,
    state: Arc<Mutex<KeepAliveState>>,
    cancel: CancellationToken,
}

impl KeepAliveTask {
    async fn run(self) {
        loop {
            let interval = lock(&self.state).interval;
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(interval) => {}
            }

            if !self.handle.is_connected() {
                continue;
            }

            match self.handle.client().ping().await {
                Ok(()) => self.on_success(),
                Err(err) if classify(&err) == ErrorClass::FatalAuth => {
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    error!(user_id = %self.user, error = %err, "fatal telegram auth error in keepalive");
                    self.on_fatal.on_fatal_auth(self.user, err).await;
                    return;
                }
                Err(err) => self.on_failure(&err),
            }

            if self.cancel.is_cancelled() {
                return;
            }
        }
    }

    fn on_success(&self) {
        self.handle.record_success();
        let mut state = lock(&self.state);
        if state.record_success(&self.cfg) {
            debug!(
                user_id = %self.user,
                interval_ms = state.interval.as_millis() as u64,
                "keepalive interval relaxed"
            );
        }
    }

    fn on_failure(&self, err: &ProtocolError) {
        let (over_threshold, failures, interval) = {
            let mut state = lock(&self.state);
            let over = state.record_failure(&self.cfg);
            (over, state.failures, state.interval)
        };
        if over_threshold {
            warn!(user_id = %self.user, failures, "telegram keepalive failures");
        }
        let errors = self.handle.record_error();
        if errors == self.error_alert_threshold {
            warn!(user_id = %self.user, errors, "telegram keepalive errors reached alert threshold");
        }
        debug!(
            user_id = %self.user,
            interval_ms = interval.as_millis() as u64,
            error = %err,
            "telegram keepalive failed"
        );
    }
}
