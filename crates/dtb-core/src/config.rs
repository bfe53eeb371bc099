use std::{env, path::PathBuf, time::Duration};

use crate::{
    api::ApiConfig,
    errors::Error,
    mtproto::{keepalive::KeepAliveConfig, ClientManagerConfig},
    protocol::ProtocolCredentials,
    retry::RetryPolicy,
    Result,
};

const DEFAULT_API_URL: &str = "http://vrp.logdep.ru/dl/storage";

/// Typed configuration, read from environment variables.
#[derive(Clone, Debug)]
pub struct Config {
    // Bot
    pub telegram_token: String,
    pub session_store_path: PathBuf,

    // Delivery backend
    pub api: ApiConfig,

    // Bot API messaging
    pub messaging_retry: RetryPolicy,

    // Protocol credentials handed to the connector
    pub tg_api_id: Option<i32>,
    pub tg_api_hash: Option<String>,

    // Client manager (limiter, registry, keepalive)
    pub client: ClientManagerConfig,
}

impl Config {
    /// Load from the process environment, after merging a `.env` file if present.
    pub fn load() -> Result<Self> {
        // Existing variables win over `.env`.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(&lookup);

        let telegram_token = env.str("TELEGRAM_TOKEN").unwrap_or_default();
        if telegram_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_TOKEN environment variable is required".to_string(),
            ));
        }
        let session_store_path = PathBuf::from(
            env.str("SESSION_STORE_PATH")
                .unwrap_or_else(|| "sessions.json".to_string()),
        );

        let api = ApiConfig {
            base_url: env
                .str("API_URL")
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            timeout: env.millis("API_TIMEOUT_MS").unwrap_or(Duration::from_secs(30)),
            retry: env.retry_policy("API_RETRY", 5, 750, 5000),
        };
        let messaging_retry = env.retry_policy("TELEGRAM_RETRY", 5, 500, 5000);

        let tg_api_id = env.parse::<i32>("TG_API_ID");
        let tg_api_hash = env.str("TG_API_HASH").filter(|s| !s.trim().is_empty());

        let keepalive = KeepAliveConfig::from_raw(
            env.parse::<u64>("TELEGRAM_KEEPALIVE_MIN_MS").unwrap_or(60_000),
            env.parse::<u64>("TELEGRAM_KEEPALIVE_MAX_MS").unwrap_or(300_000),
            env.parse::<f64>("TELEGRAM_KEEPALIVE_BACKOFF_FACTOR"),
            env.parse::<f64>("TELEGRAM_KEEPALIVE_RECOVERY_FACTOR"),
            env.parse::<u32>("TELEGRAM_KEEPALIVE_FAILURE_THRESHOLD").unwrap_or(3),
            env.parse::<u32>("TELEGRAM_KEEPALIVE_SUCCESS_THRESHOLD").unwrap_or(3),
        );

        let client = ClientManagerConfig {
            max_concurrent_requests: env
                .parse::<usize>("TELEGRAM_MAX_CONCURRENT_REQUESTS")
                .unwrap_or(3)
                .max(1),
            error_alert_threshold: env
                .parse::<u32>("TELEGRAM_ERROR_ALERT_THRESHOLD")
                .unwrap_or(5)
                .max(1),
            client_ttl: positive_millis(
                env.parse::<u64>("TELEGRAM_CLIENT_TTL_MS").unwrap_or(1_800_000),
            ),
            cleanup_interval: positive_millis(
                env.parse::<u64>("TELEGRAM_CLIENT_CLEANUP_MS").unwrap_or(300_000),
            ),
            keepalive,
        };

        Ok(Self {
            telegram_token,
            session_store_path,
            api,
            messaging_retry,
            tg_api_id,
            tg_api_hash,
            client,
        })
    }

    /// `TG_API_ID` and `TG_API_HASH`, both required to build protocol clients.
    pub fn protocol_credentials(&self) -> Result<ProtocolCredentials> {
        match (self.tg_api_id, &self.tg_api_hash) {
            (Some(api_id), Some(api_hash)) => Ok(ProtocolCredentials {
                api_id,
                api_hash: api_hash.clone(),
            }),
            _ => Err(Error::Config(
                "TG_API_ID and TG_API_HASH environment variables are required".to_string(),
            )),
        }
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn str(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.str(key).and_then(|s| s.trim().parse::<T>().ok())
    }

    fn millis(&self, key: &str) -> Option<Duration> {
        self.parse::<u64>(key).map(Duration::from_millis)
    }

    /// `{prefix}_ATTEMPTS`, `{prefix}_BASE_DELAY_MS`, `{prefix}_MAX_DELAY_MS`.
    fn retry_policy(&self, prefix: &str, attempts: u32, base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::new(
            self.parse::<u32>(&format!("{prefix}_ATTEMPTS"))
                .unwrap_or(attempts),
            self.millis(&format!("{prefix}_BASE_DELAY_MS"))
                .unwrap_or(Duration::from_millis(base_ms)),
            self.millis(&format!("{prefix}_MAX_DELAY_MS"))
                .unwrap_or(Duration::from_millis(max_ms)),
        )
    }
}

fn positive_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
