//! JSON-over-HTTP client for the delivery backend.
//!
//! Every request is a single POST to the base URL with a one-key envelope
//! (`{"TL_Mobile_...Request": {...}}`). Transport failures and a fixed set of
//! HTTP statuses are retried with backoff; an expired backend session is
//! refreshed once per call when credentials are available.

use std::{fmt, time::Duration};

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    errors::Error,
    retry::{RetryDecision, RetryExecutor, RetryPolicy},
    Result,
};

const RETRYABLE_STATUS: &[u16] = &[408, 429, 500, 502, 503, 504];
const DEVICE_INFO: &str = "Telegram Bot Device";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

/// Backend login, used to obtain a fresh session id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub client_code: String,
    pub login: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionResponse {
    pub data: Value,
    /// Set when the backend session expired and was refreshed during the call.
    pub new_session_id: Option<String>,
}

impl SessionResponse {
    pub fn session_updated(&self) -> bool {
        self.new_session_id.is_some()
    }
}

#[derive(Debug)]
enum AttemptError {
    Status { status: u16, body: String },
    Transport(reqwest::Error),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Status { status, body } => write!(f, "status {status}: {body}"),
            AttemptError::Transport(e) => write!(f, "{e}"),
        }
    }
}

impl AttemptError {
    fn retry_decision(&self) -> RetryDecision {
        let retryable = match self {
            AttemptError::Status { status, .. } => is_retryable_status(*status),
            AttemptError::Transport(e) => e.is_timeout() || e.is_connect(),
        };
        if retryable {
            RetryDecision::Retry
        } else {
            RetryDecision::Fail
        }
    }
}

impl From<AttemptError> for Error {
    fn from(err: AttemptError) -> Self {
        let status = match &err {
            AttemptError::Status { status, .. } => Some(*status),
            AttemptError::Transport(e) => e.status().map(|s| s.as_u16()),
        };
        Error::Http {
            status,
            message: err.to_string(),
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS.contains(&status)
}

/// True when any response envelope reports `Exception` / `SessionNotFound`.
pub fn is_session_expired(data: &Value) -> bool {
    let Some(envelope) = data.as_object() else {
        return false;
    };
    envelope.values().any(|body| {
        body.get("ErrorCode").and_then(Value::as_str) == Some("Exception")
            && body.get("ErrorDescription").and_then(Value::as_str) == Some("SessionNotFound")
    })
}

#[derive(Clone, Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryExecutor,
}

impl ApiClient {
    pub fn new(cfg: &ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::Http {
                status: None,
                message: format!("failed to build http client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: cfg.base_url.clone(),
            retry: RetryExecutor::new(cfg.retry),
        })
    }

    /// POST `payload` and return the decoded JSON body, retrying transient failures.
    pub async fn post(&self, payload: &Value) -> Result<Value> {
        let data = self
            .retry
            .run(
                "api.post",
                || self.post_once(payload),
                AttemptError::retry_decision,
            )
            .await?;
        Ok(data)
    }

    async fn post_once(&self, payload: &Value) -> std::result::Result<Value, AttemptError> {
        let resp = self
            .http
            .post(&self.base_url)
            .json(payload)
            .send()
            .await
            .map_err(AttemptError::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AttemptError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<Value>().await.map_err(AttemptError::Transport)
    }

    /// Log in to the backend and return the new session id.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<String> {
        let data = self.post(&login_request(credentials)).await?;
        data.pointer("/TL_Mobile_LoginResponse/SessionId")
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::External("backend login response carries no session id".to_string())
            })
    }

    /// POST a session-scoped request built by `build(session_id)`.
    ///
    /// If the backend reports an expired session and `credentials` are given,
    /// re-authenticates once and repeats the request with the new session id.
    pub async fn post_with_session<B>(
        &self,
        session_id: &str,
        credentials: Option<&Credentials>,
        build: B,
    ) -> Result<SessionResponse>
    where
        B: Fn(&str) -> Value,
    {
        let data = self.post(&build(session_id)).await?;
        if !is_session_expired(&data) {
            return Ok(SessionResponse {
                data,
                new_session_id: None,
            });
        }

        let Some(credentials) = credentials else {
            warn!("backend session expired and no credentials were provided");
            return Err(Error::External(
                "backend session expired and no credentials provided".to_string(),
            ));
        };
        let new_session_id = self.authenticate(credentials).await?;
        info!("backend session refreshed");
        let data = self.post(&build(&new_session_id)).await?;
        Ok(SessionResponse {
            data,
            new_session_id: Some(new_session_id),
        })
    }
}

fn login_request(credentials: &Credentials) -> Value {
    json!({
        "TL_Mobile_LoginRequest": {
            "ClientCode": credentials.client_code,
            "DeviceInfo": DEVICE_INFO,
            "Login": credentials.login,
            "Password": credentials.password,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{body_partial_json, method},
        Mock, MockServer, ResponseTemplate,
    };

    #[test]
    fn retryable_statuses() {
        for s in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(s), "{s}");
        }
        for s in [200, 400, 401, 403, 404, 501] {
            assert!(!is_retryable_status(s), "{s}");
        }
    }

    #[test]
    fn status_errors_drive_retry_decision() {
        let busy = AttemptError::Status {
            status: 503,
            body: String::new(),
        };
        assert_eq!(busy.retry_decision(), RetryDecision::Retry);

        let denied = AttemptError::Status {
            status: 403,
            body: "forbidden".into(),
        };
        assert_eq!(denied.retry_decision(), RetryDecision::Fail);
        match Error::from(denied) {
            Error::Http { status, message } => {
                assert_eq!(status, Some(403));
                assert_eq!(message, "status 403: forbidden");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn detects_expired_session_in_any_envelope() {
        let expired = json!({
            "TL_Mobile_GetOrdersResponse": {
                "ErrorCode": "Exception",
                "ErrorDescription": "SessionNotFound"
            }
        });
        assert!(is_session_expired(&expired));

        let other_error = json!({
            "TL_Mobile_EnumRoutesResponse": {
                "ErrorCode": "Exception",
                "ErrorDescription": "Something else"
            }
        });
        assert!(!is_session_expired(&other_error));
        assert!(!is_session_expired(&json!({ "TL_Mobile_EnumRoutesResponse": { "Routes": [] } })));
        assert!(!is_session_expired(&json!("SessionNotFound")));
    }

    #[test]
    fn login_request_envelope() {
        let creds = Credentials {
            client_code: "C1".into(),
            login: "courier".into(),
            password: "pw".into(),
        };
        assert_eq!(
            login_request(&creds),
            json!({
                "TL_Mobile_LoginRequest": {
                    "ClientCode": "C1",
                    "DeviceInfo": "Telegram Bot Device",
                    "Login": "courier",
                    "Password": "pw"
                }
            })
        );
    }

    #[test]
    fn client_builds_from_config() {
        let cfg = ApiConfig {
            base_url: "http://localhost:9/storage".into(),
            timeout: Duration::from_secs(1),
            retry: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
        };
        let client = ApiClient::new(&cfg).unwrap();
        assert_eq!(client.retry.policy().max_attempts, 1);
    }

    fn client_for(server: &MockServer) -> ApiClient {
        ApiClient::new(&ApiConfig {
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
        })
        .unwrap()
    }

    fn orders_request(session_id: &str) -> Value {
        json!({ "TL_Mobile_GetOrdersRequest": { "SessionId": session_id } })
    }

    fn courier() -> Credentials {
        Credentials {
            client_code: "C1".into(),
            login: "courier".into(),
            password: "pw".into(),
        }
    }

    #[tokio::test]
    async fn expired_session_is_refreshed_after_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(orders_request("old-sid")))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(orders_request("old-sid")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "TL_Mobile_GetOrdersResponse": {
                    "ErrorCode": "Exception",
                    "ErrorDescription": "SessionNotFound"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "TL_Mobile_LoginRequest": { "Login": "courier" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "TL_Mobile_LoginResponse": { "SessionId": "new-sid" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(orders_request("new-sid")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "TL_Mobile_GetOrdersResponse": { "Orders": [] }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = client_for(&server);
        let resp = api
            .post_with_session("old-sid", Some(&courier()), orders_request)
            .await
            .unwrap();

        assert_eq!(resp.new_session_id.as_deref(), Some("new-sid"));
        assert_eq!(
            resp.data,
            json!({ "TL_Mobile_GetOrdersResponse": { "Orders": [] } })
        );
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn non_retryable_status_fails_on_first_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .post(&orders_request("sid"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http { status: Some(403), .. }), "{err:?}");
    }

    #[tokio::test]
    async fn expired_session_without_credentials_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "TL_Mobile_GetOrdersResponse": {
                    "ErrorCode": "Exception",
                    "ErrorDescription": "SessionNotFound"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .post_with_session("sid", None, orders_request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::External(_)), "{err:?}");
    }
}
