use crate::{
    classify::{classify, ErrorClass},
    protocol::ProtocolError,
};

/// Core error type.
///
/// Callers only ever see this taxonomy; protocol-specific error shapes are
/// wrapped so the bot layer can decide between "re-authenticate" and
/// "try again later" without inspecting them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {message}")]
    Http {
        status: Option<u16>,
        message: String,
    },

    #[error("telegram session not found")]
    NotAuthenticated,

    #[error("login already in progress")]
    LoginInProgress,

    #[error("login not started")]
    LoginNotStarted,

    #[error("telegram session is no longer valid: {0}")]
    FatalAuth(ProtocolError),

    #[error("telegram connection failed: {0}")]
    Transient(ProtocolError),

    #[error("telegram error: {0}")]
    Protocol(ProtocolError),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// True when the user has to log in again before retrying.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, Error::FatalAuth(_) | Error::NotAuthenticated)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match classify(&err) {
            ErrorClass::FatalAuth => Error::FatalAuth(err),
            ErrorClass::Transient => Error::Transient(err),
            ErrorClass::Other => Error::Protocol(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
