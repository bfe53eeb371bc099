//! Ports for the secondary chat-protocol (MTProto) stack.
//!
//! The core never speaks the wire protocol itself. A [`ProtocolConnector`]
//! builds [`ProtocolClient`]s from a serialized session, and the core only
//! supervises their lifecycle: connect, probe, run operations, tear down.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};

/// Error surfaced by the protocol stack.
///
/// `code` carries the structured RPC error name when the stack exposes one
/// (e.g. `AUTH_KEY_UNREGISTERED`); `message` is the human-readable text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: Option<String>,
    pub message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ProtocolError {}

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// A dialog as returned by the protocol stack. Only channels are of interest here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dialog {
    pub id: Option<i64>,
    pub access_hash: Option<i64>,
    pub title: Option<String>,
    pub username: Option<String>,
    pub is_channel: bool,
}

/// Addressable channel: id plus the access credential required to post into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelPeer {
    pub channel_id: i64,
    pub access_hash: i64,
}

/// QR login challenge. The user scans `login_url()` from an authorized device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QrToken {
    pub token: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

impl QrToken {
    pub fn login_url(&self) -> String {
        format!("tg://login?token={}", URL_SAFE_NO_PAD.encode(&self.token))
    }
}

/// Inputs the authentication handshake pulls while it runs.
///
/// `code` and `password` suspend until the user replies; the handshake simply
/// awaits them. A cancelled login drops the whole handshake, so these futures
/// are abandoned rather than resolved with an error.
#[async_trait]
pub trait LoginPrompts: Send + Sync {
    async fn phone_number(&self) -> String;
    async fn code(&self) -> String;
    async fn password(&self, hint: Option<String>) -> String;
    async fn qr_issued(&self, qr: QrToken);
}

/// One live connection to the protocol network for one user.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn connect(&self) -> ProtocolResult<()>;
    async fn disconnect(&self) -> ProtocolResult<()>;
    fn is_connected(&self) -> bool;

    /// Datacenter the connection is bound to (diagnostics only).
    fn dc_id(&self) -> Option<i32>;

    /// Lightweight liveness probe (`updates.getState` on MTProto).
    async fn ping(&self) -> ProtocolResult<()>;

    /// Phone + code (+ optional 2FA password) handshake.
    async fn sign_in_with_phone(&self, prompts: &dyn LoginPrompts) -> ProtocolResult<()>;

    /// QR handshake; may issue several tokens before one is accepted.
    async fn sign_in_with_qr(&self, prompts: &dyn LoginPrompts) -> ProtocolResult<()>;

    /// Serialize the authorized session so it can be restored later.
    fn export_session(&self) -> ProtocolResult<String>;

    async fn dialogs(&self) -> ProtocolResult<Vec<Dialog>>;
    async fn send_message(&self, peer: ChannelPeer, text: &str) -> ProtocolResult<()>;
}

/// Application credentials the protocol network issues per app (`api_id` / `api_hash`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolCredentials {
    pub api_id: i32,
    pub api_hash: String,
}

/// Factory for protocol clients. `session` is `None` for a fresh, unauthorized client.
pub trait ProtocolConnector: Send + Sync {
    fn create(&self, session: Option<&str>) -> ProtocolResult<Arc<dyn ProtocolClient>>;
}
