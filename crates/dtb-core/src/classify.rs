//! Maps protocol failures onto recovery actions.
//!
//! The signature tables are the only place that knows how the protocol stack
//! phrases its failures. Structured RPC codes are matched exactly; messages
//! are matched by case-insensitive substring.

use crate::protocol::ProtocolError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connectivity problem: reset the client and retry once.
    Transient,
    /// Credential/session corruption: log the user out, never retry.
    FatalAuth,
    /// Anything else: propagate unchanged.
    Other,
}

const FATAL_AUTH_CODES: &[&str] = &[
    "AUTH_KEY_UNREGISTERED",
    "AUTH_KEY_INVALID",
    "AUTH_KEY_DUPLICATED",
    "SESSION_REVOKED",
    "SESSION_EXPIRED",
];

const FATAL_AUTH_MESSAGES: &[&str] = &[
    "invalid auth key",
    "auth_key_unused",
    "msg_key doesn't match",
    "security error",
];

const TRANSIENT_CODES: &[&str] = &["TIMEOUT"];

const TRANSIENT_MESSAGES: &[&str] = &["timeout", "not connected", "handshake failed"];

pub fn classify(err: &ProtocolError) -> ErrorClass {
    if matches_signature(err, FATAL_AUTH_CODES, FATAL_AUTH_MESSAGES) {
        return ErrorClass::FatalAuth;
    }
    if matches_signature(err, TRANSIENT_CODES, TRANSIENT_MESSAGES) {
        return ErrorClass::Transient;
    }
    ErrorClass::Other
}

fn matches_signature(err: &ProtocolError, codes: &[&str], messages: &[&str]) -> bool {
    if let Some(code) = err.code.as_deref() {
        if codes.iter().any(|c| code.eq_ignore_ascii_case(c)) {
            return true;
        }
    }
    let message = err.message.to_lowercase();
    messages.iter().any(|m| message.contains(m))
}
