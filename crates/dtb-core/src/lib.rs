//! Core of the delivery bot: supervision of per-user Telegram (MTProto)
//! clients, retry/backoff for outbound calls, and the backend API client.
//!
//! The crate is framework-agnostic. The Bot API and the MTProto stack live
//! behind ports implemented in adapter crates.

pub mod api;
pub mod classify;
pub mod config;
pub mod deferred;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod limiter;
pub mod logging;
pub mod messaging;
pub mod mtproto;
pub mod protocol;
pub mod retry;
pub mod store;
mod utils;

#[cfg(test)]
mod testing;

pub use errors::{Error, Result};
