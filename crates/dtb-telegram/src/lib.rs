//! Telegram Bot API adapter (teloxide).
//!
//! Implements the core `MessagingPort` over the Bot API and hosts the command
//! handlers that drive the per-user MTProto client manager.

use async_trait::async_trait;
use teloxide::{prelude::*, types::ParseMode, RequestError};

pub mod handlers;
pub mod observer;
pub mod router;

use dtb_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::MessagingPort,
    retry::{RetryDecision, RetryExecutor, RetryPolicy},
    Result,
};

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
    retry: RetryExecutor,
}

impl TelegramMessenger {
    pub fn new(bot: Bot, policy: RetryPolicy) -> Self {
        Self {
            bot,
            retry: RetryExecutor::new(policy),
        }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn map_err(e: RequestError) -> Error {
        Error::External(format!("telegram error: {e}"))
    }

    async fn send_once(
        &self,
        chat_id: ChatId,
        text: &str,
        mode: Option<ParseMode>,
    ) -> std::result::Result<Message, RequestError> {
        let mut req = self.bot.send_message(Self::tg_chat(chat_id), text.to_string());
        if let Some(mode) = mode {
            req = req.parse_mode(mode);
        }
        req.await
    }

    async fn send(&self, chat_id: ChatId, text: &str, mode: Option<ParseMode>) -> Result<MessageRef> {
        let msg = self
            .retry
            .run(
                "telegram.send_message",
                || self.send_once(chat_id, text, mode),
                retry_decision,
            )
            .await
            .map_err(Self::map_err)?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }
}

/// Flood-wait honors the server's delay; transport failures use backoff; API errors are final.
pub fn retry_decision(err: &RequestError) -> RetryDecision {
    match err {
        RequestError::RetryAfter(d) => RetryDecision::RetryAfter(*d),
        RequestError::Network(_) | RequestError::Io(_) => RetryDecision::Retry,
        _ => RetryDecision::Fail,
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.send(chat_id, html, Some(ParseMode::Html)).await
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        self.send(chat_id, text, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use teloxide::ApiError;

    #[test]
    fn retry_after_uses_server_delay() {
        let err = RequestError::RetryAfter(Duration::from_secs(3));
        assert_eq!(
            retry_decision(&err),
            RetryDecision::RetryAfter(Duration::from_secs(3))
        );
    }

    #[test]
    fn io_errors_are_retried() {
        let err = RequestError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(retry_decision(&err), RetryDecision::Retry);
    }

    #[test]
    fn api_errors_are_final() {
        assert_eq!(
            retry_decision(&RequestError::Api(ApiError::BotBlocked)),
            RetryDecision::Fail
        );
    }
}
