//! Outgoing Bot API messaging.

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    Result,
};

/// Port for replies to the bot's own chats. Implemented by the Bot API adapter.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef>;
}
