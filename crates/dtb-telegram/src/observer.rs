use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use dtb_core::{
    domain::ChatId,
    errors::Error,
    formatting::escape_html,
    messaging::MessagingPort,
    mtproto::LoginObserver,
    protocol::QrToken,
};

use crate::handlers::describe_error;

/// Reports login progress back into the chat that started it.
pub struct ChatLoginObserver {
    messenger: Arc<dyn MessagingPort>,
    chat_id: ChatId,
}

impl ChatLoginObserver {
    pub fn new(messenger: Arc<dyn MessagingPort>, chat_id: ChatId) -> Self {
        Self { messenger, chat_id }
    }

    async fn reply(&self, html: &str) {
        if let Err(e) = self.messenger.send_html(self.chat_id, html).await {
            warn!(chat_id = self.chat_id.0, error = %e, "failed to send login update");
        }
    }
}

#[async_trait]
impl LoginObserver for ChatLoginObserver {
    async fn on_qr_issued(&self, qr: &QrToken) {
        let html = format!(
            "Open this link on a device where Telegram is logged in, or scan it as a QR code:\n\
<code>{}</code>\n\nValid until {} UTC.",
            escape_html(&qr.login_url()),
            qr.expires_at.format("%H:%M:%S"),
        );
        self.reply(&html).await;
    }

    async fn on_password_requested(&self, hint: Option<String>) {
        let mut html =
            "Two-step verification is enabled. Send your cloud password with /tg_password &lt;password&gt;."
                .to_string();
        if let Some(hint) = hint.filter(|h| !h.is_empty()) {
            html.push_str(&format!("\nHint: <i>{}</i>", escape_html(&hint)));
        }
        self.reply(&html).await;
    }

    async fn on_success(&self) {
        self.reply("Telegram account connected. Use /tg_channels to pick channels.")
            .await;
    }

    async fn on_error(&self, err: &Error) {
        let html = format!("Login failed. {}", describe_error(err));
        self.reply(&html).await;
    }
}
