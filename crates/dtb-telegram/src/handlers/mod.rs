//! Telegram update handlers.
//!
//! Commands drive the MTProto login and channel operations; plain text is
//! consumed as login input while a login is in progress.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use dtb_core::{domain::UserId, errors::Error, formatting::escape_html};

use crate::router::AppState;

mod commands;
mod text;

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    let Some(text) = msg.text() else {
        return Ok(());
    };

    // Login replies must reach the handshake in the order they were sent.
    let _guard = state.chat_locks.lock_chat(chat_id).await;
    if text.starts_with('/') {
        return commands::handle_command(bot, msg, state).await;
    }
    text::handle_text(bot, msg, state).await
}

pub(crate) fn user_of(msg: &Message) -> Option<UserId> {
    msg.from().map(|u| UserId(u.id.0 as i64))
}

/// User-facing description of a core error, in Telegram HTML.
pub(crate) fn describe_error(err: &Error) -> String {
    match err {
        e if e.requires_reauth() => {
            "Your Telegram session is not active. Log in with /tg_login &lt;phone&gt; or /tg_qr."
                .to_string()
        }
        Error::LoginInProgress => {
            "A login is already in progress. Send the code, or /tg_cancel to start over."
                .to_string()
        }
        Error::LoginNotStarted => {
            "No login in progress. Start with /tg_login &lt;phone&gt; or /tg_qr.".to_string()
        }
        Error::Transient(_) => "Telegram is not reachable right now. Try again later.".to_string(),
        other => format!("Error: <code>{}</code>", escape_html(&other.to_string())),
    }
}
