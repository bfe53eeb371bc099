use std::sync::Arc;

use teloxide::prelude::*;
use tracing::warn;

use dtb_core::{domain::ChatId, messaging::MessagingPort, mtproto::LoginStage};

use crate::{handlers::describe_error, router::AppState};

use super::user_of;

/// Plain text is login input while a login waits for it; otherwise it is ignored
/// with a hint.
pub async fn handle_text(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = user_of(&msg) else {
        return Ok(());
    };
    let Some(text) = msg.text().map(str::trim) else {
        return Ok(());
    };
    if text.is_empty() {
        return Ok(());
    }
    let chat_id = ChatId(msg.chat.id.0);

    let reply = match state.manager.login_stage(user) {
        Some(LoginStage::AwaitingPassword) => {
            let _ = bot.delete_message(msg.chat.id, msg.id).await;
            match state.manager.submit_password(user, text) {
                Ok(()) => "Password received, checking...".to_string(),
                Err(e) => describe_error(&e),
            }
        }
        Some(LoginStage::AwaitingCode) => {
            let code: String = text.chars().filter(char::is_ascii_digit).collect();
            if code.is_empty() {
                "Send the login code you received from Telegram.".to_string()
            } else {
                match state.manager.submit_code(user, code) {
                    Ok(()) => "Code received, checking...".to_string(),
                    Err(e) => describe_error(&e),
                }
            }
        }
        Some(_) => "Login is in progress, please wait.".to_string(),
        None => "Send /help to see what I can do.".to_string(),
    };

    if let Err(e) = state.messenger.send_html(chat_id, &reply).await {
        warn!(chat_id = chat_id.0, error = %e, "failed to send reply");
    }
    Ok(())
}
