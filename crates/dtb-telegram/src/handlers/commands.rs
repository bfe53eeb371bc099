use std::sync::Arc;

use teloxide::prelude::*;
use tracing::warn;

use dtb_core::{
    domain::{ChatId, UserId},
    formatting::{format_channels, format_status, SessionStatus},
    messaging::MessagingPort,
};

use crate::{handlers::describe_error, observer::ChatLoginObserver, router::AppState};

use super::user_of;

const HELP: &str = "<b>Telegram account</b>\n\n\
/tg_login &lt;phone&gt; - Log in with phone number and code\n\
/tg_qr - Log in by scanning a QR link\n\
/tg_code &lt;code&gt; - Submit the login code\n\
/tg_password &lt;password&gt; - Submit the 2FA password\n\
/tg_cancel - Cancel the login in progress\n\
/tg_channels - List your channels\n\
/tg_status - Show session status\n\
/tg_logout - Log out and forget channels";

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

/// Digits only, with an optional leading `+`.
fn normalize_phone(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    let digits = compact.strip_prefix('+').unwrap_or(&compact);
    if digits.len() < 5 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("+{digits}"))
}

async fn reply(state: &AppState, chat_id: ChatId, html: &str) {
    if let Err(e) = state.messenger.send_html(chat_id, html).await {
        warn!(chat_id = chat_id.0, error = %e, "failed to send reply");
    }
}

pub async fn handle_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = user_of(&msg) else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat_id = ChatId(msg.chat.id.0);
    let (cmd, arg) = parse_command(text);

    let html = match cmd.as_str() {
        "start" | "help" => HELP.to_string(),
        "tg_login" => match normalize_phone(&arg) {
            Some(phone) => start_login(&state, user, chat_id, Some(phone)),
            None => "Usage: /tg_login &lt;phone&gt;, e.g. /tg_login +79991234567".to_string(),
        },
        "tg_qr" => start_login(&state, user, chat_id, None),
        "tg_code" => {
            let code: String = arg.chars().filter(char::is_ascii_digit).collect();
            if code.is_empty() {
                "Usage: /tg_code &lt;code&gt;".to_string()
            } else {
                match state.manager.submit_code(user, code) {
                    Ok(()) => "Code received, checking...".to_string(),
                    Err(e) => describe_error(&e),
                }
            }
        }
        "tg_password" => {
            // The password should not linger in the chat history.
            let _ = bot.delete_message(msg.chat.id, msg.id).await;
            if arg.is_empty() {
                "Usage: /tg_password &lt;password&gt;".to_string()
            } else {
                match state.manager.submit_password(user, arg) {
                    Ok(()) => "Password received, checking...".to_string(),
                    Err(e) => describe_error(&e),
                }
            }
        }
        "tg_cancel" => {
            if state.manager.cancel_login(user).await {
                "Login cancelled.".to_string()
            } else {
                "No login in progress.".to_string()
            }
        }
        "tg_logout" => match state.manager.logout(user).await {
            Ok(()) => "Logged out. Channel selections were cleared.".to_string(),
            Err(e) => describe_error(&e),
        },
        "tg_channels" => match state.manager.list_channels(user).await {
            Ok(channels) => format_channels(&channels),
            Err(e) => describe_error(&e),
        },
        "tg_status" => {
            let logged_in = match state.manager.is_logged_in(user).await {
                Ok(v) => v,
                Err(e) => {
                    reply(&state, chat_id, &describe_error(&e)).await;
                    return Ok(());
                }
            };
            format_status(&SessionStatus {
                logged_in,
                login_stage: state.manager.login_stage(user),
                stats: state.manager.client_stats(user),
                keepalive: state.manager.keepalive_state(user),
            })
        }
        _ => "Unknown command. Send /help for the list.".to_string(),
    };

    reply(&state, chat_id, &html).await;
    Ok(())
}

fn start_login(state: &AppState, user: UserId, chat_id: ChatId, phone: Option<String>) -> String {
    let observer = Arc::new(ChatLoginObserver::new(state.messenger.clone(), chat_id));
    let started = match phone {
        Some(phone) => state.manager.start_login(user, phone, observer),
        None => state.manager.start_qr_login(user, observer),
    };
    match started {
        Ok(()) => "Connecting to Telegram... You will be asked for the next step here.".to_string(),
        Err(e) => describe_error(&e),
    }
}
