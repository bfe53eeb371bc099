//! Telegram HTML rendering for bot replies.

use std::fmt::Write as _;

use crate::mtproto::{ChannelSummary, ClientStats, KeepAliveState, LoginStage};

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn format_channels(channels: &[ChannelSummary]) -> String {
    if channels.is_empty() {
        return "No channels available for this account.".to_string();
    }
    let mut out = String::from("<b>Your channels:</b>\n");
    for (idx, ch) in channels.iter().enumerate() {
        let _ = write!(out, "{}. {}", idx + 1, escape_html(&ch.title));
        if let Some(username) = &ch.username {
            let _ = write!(out, " (@{})", escape_html(username));
        }
        let _ = writeln!(out, " <code>{}</code>", ch.id);
    }
    out.trim_end().to_string()
}

/// Snapshot of a user's protocol session for `/tg_status`.
#[derive(Clone, Debug, Default)]
pub struct SessionStatus {
    pub logged_in: bool,
    pub login_stage: Option<LoginStage>,
    pub stats: Option<ClientStats>,
    pub keepalive: Option<KeepAliveState>,
}

pub fn format_status(status: &SessionStatus) -> String {
    let mut out = String::from("<b>Telegram account</b>\n");
    let session = if status.logged_in { "active" } else { "not logged in" };
    let _ = writeln!(out, "Session: {session}");

    if let Some(stage) = status.login_stage {
        let stage = match stage {
            LoginStage::Connecting => "connecting",
            LoginStage::AwaitingCode => "waiting for code",
            LoginStage::AwaitingQrScan => "waiting for QR scan",
            LoginStage::AwaitingPassword => "waiting for 2FA password",
            LoginStage::Completing => "finishing",
        };
        let _ = writeln!(out, "Login: {stage}");
    }

    match &status.stats {
        Some(stats) => {
            let _ = writeln!(out, "Client: connected");
            if let Some(dc) = stats.last_dc_id {
                let _ = writeln!(out, "DC: {dc}");
            }
            if let Some(latency) = stats.last_connect {
                let _ = writeln!(out, "Connect time: {} ms", latency.as_millis());
            }
            let _ = writeln!(out, "Reconnects: {}", stats.reconnects);
            let _ = writeln!(out, "Consecutive errors: {}", stats.consecutive_errors);
        }
        None => {
            let _ = writeln!(out, "Client: idle");
        }
    }

    if let Some(ka) = &status.keepalive {
        let _ = writeln!(out, "Keepalive: every {} s", ka.interval.as_secs());
    }
    out.trim_end().to_string()
}
