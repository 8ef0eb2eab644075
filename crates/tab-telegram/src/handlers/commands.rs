use std::sync::Arc;

use chrono::Local;
use teloxide::{prelude::*, types::InputFile};

use tab_core::log_bundle::bundle_logs;

use crate::router::AppState;

pub fn parse_command(text: &str) -> (String, String) {
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

/// Commands this bot answers itself. Anything else, `/start` included, is
/// archived like a plain message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Help,
    Hi,
    GetLog,
}

impl Command {
    pub fn parse(text: &str, getlog_enabled: bool) -> Option<Self> {
        if !text.starts_with('/') {
            return None;
        }
        let (cmd, _arg) = parse_command(text);
        match cmd.as_str() {
            "help" => Some(Self::Help),
            "hi" => Some(Self::Hi),
            "getlog" if getlog_enabled => Some(Self::GetLog),
            _ => None,
        }
    }
}

pub fn help_text(getlog_enabled: bool) -> String {
    let mut body = String::from(
        "I support these commands:\n\n\
help - Display help message.\n\
hi - Test Telegram client.\n",
    );
    if getlog_enabled {
        body.push_str("getlog - Send the system log bundle.\n");
    }
    body
}

/// Returns `Ok(false)` when `msg` is not a command this bot answers; the
/// caller archives it instead.
pub async fn handle_command(bot: &Bot, msg: &Message, state: &Arc<AppState>) -> ResponseResult<bool> {
    let Some(command) = msg
        .text()
        .and_then(|text| Command::parse(text, state.cfg.getlog_enabled))
    else {
        return Ok(false);
    };

    match command {
        Command::Help => {
            tracing::info!("received command `help`");
            bot.send_message(msg.chat.id, help_text(state.cfg.getlog_enabled))
                .await?;
        }
        Command::Hi => {
            tracing::info!("received command `hi`");
            let name = msg
                .from()
                .map(|u| u.first_name.clone())
                .unwrap_or_else(|| "there".to_string());
            bot.send_message(msg.chat.id, format!("Hi, {name}")).await?;
        }
        Command::GetLog => {
            tracing::info!(chat_id = msg.chat.id.0, "received command `getlog`");
            send_log_bundle(bot, msg, state).await?;
        }
    }

    Ok(true)
}

async fn send_log_bundle(bot: &Bot, msg: &Message, state: &Arc<AppState>) -> ResponseResult<()> {
    let file_name = Local::now()
        .format("tab-varlog_%Y%m%d_%H%M%S.tar.gz")
        .to_string();
    let dest = state.cfg.temp_dir.join(&file_name);
    let src = state.cfg.log_bundle_dir.clone();

    let res = tokio::task::spawn_blocking({
        let dest = dest.clone();
        move || bundle_logs(&src, &dest)
    })
    .await;

    match res {
        Ok(Ok(report)) => {
            tracing::debug!(files = report.files, bytes = report.total_bytes, "sending log bundle");
            let sent = bot
                .send_document(msg.chat.id, InputFile::file(&dest).file_name(file_name))
                .await;
            let _ = tokio::fs::remove_file(&dest).await;
            sent?;
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to build log bundle");
            let _ = tokio::fs::remove_file(&dest).await;
            bot.send_message(msg.chat.id, format!("Failed to collect logs: {e}"))
                .await?;
        }
        Err(e) => {
            tracing::warn!(error = %e, "log bundle task panicked");
            bot.send_message(msg.chat.id, "Failed to collect logs.")
                .await?;
        }
    }

    Ok(())
}
