//! Telegram update handlers.
//!
//! Known commands are answered directly; everything else (unknown commands
//! included) goes to the archive.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use crate::{ingest, router::AppState};

mod commands;

pub use commands::{help_text, parse_command, Command};

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if let Some(text) = msg.text() {
        if text.starts_with('/') && commands::handle_command(&bot, &msg, &state).await? {
            return Ok(());
        }
    }

    archive(&msg, &state).await;
    Ok(())
}

/// Storage failures are logged by the store; the update is still acknowledged
/// so Telegram does not redeliver it forever.
async fn archive(msg: &Message, state: &AppState) {
    match ingest::archive_message(state.files.as_ref(), &state.store, msg).await {
        Ok(report) if report.failed_attachments > 0 => {
            tracing::warn!(
                chat_id = msg.chat.id.0,
                message_id = msg.id.0,
                failed = report.failed_attachments,
                "message archived without some attachments"
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!(
                chat_id = msg.chat.id.0,
                message_id = msg.id.0,
                error = %e,
                "failed to archive message"
            );
        }
    }
}
