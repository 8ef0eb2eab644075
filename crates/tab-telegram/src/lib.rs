//! Telegram adapter (teloxide).
//!
//! Receives chat events, persists them through `tab-core`'s store and serves
//! the operator commands. The webhook variant echoes text back instead.

use async_trait::async_trait;

use teloxide::{net::Download, prelude::*};

use tokio::time::sleep;

pub mod handlers;
pub mod ingest;
pub mod router;
pub mod webhook;

use ingest::AttachmentSource;

/// Downloads attachments through the Bot API.
#[derive(Clone)]
pub struct TelegramFiles {
    bot: Bot,
}

impl TelegramFiles {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> anyhow::Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(teloxide::RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    tracing::debug!(retry_after = ?d, "telegram asked us to back off");
                    sleep(d).await;
                }
                Err(e) => return Err(anyhow::anyhow!("telegram error: {e}")),
            }
        }
    }
}

#[async_trait]
impl AttachmentSource for TelegramFiles {
    async fn download(&self, file_id: &str, dst: &mut tokio::fs::File) -> anyhow::Result<()> {
        let file = self
            .with_retry(|| self.bot.get_file(file_id.to_string()))
            .await?;
        self.bot.download_file(&file.path, dst).await?;
        Ok(())
    }
}
