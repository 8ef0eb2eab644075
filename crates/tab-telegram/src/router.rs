use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use tab_core::{config::Config, store::AttachmentStore};

use crate::{handlers, ingest::AttachmentSource, TelegramFiles};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: AttachmentStore,
    pub files: Arc<dyn AttachmentSource>,
}

/// Long-poll Telegram until Ctrl-C. Every message lands in `store`.
pub async fn run_polling(cfg: Arc<Config>, store: AttachmentStore) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    match bot.get_me().await {
        Ok(me) => tracing::info!(bot = %me.username(), "telegram archive bot started"),
        Err(e) => tracing::warn!(error = %e, "get_me failed; continuing"),
    }
    tracing::info!(
        incoming = %store.incoming_dir().display(),
        getlog = cfg.getlog_enabled,
        "polling for updates"
    );

    let state = Arc::new(AppState {
        cfg,
        store,
        files: Arc::new(TelegramFiles::new(bot.clone())),
    });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
