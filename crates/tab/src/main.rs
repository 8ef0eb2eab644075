use std::{path::Path, sync::Arc};

use clap::Parser;

use tab_core::{
    archive::{ArchiveLayout, ArchiveScheduler},
    config::{Config, LaunchArgs, RunMode},
    store::AttachmentStore,
};

/// Telegram bot that archives every message it receives into periodic zip files.
#[derive(Parser, Debug)]
#[command(name = "tab", version)]
struct Cli {
    /// Bot token from BotFather, or a JSON file containing `{"token": "..."}`.
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Verbose logging.
    #[arg(long, env = "TAB_DEBUG")]
    debug: bool,

    /// Enable the `/getlog` command.
    #[arg(long = "has-getlog", env = "TAB_HAS_GETLOG")]
    has_getlog: bool,

    /// `polling` (default) archives messages; `webhook` runs the echo endpoint.
    #[arg(long, env = "TAB_MODE")]
    mode: Option<RunMode>,
}

#[tokio::main]
async fn main() -> Result<(), tab_core::Error> {
    // Flags fall back to env vars, so `.env` has to be exported first.
    tab_core::config::load_dotenv_if_present(Path::new(".env"));
    let cli = Cli::parse();

    let cfg = Arc::new(Config::load(LaunchArgs {
        token: cli.token,
        debug: cli.debug,
        has_getlog: cli.has_getlog,
        mode: cli.mode,
    })?);
    tab_core::logging::init("tab", cfg.debug, cfg.log_file.as_deref())?;

    match cfg.mode {
        RunMode::Polling => run_archiver(cfg).await,
        RunMode::Webhook => tab_telegram::webhook::run_webhook(cfg)
            .await
            .map_err(|e| tab_core::Error::External(format!("webhook server failed: {e}"))),
    }
}

async fn run_archiver(cfg: Arc<Config>) -> Result<(), tab_core::Error> {
    let store = AttachmentStore::new(cfg.incoming_dir.clone(), cfg.scratch_dir.clone());
    let scheduler = ArchiveScheduler::new(
        ArchiveLayout {
            incoming_dir: cfg.incoming_dir.clone(),
            archive_dir: cfg.archive_dir.clone(),
        },
        cfg.archive_interval,
    );

    scheduler.report_stranded_units();
    scheduler.start().await;

    let res = tab_telegram::router::run_polling(cfg, store).await;

    tracing::info!("stopping archive scheduler");
    scheduler.stop().await;

    res.map_err(|e| tab_core::Error::External(format!("telegram bot failed: {e}")))
}
