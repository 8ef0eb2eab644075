use std::{fs::OpenOptions, path::Path, sync::Mutex};

use tracing_subscriber::{fmt, fmt::writer::MakeWriterExt, EnvFilter};

use crate::{errors::Error, Result};

/// Initialize tracing for the bot.
///
/// Default: `info` (or `debug` with `debug = true`) for our crates, `warn` for
/// everything else. Can be overridden with `RUST_LOG`. When `log_file` is set,
/// every line is also appended to that file.
pub fn init(service_name: &str, debug: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,tab={level},tab_core={level},tab_telegram={level},{service_name}={level}"
        ))
    });

    let builder = fmt().with_env_filter(filter).with_target(false);

    let res = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    Error::Config(format!("cannot open log file {}: {e}", path.display()))
                })?;
            builder
                .with_ansi(false)
                .with_writer(std::io::stderr.and(Mutex::new(file)))
                .try_init()
        }
        None => builder.with_ansi(true).try_init(),
    };

    res.map_err(|e| Error::Config(format!("logging already initialized: {e}")))
}
