use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{errors::Error, Result};

/// Default gap between two archive ticks.
pub const DEFAULT_ARCHIVE_INTERVAL: Duration = Duration::from_secs(60);

/// How the bot receives updates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Long polling; every event is archived.
    #[default]
    Polling,
    /// HTTP webhook; text messages are echoed back.
    Webhook,
}

impl std::str::FromStr for RunMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "polling" | "poll" => Ok(Self::Polling),
            "webhook" | "hook" => Ok(Self::Webhook),
            other => Err(Error::Config(format!("unknown run mode: {other}"))),
        }
    }
}

/// Values that come from the command line (already merged with their env
/// fallbacks by the binary's argument parser).
#[derive(Clone, Debug, Default)]
pub struct LaunchArgs {
    /// Bot token, or the path of a JSON file holding `{"token": "..."}`.
    pub token: Option<String>,
    pub debug: bool,
    pub has_getlog: bool,
    /// `None` falls back to `TAB_MODE`, then to polling.
    pub mode: Option<RunMode>,
}

/// Typed configuration for the archive bot.
#[derive(Clone, Debug)]
pub struct Config {
    pub telegram_bot_token: String,
    pub debug: bool,
    pub getlog_enabled: bool,
    pub mode: RunMode,

    // Storage
    pub incoming_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub archive_interval: Duration,

    // Operator tooling
    pub temp_dir: PathBuf,
    pub log_bundle_dir: PathBuf,
    pub log_file: Option<PathBuf>,

    // Webhook variant
    pub webhook_addr: SocketAddr,
}

impl Config {
    pub fn load(args: LaunchArgs) -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let raw_token = args
            .token
            .or_else(|| env_str("TELEGRAM_BOT_TOKEN"))
            .unwrap_or_default();
        let telegram_bot_token = resolve_token(&raw_token)?;

        let incoming_dir = env_path("TAB_INCOMING_DIR").unwrap_or_else(|| PathBuf::from("data"));
        let archive_dir = env_path("TAB_ARCHIVE_DIR").unwrap_or_else(|| PathBuf::from("archive"));
        let scratch_dir =
            env_path("TAB_SCRATCH_DIR").unwrap_or_else(|| PathBuf::from(".tab-partial"));
        let archive_interval = parse_interval_secs(env_str("TAB_ARCHIVE_INTERVAL_SECS"))?;

        let temp_dir = env_path("TAB_TEMP_DIR")
            .unwrap_or_else(|| PathBuf::from("/tmp/telegram-archive-bot"));
        let log_bundle_dir =
            env_path("TAB_LOG_BUNDLE_DIR").unwrap_or_else(|| PathBuf::from("/var/log"));
        let log_file = match env_str("TAB_LOG_FILE") {
            Some(v) => non_empty(v).map(PathBuf::from),
            None => Some(PathBuf::from("telegram.log")),
        };

        let webhook_addr = env_str("TAB_WEBHOOK_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8000".to_string());
        let webhook_addr = webhook_addr
            .trim()
            .parse::<SocketAddr>()
            .map_err(|e| Error::Config(format!("invalid TAB_WEBHOOK_ADDR {webhook_addr:?}: {e}")))?;

        check_disjoint_dirs(&incoming_dir, &archive_dir, &scratch_dir)?;
        let mode = resolve_mode(args.mode, env_str("TAB_MODE"))?;

        Ok(Self {
            telegram_bot_token,
            debug: args.debug || env_bool("TAB_DEBUG").unwrap_or(false),
            getlog_enabled: args.has_getlog || env_bool("TAB_HAS_GETLOG").unwrap_or(false),
            mode,
            incoming_dir,
            archive_dir,
            scratch_dir,
            archive_interval,
            temp_dir,
            log_bundle_dir,
            log_file,
            webhook_addr,
        })
    }
}

#[derive(Deserialize)]
struct TokenFile {
    token: String,
}

/// A token argument is either the token itself or a JSON config file with a
/// `token` key.
fn resolve_token(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::Config(
            "a bot token is required (--token or TELEGRAM_BOT_TOKEN)".to_string(),
        ));
    }

    let path = Path::new(raw);
    if !path.is_file() {
        return Ok(raw.to_string());
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read token file {}: {e}", path.display())))?;
    let parsed: TokenFile = serde_json::from_str(&contents)
        .map_err(|e| Error::Config(format!("invalid token file {}: {e}", path.display())))?;

    non_empty(parsed.token)
        .ok_or_else(|| Error::Config(format!("token file {} has an empty token", path.display())))
}

fn resolve_mode(cli: Option<RunMode>, env: Option<String>) -> Result<RunMode> {
    match (cli, env.and_then(non_empty)) {
        (Some(mode), _) => Ok(mode),
        (None, Some(raw)) => raw.parse(),
        (None, None) => Ok(RunMode::default()),
    }
}

/// The incoming directory is renamed wholesale on every tick, so none of the
/// three directories may contain another one.
fn check_disjoint_dirs(incoming: &Path, archive: &Path, scratch: &Path) -> Result<()> {
    let dirs = [
        ("TAB_INCOMING_DIR", resolve_dir(incoming)),
        ("TAB_ARCHIVE_DIR", resolve_dir(archive)),
        ("TAB_SCRATCH_DIR", resolve_dir(scratch)),
    ];

    for (i, (a_key, a)) in dirs.iter().enumerate() {
        for (b_key, b) in dirs.iter().skip(i + 1) {
            if a.starts_with(b) || b.starts_with(a) {
                return Err(Error::Config(format!(
                    "{a_key} ({}) and {b_key} ({}) must not be the same or nested",
                    a.display(),
                    b.display()
                )));
            }
        }
    }
    Ok(())
}

/// Absolute, `.`/`..`-free form of `p`. The deepest existing ancestor is
/// canonicalized so symlinked parents compare equal to their targets.
fn resolve_dir(p: &Path) -> PathBuf {
    let abs = lexical_normalize(&env::current_dir().unwrap_or_default().join(p));

    let mut existing = abs.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(mut out) = fs::canonicalize(existing) {
            out.extend(missing.iter().rev());
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return abs,
        }
    }
}

fn lexical_normalize(p: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn parse_interval_secs(v: Option<String>) -> Result<Duration> {
    let Some(v) = v.and_then(non_empty) else {
        return Ok(DEFAULT_ARCHIVE_INTERVAL);
    };
    let secs = v
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::Config(format!("invalid TAB_ARCHIVE_INTERVAL_SECS: {v}")))?;
    if secs == 0 {
        return Err(Error::Config(
            "TAB_ARCHIVE_INTERVAL_SECS must be greater than zero".to_string(),
        ));
    }
    Ok(Duration::from_secs(secs))
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Export `KEY=value` lines from `path` without overriding the environment.
/// A missing file is not an error.
pub fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, strip_quotes(v.trim()));
    }
}

fn strip_quotes(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        &val[1..val.len() - 1]
    } else {
        val
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_str(key).and_then(non_empty).map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
