//! Periodic archiver for the incoming directory.
//!
//! Every tick seals whatever the store has written since the previous tick
//! into `<archive-root>/<unix-ts>.zip`:
//!
//! - Checking: an empty (or missing) incoming directory is a logged no-op.
//! - Staging: the incoming directory itself is renamed to `<archive-root>/<ts>`
//!   and a fresh one is created. Items committed concurrently end up in exactly
//!   one unit, either this one or the next.
//! - Compressing: the staged directory is zipped into `<ts>.zip.partial`.
//! - Finalizing: the partial zip is renamed to `<ts>.zip` and the packed files
//!   are removed from the staged directory, then the directory itself.
//!
//! A failure leaves the staged directory (and possibly the partial zip) on
//! disk for manual recovery. It never stops the timer. A file that shows up in
//! the staged directory after it was packed is never deleted; the unit is left
//! stranded instead.

use std::{
    collections::BTreeSet,
    fmt,
    fs::File,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use tokio::{
    fs,
    task::{JoinHandle, JoinSet},
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use crate::{errors::Error, Result};

const PARTIAL_SUFFIX: &str = "partial";

/// Turns a staged directory into a single archive file.
///
/// Runs on the blocking thread pool.
pub trait UnitCompressor: Send + Sync {
    /// File extension of produced archives, without the dot.
    fn extension(&self) -> &str;

    /// Write every regular file under `staged` into `dest`, flattened.
    /// Returns the source paths that were packed.
    fn compress(&self, staged: &Path, dest: &Path) -> Result<Vec<PathBuf>>;
}

/// Zip with deflate; the default compressor.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZipCompressor;

impl UnitCompressor for ZipCompressor {
    fn extension(&self) -> &str {
        "zip"
    }

    fn compress(&self, staged: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
        let entries = flatten_entries(staged)?;

        let f = File::create(dest)?;
        let mut zw = ZipWriter::new(f);
        for (name, path, len) in &entries {
            let opts = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(0o644)
                .large_file(*len >= u64::from(u32::MAX));
            zw.start_file(name.as_str(), opts)?;
            let mut src = File::open(path)?;
            io::copy(&mut src, &mut zw)?;
        }
        let f = zw.finish()?;
        f.sync_all()?;

        Ok(entries.into_iter().map(|(_, path, _)| path).collect())
    }
}

/// Collect `(entry name, path, len)` for every regular file below `root`.
///
/// Entry names are the bare file names. If two files in different
/// subdirectories share a name, the later one is prefixed with its relative
/// directory (`sub_dir_name`).
fn flatten_entries(root: &Path) -> Result<Vec<(String, PathBuf, u64)>> {
    let mut files: Vec<(PathBuf, u64)> = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for ent in std::fs::read_dir(&dir)? {
            let ent = ent?;
            let md = std::fs::symlink_metadata(ent.path())?;
            if md.is_dir() {
                stack.push(ent.path());
            } else if md.is_file() {
                files.push((ent.path(), md.len()));
            } else {
                tracing::warn!(path = %ent.path().display(), "skipping non-regular file in archive unit");
            }
        }
    }
    files.sort();

    let mut used = BTreeSet::new();
    let mut out = Vec::with_capacity(files.len());
    for (path, len) in files {
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut name = base.clone();
        if used.contains(&name) {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("_");
        }
        let mut n = 1;
        let stem = name.clone();
        while used.contains(&name) {
            name = format!("{n}-{stem}");
            n += 1;
        }
        used.insert(name.clone());
        out.push((name, path, len));
    }
    Ok(out)
}

/// Directory pair the scheduler operates on.
#[derive(Clone, Debug)]
pub struct ArchiveLayout {
    pub incoming_dir: PathBuf,
    pub archive_dir: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickStage {
    Checking,
    Staging,
    Compressing,
    Finalizing,
}

impl fmt::Display for TickStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Checking => "checking",
            Self::Staging => "staging",
            Self::Compressing => "compressing",
            Self::Finalizing => "finalizing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("archive tick failed while {stage}: {source}")]
pub struct TickError {
    pub stage: TickStage,
    #[source]
    pub source: Error,
}

impl TickError {
    fn at(stage: TickStage) -> impl FnOnce(Error) -> TickError {
        move |source| TickError { stage, source }
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing was pending; no artifacts were created.
    Empty,
    /// The previous tick body was still running; pending items wait for the next tick.
    Busy,
    Archived { archive: PathBuf, items: usize },
    Failed(TickError),
}

#[derive(Clone)]
pub struct ArchiveScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    layout: ArchiveLayout,
    interval: Duration,
    compressor: Arc<dyn UnitCompressor>,
    // Serializes tick bodies so two units never stage the same directory.
    tick_lock: tokio::sync::Mutex<()>,
    state: tokio::sync::Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    handle: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

impl ArchiveScheduler {
    pub fn new(layout: ArchiveLayout, interval: Duration) -> Self {
        Self::with_compressor(layout, interval, Arc::new(ZipCompressor))
    }

    pub fn with_compressor(
        layout: ArchiveLayout,
        interval: Duration,
        compressor: Arc<dyn UnitCompressor>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                layout,
                interval,
                compressor,
                tick_lock: tokio::sync::Mutex::new(()),
                state: tokio::sync::Mutex::new(SchedulerState::default()),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.inner.layout
    }

    /// Spawn the timer loop. Returns `false` if it is already running.
    pub async fn start(&self) -> bool {
        let mut st = self.inner.state.lock().await;
        if st.handle.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let scheduler = self.clone();
        let loop_cancel = cancel.clone();
        st.handle = Some(tokio::spawn(async move {
            scheduler.run_loop(loop_cancel).await;
        }));
        st.cancel = Some(cancel);

        tracing::info!(
            interval_secs = self.inner.interval.as_secs_f64(),
            incoming = %self.inner.layout.incoming_dir.display(),
            archive = %self.inner.layout.archive_dir.display(),
            "archive scheduler started"
        );
        true
    }

    /// Stop the timer loop and wait for an in-flight tick body to finish.
    pub async fn stop(&self) {
        let (handle, cancel) = {
            let mut st = self.inner.state.lock().await;
            (st.handle.take(), st.cancel.take())
        };
        if let Some(tok) = cancel {
            tok.cancel();
        }
        if let Some(h) = handle {
            let _ = h.await;
        }
        let _drain = self.inner.tick_lock.lock().await;
        tracing::info!("archive scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.handle.is_some()
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        let interval = self.inner.interval;
        let mut deadline = Instant::now() + interval;
        let mut ticks = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = ticks.join_next(), if !ticks.is_empty() => {}
                _ = sleep_until(deadline) => {
                    // Next deadline is fixed before the body runs, so a slow or
                    // failing tick never delays the schedule.
                    deadline += interval;
                    let now = Instant::now();
                    if deadline <= now {
                        deadline = now + interval;
                    }

                    let scheduler = self.clone();
                    ticks.spawn(async move {
                        scheduler.tick().await;
                    });
                }
            }
        }

        // A tick spawned right before cancellation may not hold the tick lock yet.
        while ticks.join_next().await.is_some() {}
    }

    /// Run one tick body stamped with the current unix time.
    pub async fn tick(&self) -> TickOutcome {
        self.tick_at(Utc::now().timestamp()).await
    }

    /// Run one tick body stamped with `timestamp` (unix seconds).
    pub async fn tick_at(&self, timestamp: i64) -> TickOutcome {
        let Ok(_guard) = self.inner.tick_lock.try_lock() else {
            tracing::warn!(timestamp, "previous archive tick still running; deferring items");
            return TickOutcome::Busy;
        };

        match self.seal(timestamp).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(timestamp, stage = %e.stage, error = %e.source, "archive tick failed");
                TickOutcome::Failed(e)
            }
        }
    }

    async fn seal(&self, timestamp: i64) -> std::result::Result<TickOutcome, TickError> {
        let layout = &self.inner.layout;

        // Checking
        let pending = has_entries(&layout.incoming_dir)
            .await
            .map_err(TickError::at(TickStage::Checking))?;
        if !pending {
            tracing::debug!(timestamp, "incoming dir is empty; no archive this tick");
            return Ok(TickOutcome::Empty);
        }

        // Staging
        fs::create_dir_all(&layout.archive_dir)
            .await
            .map_err(|e| TickError::at(TickStage::Staging)(e.into()))?;
        let unit = self
            .free_unit_name(timestamp)
            .await
            .map_err(TickError::at(TickStage::Staging))?;
        let staged = layout.archive_dir.join(&unit);
        tracing::debug!(staged = %staged.display(), "staging archive unit");

        fs::rename(&layout.incoming_dir, &staged)
            .await
            .map_err(|e| TickError::at(TickStage::Staging)(e.into()))?;
        if let Err(e) = fs::create_dir_all(&layout.incoming_dir).await {
            // The store recreates it on its next write.
            tracing::warn!(error = %e, "failed to recreate incoming dir");
        }

        // Compressing
        let ext = self.inner.compressor.extension().to_string();
        let partial = layout
            .archive_dir
            .join(format!("{unit}.{ext}.{PARTIAL_SUFFIX}"));
        let archive = layout.archive_dir.join(format!("{unit}.{ext}"));

        let compressor = self.inner.compressor.clone();
        let (src, dst) = (staged.clone(), partial.clone());
        let packed = tokio::task::spawn_blocking(move || compressor.compress(&src, &dst))
            .await
            .map_err(|e| Error::External(format!("compression task failed: {e}")))
            .and_then(|r| r)
            .map_err(TickError::at(TickStage::Compressing))?;

        // Finalizing
        fs::rename(&partial, &archive)
            .await
            .map_err(|e| TickError::at(TickStage::Finalizing)(e.into()))?;
        if let Err(e) = remove_packed(&staged, &packed).await {
            tracing::warn!(
                staged = %staged.display(),
                error = %e,
                "staged unit not fully removed; left for recovery"
            );
        }

        let items = packed.len();
        tracing::info!(archive = %archive.display(), items, "archive sealed");
        Ok(TickOutcome::Archived { archive, items })
    }

    /// `<ts>`, or `<ts>-<n>` if a unit with that stamp already exists.
    async fn free_unit_name(&self, timestamp: i64) -> Result<String> {
        let dir = &self.inner.layout.archive_dir;
        let ext = self.inner.compressor.extension();

        let mut n = 0u32;
        loop {
            let unit = if n == 0 {
                timestamp.to_string()
            } else {
                format!("{timestamp}-{n}")
            };
            let taken = [
                dir.join(&unit),
                dir.join(format!("{unit}.{ext}")),
                dir.join(format!("{unit}.{ext}.{PARTIAL_SUFFIX}")),
            ];
            let mut free = true;
            for p in &taken {
                if fs::try_exists(p).await? {
                    free = false;
                    break;
                }
            }
            if free {
                return Ok(unit);
            }
            n += 1;
        }
    }

    /// Staged directories and partial archives left behind by failed or
    /// interrupted ticks.
    pub fn stranded_units(&self) -> Result<Vec<PathBuf>> {
        let rd = match std::fs::read_dir(&self.inner.layout.archive_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let suffix = format!(".{PARTIAL_SUFFIX}");
        let mut out = Vec::new();
        for ent in rd {
            let ent = ent?;
            let is_dir = ent.file_type()?.is_dir();
            let is_partial = ent.file_name().to_string_lossy().ends_with(&suffix);
            if is_dir || is_partial {
                out.push(ent.path());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Log every stranded unit so an operator can recover it.
    pub fn report_stranded_units(&self) {
        match self.stranded_units() {
            Ok(units) => {
                for unit in units {
                    tracing::warn!(path = %unit.display(), "found unarchived unit from an earlier tick");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to scan archive dir"),
        }
    }
}

/// Delete the packed files, their now-empty subdirectories, then `staged`.
/// Anything that was not packed makes the last step fail and stays on disk.
async fn remove_packed(staged: &Path, packed: &[PathBuf]) -> io::Result<()> {
    let mut dirs = BTreeSet::new();
    for path in packed {
        fs::remove_file(path).await?;
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir == staged || !dir.starts_with(staged) {
                break;
            }
            dirs.insert(dir.to_path_buf());
            parent = dir.parent();
        }
    }

    let mut dirs: Vec<PathBuf> = dirs.into_iter().collect();
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        fs::remove_dir(&dir).await?;
    }
    fs::remove_dir(staged).await
}

async fn has_entries(dir: &Path) -> Result<bool> {
    let mut rd = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    Ok(rd.next_entry().await?.is_some())
}
