//! Operator log bundle: a gzip-compressed tar of a log directory.
//!
//! Only regular, readable files are packed. Sockets, symlinks and files we
//! cannot open are skipped and counted.

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use flate2::{write::GzEncoder, Compression};
use tar::Builder;

use crate::Result;

#[derive(Clone, Debug, Default)]
pub struct BundleReport {
    pub path: PathBuf,
    pub files: usize,
    pub skipped: usize,
    pub total_bytes: u64,
}

/// Pack every readable regular file below `src_dir` into `dest` (`.tar.gz`).
///
/// Entries keep their path relative to `src_dir`.
pub fn bundle_logs(src_dir: &Path, dest: &Path) -> Result<BundleReport> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let out = File::create(dest)?;
    let mut tar = Builder::new(GzEncoder::new(out, Compression::default()));
    tar.follow_symlinks(false);

    let mut report = BundleReport {
        path: dest.to_path_buf(),
        ..BundleReport::default()
    };

    let mut stack = vec![src_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let rd = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "skipping unreadable log dir");
                report.skipped += 1;
                continue;
            }
        };

        for ent in rd.flatten() {
            let path = ent.path();
            // The bundle may be written inside the directory being packed.
            if path == dest {
                continue;
            }
            let Ok(md) = fs::symlink_metadata(&path) else {
                report.skipped += 1;
                continue;
            };
            if md.is_dir() {
                stack.push(path);
                continue;
            }
            if !md.is_file() {
                report.skipped += 1;
                continue;
            }

            let Ok(mut f) = File::open(&path) else {
                report.skipped += 1;
                continue;
            };
            let rel = path.strip_prefix(src_dir).unwrap_or(&path);
            if let Err(e) = tar.append_file(rel, &mut f) {
                // A file that shrinks while being copied leaves the stream unusable.
                tracing::warn!(path = %path.display(), error = %e, "failed to add log file to bundle");
                return Err(e.into());
            }
            report.files += 1;
            report.total_bytes += md.len();
        }
    }

    let gz = tar.into_inner()?;
    gz.finish()?.sync_all()?;

    tracing::info!(
        bundle = %dest.display(),
        files = report.files,
        skipped = report.skipped,
        "log bundle written"
    );
    Ok(report)
}
