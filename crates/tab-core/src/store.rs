//! Incoming-directory writer.
//!
//! Every item is first written to a scratch file outside the incoming
//! directory and then renamed into place, so a directory listing never sees a
//! half-written file. The scratch directory must live on the same filesystem
//! as the incoming directory for the rename to be atomic.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::{fs, io::AsyncWriteExt};

use crate::{
    item::{IncomingItem, ItemName},
    Result,
};

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(1);

const COMMIT_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug)]
pub struct AttachmentStore {
    incoming_dir: PathBuf,
    scratch_dir: PathBuf,
}

impl AttachmentStore {
    pub fn new(incoming_dir: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            incoming_dir: incoming_dir.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn incoming_dir(&self) -> &Path {
        &self.incoming_dir
    }

    /// Write a complete item. Returns the final path inside the incoming directory.
    ///
    /// Failures (disk full, permission denied) are logged and returned; the
    /// item is then lost for archiving purposes.
    pub async fn put(&self, item: &IncomingItem) -> Result<PathBuf> {
        let res = self.write_item(item).await;
        if let Err(e) = &res {
            tracing::warn!(item = %item.name, error = %e, "failed to store incoming item");
        }
        res
    }

    async fn write_item(&self, item: &IncomingItem) -> Result<PathBuf> {
        let mut pending = self.stage(item.name.clone()).await?;
        pending.file_mut().write_all(&item.content).await?;
        pending.commit().await
    }

    /// Open a scratch file for an item whose bytes arrive incrementally.
    pub async fn stage(&self, name: ItemName) -> Result<PendingItem> {
        fs::create_dir_all(&self.scratch_dir).await?;

        let n = SCRATCH_COUNTER.fetch_add(1, Ordering::SeqCst);
        let scratch_path = self
            .scratch_dir
            .join(format!("{}.{}.{n}.part", name, std::process::id()));
        let file = fs::File::create(&scratch_path).await?;

        Ok(PendingItem {
            name,
            scratch_path,
            incoming_dir: self.incoming_dir.clone(),
            file,
            committed: false,
        })
    }
}

/// An item being written to scratch space; invisible until `commit`.
#[derive(Debug)]
pub struct PendingItem {
    name: ItemName,
    scratch_path: PathBuf,
    incoming_dir: PathBuf,
    file: fs::File,
    committed: bool,
}

impl PendingItem {
    pub fn file_mut(&mut self) -> &mut fs::File {
        &mut self.file
    }

    /// Flush to disk and move the file into the incoming directory.
    ///
    /// The archive scheduler swaps the incoming directory out by renaming it,
    /// so the target can briefly be missing. In that case the directory is
    /// recreated and the rename retried; the item then belongs to the next
    /// archive unit.
    pub async fn commit(mut self) -> Result<PathBuf> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        let target = self.incoming_dir.join(self.name.as_str());
        let mut attempt = 0;
        loop {
            fs::create_dir_all(&self.incoming_dir).await?;
            match fs::rename(&self.scratch_path, &target).await {
                Ok(()) => break,
                Err(e)
                    if e.kind() == ErrorKind::NotFound
                        && attempt < COMMIT_ATTEMPTS
                        && self.scratch_exists().await =>
                {
                    attempt += 1;
                    tracing::debug!(item = %self.name, attempt, "incoming dir swapped during commit; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.committed = true;
        tracing::debug!(path = %target.display(), "stored item");
        Ok(target)
    }

    async fn scratch_exists(&self) -> bool {
        fs::try_exists(&self.scratch_path).await.unwrap_or(false)
    }
}

impl Drop for PendingItem {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.scratch_path);
        }
    }
}
