//! Single-instance guard: one exclusively locked file per job kind.
//!
//! The lock is an advisory OS file lock, so it dies with the process that
//! holds it. The file itself stays on disk between runs and carries the pid
//! of the current holder.

use crate::runtime::error::SyncError;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, job_kind: &str) -> PathBuf {
        self.dir.join(format!("{job_kind}.pid"))
    }

    /// Takes the exclusive lock for `job_kind`, failing with
    /// [`SyncError::AlreadyRunning`] while another process (or another
    /// guard in this one) holds it.
    pub fn acquire(&self, job_kind: &str) -> Result<LockGuard> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create lock directory {}", self.dir.display()))?;

        let path = self.path_for(job_kind);
        // Not truncated here: the holder's pid must survive a failed attempt.
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == fs2::lock_contended_error().kind() {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                let holder = holder.trim();
                return Err(anyhow::Error::new(SyncError::AlreadyRunning {
                    job_kind: job_kind.to_string(),
                }))
                .with_context(|| {
                    format!(
                        "lock file {} is held by pid {}",
                        path.display(),
                        if holder.is_empty() { "?" } else { holder }
                    )
                });
            }
            return Err(err).with_context(|| format!("failed to lock {}", path.display()));
        }

        file.set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .and_then(|()| file.sync_data())
            .with_context(|| format!("failed to write lock file {}", path.display()))?;

        tracing::debug!(job_kind, path = %path.display(), "lock acquired");
        Ok(LockGuard {
            path,
            job_kind: job_kind.to_string(),
            file: Some(file),
        })
    }
}

/// Held for the lifetime of a run. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    job_kind: String,
    file: Option<File>,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clears the pid and unlocks. Safe to call more than once.
    pub fn release(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        // Cleared while still locked so a new holder's pid is never erased.
        let cleared = file.set_len(0);
        FileExt::unlock(&file)
            .with_context(|| format!("failed to unlock {}", self.path.display()))?;
        cleared.with_context(|| format!("failed to clear lock file {}", self.path.display()))?;
        tracing::debug!(job_kind = %self.job_kind, "lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "lock release failed on drop");
        }
    }
}
