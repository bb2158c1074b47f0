// ABOUTME: Advisory file locking for cross-process coordination on the state file
//
// Readers take shared locks, writers exclusive locks, over an adjacent
// `state.lock` file. Built on fs2 so the same code path covers flock on
// POSIX and LockFileEx on Windows.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// An advisory lock guarding a data file.
///
/// The lock is taken on a sibling file (`state.json` -> `state.lock`) so that
/// the data file itself can be atomically replaced while locked.
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    /// Create a lock for the given data file. No lock is acquired yet.
    pub fn new(data_path: &Path) -> Self {
        Self {
            path: data_path.with_extension("lock"),
            file: None,
        }
    }

    /// Acquire an exclusive lock, blocking until it is available.
    pub fn lock(&mut self) -> Result<()> {
        if self.file.is_some() {
            anyhow::bail!("lock already held");
        }

        let file = self.open_lock_file()?;
        file.lock_exclusive().context("failed to acquire exclusive lock")?;
        self.file = Some(file);
        Ok(())
    }

    /// Acquire a shared (read) lock, blocking until it is available.
    /// Multiple processes can hold a shared lock simultaneously.
    pub fn rlock(&mut self) -> Result<()> {
        if self.file.is_some() {
            anyhow::bail!("lock already held");
        }

        let file = self.open_lock_file()?;
        file.lock_shared().context("failed to acquire shared lock")?;
        self.file = Some(file);
        Ok(())
    }

    /// Release the lock. Releasing an unheld lock is a no-op.
    pub fn unlock(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.unlock().context("failed to release lock")?;
        }
        Ok(())
    }

    fn open_lock_file(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("failed to open lock file {}", self.path.display()))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Locks must be released on every exit path, including panics.
        let _ = self.unlock();
    }
}
