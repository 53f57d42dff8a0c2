//! Exclusive lock backed by an advisory file lock
//!
//! The lock file sits next to the roster database, so the lock is scoped to
//! that roster and respected by every process on the host that uses the
//! same path.

use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{LockToken, MutualExclusion};
use crate::error::LockError;

/// Interval between non-blocking lock attempts inside one `try_acquire`
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Advisory file lock (`flock` on Unix, `LockFileEx` on Windows)
pub struct FileLock {
    path: PathBuf,
    held: Mutex<Option<(LockToken, File)>>,
    poll_interval: Duration,
}

impl FileLock {
    /// Create a lock on an explicit path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: Mutex::new(None),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_error(&self, source: std::io::Error) -> LockError {
        LockError::File {
            path: self.path.display().to_string(),
            source,
        }
    }

    /// One non-blocking attempt; `Ok(None)` if another holder has it
    fn try_lock_once(&self) -> Result<Option<File>, LockError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| self.file_error(e))?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.file_error(e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                // Owner pid is informational only
                file.set_len(0).map_err(|e| self.file_error(e))?;
                writeln!(file, "{}", std::process::id()).map_err(|e| self.file_error(e))?;
                Ok(Some(file))
            }
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(self.file_error(e)),
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[async_trait]
impl MutualExclusion for FileLock {
    async fn try_acquire(&self, wait: Duration) -> Result<Option<LockToken>, LockError> {
        let started = Instant::now();

        loop {
            if let Some(file) = self.try_lock_once()? {
                let token = LockToken::generate();
                let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
                *held = Some((token.clone(), file));
                debug!(path = %self.path.display(), token = %token, "File lock taken");
                return Ok(Some(token));
            }

            let elapsed = started.elapsed();
            if elapsed >= wait {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(wait - elapsed)).await;
        }
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());

        match held.take() {
            Some((owner, file)) if &owner == token => {
                FileExt::unlock(&file).map_err(|e| self.file_error(e))?;
                debug!(path = %self.path.display(), token = %token, "File lock released");
                Ok(())
            }
            Some(other) => {
                let err = LockError::NotOwner(token.to_string());
                *held = Some(other);
                Err(err)
            }
            None => Ok(()),
        }
    }
}
