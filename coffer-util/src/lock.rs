//! File based advisory locks for cooperating processes on one host.
//!
//! A lock is a file created with `create_new` inside a shared lock directory.
//! Whoever manages to create the file holds the lock; everyone else spins
//! with backoff until the file disappears or their deadline fires. The lock
//! is released by deleting the file, which the guard does on drop so error
//! paths release too.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out waiting for lock file {0}")]
    Timeout(PathBuf),
    #[error("lock directory unusable: {0}")]
    Io(#[from] io::Error),
}

/// Holds a lock file in a shared lock directory until dropped.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Acquires the lock named `name` in `lock_directory`, spinning with
    /// backoff while another holder's file exists. Fails with
    /// [`LockError::Timeout`] once `deadline` has elapsed.
    pub async fn acquire(
        lock_directory: &Path,
        name: &str,
        deadline: Duration,
    ) -> Result<Self, LockError> {
        std::fs::create_dir_all(lock_directory)?;
        let path = lock_directory.join(name);
        let give_up = Instant::now() + deadline;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() + backoff > give_up {
                        return Err(LockError::Timeout(path));
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// The lock file this guard holds.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to remove lock file {}: {}", self.path.display(), err);
        }
    }
}
