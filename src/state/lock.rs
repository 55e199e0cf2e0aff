//! Cross-process guard on a run's state directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

use crate::error::StateError;

/// File name of the lock inside a run's state directory.
pub const LOCK_FILENAME: &str = "operation.lock";

/// Held while a process drives a run. Removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Takes the lock in `state_dir`.
    ///
    /// If a lock file exists, fails with [`StateError::Locked`] unless
    /// `force` is set, in which case the stale file is removed first.
    pub fn acquire(state_dir: &Path, force: bool) -> Result<Self, StateError> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILENAME);
        match Self::create(&path) {
            Ok(lock) => Ok(lock),
            Err(StateError::Locked { .. }) if force => {
                warn!(path = %path.display(), "Removing existing run lock (--force-unlock)");
                fs::remove_file(&path)?;
                Self::create(&path)
            }
            Err(e) => Err(e),
        }
    }

    fn create(path: &Path) -> Result<Self, StateError> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let payload = serde_json::json!({
                    "pid": std::process::id(),
                    "acquired_at": Utc::now().to_rfc3339(),
                });
                file.write_all(payload.to_string().as_bytes())?;
                file.sync_all()?;
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(StateError::Locked {
                path: path.to_path_buf(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
