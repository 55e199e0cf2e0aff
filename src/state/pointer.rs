//! The "current run" record.
//!
//! A single JSON file under the runs directory naming the active run, or
//! holding `null` once that run was finalized. It is written with the same
//! atomic discipline as the registry and only changes at run creation and
//! finalization.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StateError;
use crate::utils::atomic_write_json;

/// File name of the pointer inside the runs directory.
pub const POINTER_FILENAME: &str = "CURRENT_RUN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerRecord {
    pub run_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Handle on the pointer file.
#[derive(Debug, Clone)]
pub struct RunPointer {
    path: PathBuf,
}

impl RunPointer {
    pub fn new(runs_dir: &Path) -> Self {
        Self {
            path: runs_dir.join(POINTER_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Active run id, if any. A missing file means no active run.
    pub fn current(&self) -> Result<Option<String>, StateError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        let record: PointerRecord =
            serde_json::from_str(&contents).map_err(|e| StateError::Corrupt {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        Ok(record.run_id.filter(|id| !id.is_empty()))
    }

    pub fn set(&self, run_id: &str) -> Result<(), StateError> {
        self.write(Some(run_id.to_string()))?;
        debug!(run_id, "Run pointer set");
        Ok(())
    }

    /// Clears the pointer if it still names `run_id`.
    ///
    /// Returns whether it was cleared; a pointer naming another run is left
    /// untouched.
    pub fn clear_if(&self, run_id: &str) -> Result<bool, StateError> {
        match self.current()? {
            Some(current) if current == run_id => {
                self.write(None)?;
                debug!(run_id, "Run pointer cleared");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn write(&self, run_id: Option<String>) -> Result<(), StateError> {
        let record = PointerRecord {
            run_id,
            updated_at: Utc::now(),
        };
        atomic_write_json(&self.path, &record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_pointer_is_empty() {
        let dir = TempDir::new().expect("tempdir");
        let pointer = RunPointer::new(dir.path());
        assert_eq!(pointer.current().expect("read"), None);
    }

    #[test]
    fn test_set_and_clear() {
        let dir = TempDir::new().expect("tempdir");
        let pointer = RunPointer::new(dir.path());

        pointer.set("run_a").expect("set");
        assert_eq!(pointer.current().expect("read").as_deref(), Some("run_a"));

        assert!(!pointer.clear_if("run_b").expect("clear other"));
        assert_eq!(pointer.current().expect("read").as_deref(), Some("run_a"));

        assert!(pointer.clear_if("run_a").expect("clear"));
        assert_eq!(pointer.current().expect("read"), None);
        // The record itself stays on disk.
        assert!(pointer.path().exists());
    }

    #[test]
    fn test_corrupt_pointer() {
        let dir = TempDir::new().expect("tempdir");
        let pointer = RunPointer::new(dir.path());
        fs::write(pointer.path(), "run_20240101_000000").expect("write");
        assert!(matches!(
            pointer.current(),
            Err(StateError::Corrupt { .. })
        ));
    }
}
