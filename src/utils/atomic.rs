//! Crash-safe file replacement.
//!
//! Every durable state file (registry, experiment state, run pointer) is
//! written to a sibling temp file, fsynced, and renamed over the target. A
//! crash at any point leaves either the old or the new contents, never a
//! half-written file.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use chrono::Utc;
use serde::Serialize;

/// Atomically replaces `path` with `bytes`, creating parent directories.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));

    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    // Persist the rename itself. Not supported on every platform.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), serde_json::Error> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes).map_err(serde_json::Error::io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_parents_and_replaces() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");

        atomic_write_bytes(&path, b"first").expect("write");
        atomic_write_bytes(&path, b"second").expect("rewrite");

        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("registry.json");
        atomic_write_json(&path, &serde_json::json!({"a": 1})).expect("write");

        let names: Vec<String> = fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["registry.json".to_string()]);
    }
}
