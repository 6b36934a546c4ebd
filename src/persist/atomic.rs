//! Crash-safe file writes.
//!
//! Snapshots are written with the temp-then-rename pattern: write to
//! `<path>.tmp`, fsync the file, rename over the target, fsync the parent
//! directory. Readers see either the old snapshot or the new one, never a
//! torn write, and the rename survives power loss once the directory entry
//! is synced.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Writes `bytes` to `path` atomically.
pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// Syncs a directory so a rename or create in it is durable.
fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = File::open(dir_path)?;
    dir.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_content_and_cleans_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.json");

        write_file_atomic(&path, b"{\"a\": 1}").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\": 1}");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn overwrites_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.json");

        write_file_atomic(&path, b"old").unwrap();
        write_file_atomic(&path, b"new").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deeper/queue.json");

        write_file_atomic(&path, b"x").unwrap();

        assert!(path.exists());
    }
}
