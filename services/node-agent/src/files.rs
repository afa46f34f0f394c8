//! Atomic local file writes.
//!
//! Files are written to a sibling temp file, fsynced and renamed over the
//! target, so readers never observe a partial write.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

/// Mode for files holding secrets.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Mode for world-readable files (unit files).
pub const PUBLIC_FILE_MODE: u32 = 0o644;

const PRIVATE_DIR_MODE: u32 = 0o700;

/// Write `contents` to `path` atomically, readable by the owner only.
pub fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_atomic(path, contents, PRIVATE_FILE_MODE)
}

/// Write `contents` to `path` atomically with `mode`.
///
/// Missing parent directories are created owner-only.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        DirBuilder::new()
            .recursive(true)
            .mode(PRIVATE_DIR_MODE)
            .create(parent)?;
    }

    let temp_path = temp_path(path);
    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&temp_path)?;

        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
