// src/store/atomic.rs

//! Crash-safe file writes: temp file, fsync, rename.

use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// Mode of descriptor files
pub const FILE_MODE: u32 = 0o644;

/// Mode of secret material (`auth.json`, `key.pem`)
pub const SECRET_MODE: u32 = 0o600;

/// Mode of event files
pub const EVENT_MODE: u32 = 0o444;

/// Mode of ordinary directories
pub const DIR_MODE: u32 = 0o755;

/// Mode of TLS directories
pub const SSL_DIR_MODE: u32 = 0o700;

/// Marshals a value the way every descriptor is stored (two-space JSON)
pub fn to_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value)
        .map_err(|e| CoreError::io("<serialize>", io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// Atomically replaces `path` with the JSON form of `value`
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T, mode: u32) -> Result<()> {
    let bytes = to_json_bytes(value)?;
    write_bytes(path, &bytes, mode)
}

/// Atomically replaces `path` with `bytes`
pub fn write_bytes(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    write_with(path, bytes, mode, false, |_| Ok(()))
}

/// Atomically creates `path`; fails with `AlreadyExists` if it is already there
pub fn create_json<T: Serialize + ?Sized>(path: &Path, value: &T, mode: u32) -> Result<()> {
    let bytes = to_json_bytes(value)?;
    write_with(path, &bytes, mode, true, |_| Ok(()))
}

/// Sibling temp path used while writing `path`
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Core write sequence. `before_commit` runs after the temp file is durable and
/// before it becomes visible; an error there leaves the target untouched.
pub(crate) fn write_with<F>(
    path: &Path,
    bytes: &[u8],
    mode: u32,
    no_clobber: bool,
    before_commit: F,
) -> Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    if no_clobber && fs::symlink_metadata(path).is_ok() {
        return Err(CoreError::AlreadyExists(path.display().to_string()));
    }

    let tmp = temp_path(path);
    // A leftover from an interrupted write is never meaningful
    if fs::symlink_metadata(&tmp).is_ok() {
        fs::remove_file(&tmp).map_err(|e| CoreError::io(&tmp, e))?;
    }

    let result = stage(&tmp, bytes, mode)
        .and_then(|_| before_commit(&tmp))
        .map_err(|e| CoreError::io(&tmp, e))
        .and_then(|_| commit(&tmp, path, no_clobber));

    if result.is_err() {
        if let Err(e) = fs::remove_file(&tmp) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove temp file {}: {}", tmp.display(), e);
            }
        }
    } else {
        debug!("Wrote {}", path.display());
    }
    result
}

fn stage(tmp: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(tmp)?;
    file.write_all(bytes)?;
    // The umask may have narrowed the creation mode
    file.set_permissions(Permissions::from_mode(mode))?;
    file.sync_all()
}

fn commit(tmp: &Path, path: &Path, no_clobber: bool) -> Result<()> {
    if no_clobber {
        // link(2) refuses to replace an existing name
        fs::hard_link(tmp, path).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                CoreError::AlreadyExists(path.display().to_string())
            } else {
                CoreError::io(path, e)
            }
        })?;
        fs::remove_file(tmp).map_err(|e| CoreError::io(tmp, e))
    } else {
        fs::rename(tmp, path).map_err(|e| CoreError::io(path, e))
    }
}

/// Creates `path` and its parents, then sets `mode` on `path` itself
pub fn ensure_dir(path: &Path, mode: u32) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(|e| CoreError::io(path, e))?;
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|e| CoreError::io(path, e))
}

/// Removes a file, treating absence as success. Returns whether it existed.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CoreError::io(path, e)),
    }
}

/// Removes a directory tree, treating absence as success
pub fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CoreError::io(path, e)),
    }
}

/// Mode bits of a file, without following symlinks
pub fn file_mode(path: &Path) -> Result<u32> {
    fs::symlink_metadata(path)
        .map(|meta| meta.permissions().mode() & 0o7777)
        .map_err(|e| CoreError::io(path, e))
}
