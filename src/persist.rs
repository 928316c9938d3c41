//! # Crash-Safe State Persistence
//!
//! Atomic-publish JSON persistence shared by the checkpoint, manifest, and
//! DLQ files: write to a temporary sibling, fsync, then rename over the
//! target. A crash mid-write leaves either the pre-image or the fully
//! written post-image, never a torn file. An optional `.bak` copy of the
//! previous image supports corruption fallback at load time.

use crate::error::{ConveyorError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".bak");
    PathBuf::from(os)
}

/// Serialize `value` and atomically publish it at `path`. When
/// `keep_backup` is set, the previous image is first copied to `<path>.bak`.
pub fn save_atomic<T: Serialize>(path: &Path, value: &T, keep_backup: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ConveyorError::io(parent, e))?;
    }

    let rendered = serde_json::to_vec_pretty(value)?;

    if keep_backup && path.exists() {
        let backup = backup_path(path);
        fs::copy(path, &backup).map_err(|e| ConveyorError::io(&backup, e))?;
    }

    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp).map_err(|e| ConveyorError::io(&tmp, e))?;
        file.write_all(&rendered)
            .map_err(|e| ConveyorError::io(&tmp, e))?;
        file.sync_all().map_err(|e| ConveyorError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| ConveyorError::io(path, e))?;

    debug!(path = %path.display(), bytes = rendered.len(), "PERSIST: state published");
    Ok(())
}

/// Load a JSON state file, falling back to `<path>.bak` when the primary
/// image fails to parse. `Ok(None)` means the file has never been written.
/// `Err(detail)` means both the primary and any backup are unusable; callers
/// map that to their corruption error variant.
pub fn load_with_backup<T: DeserializeOwned>(
    path: &Path,
) -> std::result::Result<Option<T>, String> {
    match try_load(path) {
        LoadAttempt::Missing => Ok(None),
        LoadAttempt::Loaded(value) => Ok(Some(value)),
        LoadAttempt::Failed(detail) => {
            let backup = backup_path(path);
            match try_load::<T>(&backup) {
                LoadAttempt::Loaded(value) => {
                    warn!(
                        path = %path.display(),
                        backup = %backup.display(),
                        detail = %detail,
                        "PERSIST: primary image unreadable, recovered from backup"
                    );
                    Ok(Some(value))
                }
                LoadAttempt::Missing => Err(detail),
                LoadAttempt::Failed(backup_detail) => {
                    Err(format!("{detail}; backup also unusable: {backup_detail}"))
                }
            }
        }
    }
}

enum LoadAttempt<T> {
    Missing,
    Loaded(T),
    Failed(String),
}

fn try_load<T: DeserializeOwned>(path: &Path) -> LoadAttempt<T> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LoadAttempt::Missing,
        Err(e) => return LoadAttempt::Failed(e.to_string()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => LoadAttempt::Loaded(value),
        Err(e) => LoadAttempt::Failed(e.to_string()),
    }
}
