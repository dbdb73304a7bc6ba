//! Disk staging: append-only part files and atomic finalization.
//!
//! The stager never seeks. Every append is flushed and fsynced before the
//! caller releases the session lock, so the part-file length on disk always
//! matches the session's byte count between chunks.

use crate::common::TransferError;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

pub const PART_SUFFIX: &str = ".part";

/// Part-file path for a session: `<staging>/<fileId>_<name>.part`.
pub fn part_path(staging_dir: &Path, file_id: &str, file_name: &str) -> PathBuf {
    staging_dir.join(format!("{file_id}_{file_name}{PART_SUFFIX}"))
}

/// Finalized staging path: the part path without its suffix.
pub fn final_path(staging_dir: &Path, file_id: &str, file_name: &str) -> PathBuf {
    staging_dir.join(format!("{file_id}_{file_name}"))
}

/// Length of a staged file on disk, zero when absent.
pub async fn stored_len(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Append one chunk and force it to stable storage before returning.
pub async fn append_chunk(part: &Path, data: &[u8]) -> Result<(), TransferError> {
    if let Some(parent) = part.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::io("create staging dir", e))?;
    }

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(part)
        .await
        .map_err(|e| TransferError::io("open part file", e))?;

    file.write_all(data)
        .await
        .map_err(|e| TransferError::io("append chunk", e))?;
    file.flush()
        .await
        .map_err(|e| TransferError::io("flush part file", e))?;
    file.sync_all()
        .await
        .map_err(|e| TransferError::io("fsync part file", e))?;

    Ok(())
}

/// Atomically rename the part file onto `desired`, picking a `" (N)"`
/// alternative when that name is taken. Returns the path actually used.
pub async fn finalize(part: &Path, desired: &Path) -> Result<PathBuf, TransferError> {
    let target = free_path(desired, Separator::Spaced).await;
    fs::rename(part, &target)
        .await
        .map_err(|e| TransferError::io("finalize rename", e))?;
    Ok(target)
}

/// Smallest free `name_N.ext` variant for placed downloads.
pub async fn free_download_path(desired: &Path) -> PathBuf {
    free_path(desired, Separator::Underscore).await
}

/// Remove staging artifacts for a stopped session. Missing files are fine;
/// anything else is worth a warning but never fails the stop.
pub async fn remove_artifacts(part: &Path, final_file: &Path) {
    for path in [part, final_file] {
        match fs::remove_file(path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "staging file deleted"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to delete staging file")
            }
        }
    }
}

enum Separator {
    /// `report (1).pdf` — finalized uploads.
    Spaced,
    /// `report_1.pdf` — placed downloads.
    Underscore,
}

async fn free_path(desired: &Path, separator: Separator) -> PathBuf {
    if !exists(desired).await {
        return desired.to_path_buf();
    }

    let stem = desired
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = desired.extension().map(|e| e.to_string_lossy().into_owned());

    for n in 1u32.. {
        let name = match (&separator, &ext) {
            (Separator::Spaced, Some(ext)) => format!("{stem} ({n}).{ext}"),
            (Separator::Spaced, None) => format!("{stem} ({n})"),
            (Separator::Underscore, Some(ext)) => format!("{stem}_{n}.{ext}"),
            (Separator::Underscore, None) => format!("{stem}_{n}"),
        };
        let candidate = desired.with_file_name(name);
        if !exists(&candidate).await {
            return candidate;
        }
    }
    unreachable!("ran out of collision suffixes")
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}
