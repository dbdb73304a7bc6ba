//! Per-file upload session and its status machine.

use crate::common::TransferError;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::{Mutex, MutexGuard};

/// Status of an upload session.
///
/// `completing` means every declared byte is staged but the client has not
/// yet asked for finalization; `uploading` means the hand-off to the
/// downstream store is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Active,
    Paused,
    Completing,
    Uploading,
    Completed,
    Stopped,
    Error,
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStatus::Active => "active",
            UploadStatus::Paused => "paused",
            UploadStatus::Completing => "completing",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Stopped => "stopped",
            UploadStatus::Error => "error",
        };
        f.write_str(name)
    }
}

impl UploadStatus {
    /// Only `active` sessions take chunk writes.
    pub fn accepts_chunks(self) -> bool {
        matches!(self, UploadStatus::Active)
    }

    /// Finalization in progress or done; `start` must not re-open these.
    pub fn blocks_restart(self) -> bool {
        matches!(
            self,
            UploadStatus::Completing | UploadStatus::Uploading | UploadStatus::Completed
        )
    }
}

/// Everything guarded by the session write lock: the part file's bookkeeping
/// and the status variable. Holding the lock is what makes chunk writes and
/// finalization serial per session.
#[derive(Debug)]
pub struct SessionState {
    pub file_name: String,
    pub file_size: u64,
    pub status: UploadStatus,
    pub bytes_received: u64,
    pub part_path: PathBuf,
    pub final_path: PathBuf,
    pub remote_file_id: Option<String>,
    pub catalog_id: Option<i64>,
    pub folder_id: Option<String>,
}

impl SessionState {
    /// Progress in percent, rounded to two decimals and clamped to 100.
    pub fn percent(&self) -> f64 {
        let raw = 100.0 * self.bytes_received as f64 / self.file_size.max(1) as f64;
        (raw.min(100.0) * 100.0).round() / 100.0
    }

    /// Record an accepted chunk. Returns true when the declared size was
    /// just reached and the session moved to `completing`.
    pub fn record_chunk(&mut self, len: u64) -> bool {
        self.bytes_received += len;
        if self.bytes_received == self.file_size && self.status == UploadStatus::Active {
            self.status = UploadStatus::Completing;
            return true;
        }
        false
    }

    /// Pause the session; idempotent when already paused.
    pub fn pause(&mut self) -> Result<u64, TransferError> {
        match self.status {
            UploadStatus::Active | UploadStatus::Paused => {
                self.status = UploadStatus::Paused;
                Ok(self.bytes_received)
            }
            status => Err(TransferError::BadTransition {
                action: "pause",
                status,
            }),
        }
    }

    /// Resume a paused session; idempotent when already active.
    pub fn resume(&mut self) -> Result<u64, TransferError> {
        match self.status {
            UploadStatus::Paused | UploadStatus::Active => {
                self.status = UploadStatus::Active;
                Ok(self.bytes_received)
            }
            status => Err(TransferError::BadTransition {
                action: "resume",
                status,
            }),
        }
    }
}

/// One upload session per file id, shared across every connection that
/// attached to it.
pub struct UploadSession {
    pub file_id: String,
    state: Mutex<SessionState>,
}

impl UploadSession {
    pub fn new(file_id: String, state: SessionState) -> Self {
        Self {
            file_id,
            state: Mutex::new(state),
        }
    }

    /// The session write lock. Chunk writes, finalization, and every status
    /// mutation happen behind this guard.
    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }
}
