//! Per-download session state.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Stopped,
    Error,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Active => "active",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Stopped => "stopped",
            DownloadStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// State guarded by the session lock. The cancellation token is present only
/// while a fetch task is running.
#[derive(Debug)]
pub struct DownloadState {
    pub url: String,
    pub filename: String,
    pub total_size: u64,
    pub downloaded_bytes: u64,
    pub status: DownloadStatus,
    pub temp_path: PathBuf,
    pub cancel: Option<CancellationToken>,
}

pub struct DownloadSession {
    pub session_id: String,
    state: Mutex<DownloadState>,
}

impl DownloadSession {
    pub fn new(session_id: String, state: DownloadState) -> Self {
        Self {
            session_id,
            state: Mutex::new(state),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, DownloadState> {
        self.state.lock().await
    }
}
