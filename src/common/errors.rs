//! Transfer error types surfaced to clients as `error` events.

use crate::upload::UploadStatus;
use thiserror::Error;

/// Everything that can go wrong while brokering a transfer.
///
/// Protocol and decode errors are per-message and leave session state alone.
/// State and offset errors are diagnostic; the client decides whether to
/// retry. Integrity, io, and downstream errors move the session to `error`.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Missing action")]
    MissingAction,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid {0} payload")]
    InvalidPayload(&'static str),

    #[error("Session not found")]
    SessionNotFound,

    #[error("File ID already completed or stopped")]
    FileIdRetired,

    #[error("Cannot {action} in status: {status}")]
    BadTransition {
        action: &'static str,
        status: UploadStatus,
    },

    #[error("Size mismatch. Not completed.")]
    SizeMismatch,

    #[error("Chunk exceeds declared file size")]
    ChunkOverflow,

    #[error("Invalid base64 data")]
    Base64(#[from] base64::DecodeError),

    #[error("Temporary file missing")]
    PartFileMissing,

    #[error("File size mismatch: expected {expected}, got {actual}")]
    DiskSizeMismatch { expected: u64, actual: u64 },

    #[error("Header value contains invalid characters")]
    InvalidHeader,

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote upload failed: HTTP {0}")]
    RemoteStatus(reqwest::StatusCode),

    #[error("Remote upload failed: {0}")]
    Remote(#[from] reqwest::Error),

    #[error("Download failed: {0}")]
    DownloadFailed(#[source] reqwest::Error),

    #[error("Download failed: HTTP {0}")]
    DownloadHttp(reqwest::StatusCode),
}

impl TransferError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}
