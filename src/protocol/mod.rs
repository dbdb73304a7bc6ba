//! Wire protocol: the JSON messages exchanged with clients.
//!
//! Client messages carry an `action` tag plus camelCase fields; server
//! messages carry an `event` tag. Chunk payloads are base64 so the whole
//! protocol stays text-framed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::upload::UploadStatus;

/// Outbound event channel handed to whatever produces events for a
/// connection; the connection's writer task drains it.
pub type EventTx = mpsc::UnboundedSender<ServerEvent>;

fn default_delete() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    #[serde(default)]
    pub folder_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub file_id: String,
    pub offset: u64,
    pub data: String,
}

/// Shared shape for actions that only name a session.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPayload {
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPayload {
    pub file_id: String,
    #[serde(default = "default_delete")]
    pub delete: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStartPayload {
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

/// Server → client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    StartAck {
        file_id: String,
        offset: u64,
        status: UploadStatus,
    },
    ChunkAck {
        file_id: String,
        offset: u64,
        received_bytes: u64,
        percent: f64,
    },
    OffsetMismatch {
        file_id: String,
        expected: u64,
        received: u64,
    },
    Paused {
        file_id: String,
        offset: u64,
    },
    ResumeAck {
        file_id: String,
        offset: u64,
    },
    StopAck {
        file_id: String,
    },
    LocalComplete {
        file_id: String,
        message: String,
    },
    Uploading {
        file_id: String,
        message: String,
    },
    CompleteAck {
        file_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        remote_file_id: Option<String>,
        status: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
        error: String,
    },
    DownloadStartAck {
        file_id: String,
        filename: String,
        offset: u64,
    },
    DownloadInfo {
        file_id: String,
        total_size: u64,
        supports_resume: bool,
    },
    DownloadProgress {
        file_id: String,
        downloaded_bytes: u64,
        total_size: u64,
        progress: f64,
    },
    DownloadComplete {
        file_id: String,
        filename: String,
        file_path: String,
        total_size: u64,
    },
    DownloadPauseAck {
        file_id: String,
    },
    DownloadResumeAck {
        file_id: String,
    },
    DownloadStopAck {
        file_id: String,
    },
    DownloadError {
        #[serde(skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
        error: String,
    },
}

impl ServerEvent {
    /// Wrap any displayable error as an `error` event.
    pub fn error(file_id: Option<String>, err: impl std::fmt::Display) -> Self {
        ServerEvent::Error {
            file_id,
            error: err.to_string(),
        }
    }
}

/// Pull `fileId` out of a raw message so error events can name the session
/// even when the payload fails to decode.
pub fn file_id_of(value: &Value) -> Option<String> {
    value
        .get("fileId")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_kebab_tags_and_camel_fields() {
        let ack = ServerEvent::StartAck {
            file_id: "F1".into(),
            offset: 0,
            status: UploadStatus::Active,
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"event": "start-ack", "fileId": "F1", "offset": 0, "status": "active"})
        );

        let ack = ServerEvent::ChunkAck {
            file_id: "F1".into(),
            offset: 2,
            received_bytes: 2,
            percent: 66.67,
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({
                "event": "chunk-ack",
                "fileId": "F1",
                "offset": 2,
                "receivedBytes": 2,
                "percent": 66.67
            })
        );
    }

    #[test]
    fn error_event_omits_absent_file_id() {
        let value = serde_json::to_value(ServerEvent::error(None, "Invalid JSON")).unwrap();
        assert_eq!(value, json!({"event": "error", "error": "Invalid JSON"}));
    }

    #[test]
    fn stop_payload_defaults_to_delete() {
        let stop: StopPayload = serde_json::from_value(json!({"fileId": "F1"})).unwrap();
        assert!(stop.delete);

        let keep: StopPayload =
            serde_json::from_value(json!({"fileId": "F1", "delete": false})).unwrap();
        assert!(!keep.delete);
    }

    #[test]
    fn chunk_payload_rejects_negative_offset() {
        let result: Result<ChunkPayload, _> =
            serde_json::from_value(json!({"fileId": "F1", "offset": -1, "data": "QUI="}));
        assert!(result.is_err());
    }

    #[test]
    fn file_id_is_extracted_from_raw_messages() {
        let value = json!({"action": "bogus", "fileId": "F9"});
        assert_eq!(file_id_of(&value).as_deref(), Some("F9"));
        assert_eq!(file_id_of(&json!({"action": "bogus"})), None);
    }
}
