//! Connection multiplexer: one read loop per WebSocket client.
//!
//! Each connection gets an outbound channel drained by a writer task that
//! owns the socket's sink half; everything that wants to reach the client
//! (handlers, broadcasts, download tasks) sends events into that channel.
//! Protocol errors never tear the connection down.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::common::TransferError;
use crate::protocol::{
    self, ChunkPayload, ControlPayload, DownloadStartPayload, EventTx, ServerEvent, StartPayload,
    StopPayload,
};
use crate::server::BrokerState;
use crate::upload::handlers;
use crate::upload::registry::ConnectionId;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<BrokerState>) -> Response {
    let max = state.config.max_frame_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: BrokerState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    // writer task: owns the sink, drains the event channel, dies with the
    // socket once every sender is gone
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => tracing::error!(error = %err, "failed to serialize event"),
            }
        }
    });

    let conn = state.uploads.register_connection(tx.clone());
    tracing::info!(connection = conn, "client connected");

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => dispatch(&state, conn, &tx, &text).await,
            Ok(Message::Close(_)) | Err(_) => break,
            // binary frames are not part of the protocol; pings are answered
            // by the transport layer
            Ok(_) => {}
        }
    }

    // downgrade every active session this connection was driving so a later
    // connection can resume it
    state.uploads.unregister_connection(conn).await;
    tracing::info!(connection = conn, "connection closed");
}

async fn dispatch(state: &BrokerState, conn: ConnectionId, tx: &EventTx, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(connection = conn, "invalid JSON from client");
            state
                .uploads
                .send_to(conn, ServerEvent::error(None, TransferError::InvalidJson));
            return;
        }
    };

    let file_id = protocol::file_id_of(&value);
    let Some(action) = value.get("action").and_then(Value::as_str).map(str::to_owned) else {
        state
            .uploads
            .send_to(conn, ServerEvent::error(file_id, TransferError::MissingAction));
        return;
    };
    tracing::debug!(connection = conn, action, "client action");

    match action.as_str() {
        "start" => match serde_json::from_value::<StartPayload>(value) {
            Ok(payload) => handlers::handle_start(state, conn, payload).await,
            Err(_) => send_invalid(state, conn, file_id, "start"),
        },
        "chunk" => match serde_json::from_value::<ChunkPayload>(value) {
            Ok(payload) => handlers::handle_chunk(state, conn, payload).await,
            Err(_) => send_invalid(state, conn, file_id, "chunk"),
        },
        "pause" => match serde_json::from_value::<ControlPayload>(value) {
            Ok(payload) => handlers::handle_pause(state, conn, payload).await,
            Err(_) => send_invalid(state, conn, file_id, "pause"),
        },
        "resume" => match serde_json::from_value::<ControlPayload>(value) {
            Ok(payload) => handlers::handle_resume(state, conn, payload).await,
            Err(_) => send_invalid(state, conn, file_id, "resume"),
        },
        "stop" => match serde_json::from_value::<StopPayload>(value) {
            Ok(payload) => handlers::handle_stop(state, conn, payload).await,
            Err(_) => send_invalid(state, conn, file_id, "stop"),
        },
        "complete" => match serde_json::from_value::<ControlPayload>(value) {
            Ok(payload) => handlers::handle_complete(state, conn, payload).await,
            Err(_) => send_invalid(state, conn, file_id, "complete"),
        },
        "download-start" => match serde_json::from_value::<DownloadStartPayload>(value) {
            Ok(payload) => handle_download_start(state, conn, tx, payload).await,
            Err(_) => state.uploads.send_to(
                conn,
                ServerEvent::DownloadError {
                    file_id,
                    error: "Invalid download-start payload".to_string(),
                },
            ),
        },
        "download-pause" => match serde_json::from_value::<ControlPayload>(value) {
            Ok(payload) => {
                state.downloads.pause(&payload.file_id).await;
                state.uploads.send_to(
                    conn,
                    ServerEvent::DownloadPauseAck {
                        file_id: payload.file_id,
                    },
                );
            }
            Err(_) => send_invalid(state, conn, file_id, "download-pause"),
        },
        "download-resume" => match serde_json::from_value::<ControlPayload>(value) {
            Ok(payload) => {
                let resumed = state.downloads.resume(&payload.file_id, tx.clone()).await;
                let event = if resumed {
                    ServerEvent::DownloadResumeAck {
                        file_id: payload.file_id,
                    }
                } else {
                    ServerEvent::DownloadError {
                        file_id: Some(payload.file_id),
                        error: "Failed to resume download".to_string(),
                    }
                };
                state.uploads.send_to(conn, event);
            }
            Err(_) => send_invalid(state, conn, file_id, "download-resume"),
        },
        "download-stop" => match serde_json::from_value::<ControlPayload>(value) {
            Ok(payload) => {
                state.downloads.stop(&payload.file_id).await;
                state.uploads.send_to(
                    conn,
                    ServerEvent::DownloadStopAck {
                        file_id: payload.file_id,
                    },
                );
            }
            Err(_) => send_invalid(state, conn, file_id, "download-stop"),
        },
        other => {
            tracing::warn!(connection = conn, action = other, "unknown action");
            state.uploads.send_to(
                conn,
                ServerEvent::error(file_id, TransferError::UnknownAction(other.to_string())),
            );
        }
    }
}

fn send_invalid(
    state: &BrokerState,
    conn: ConnectionId,
    file_id: Option<String>,
    action: &'static str,
) {
    tracing::warn!(connection = conn, action, "invalid payload");
    state.uploads.send_to(
        conn,
        ServerEvent::error(file_id, TransferError::InvalidPayload(action)),
    );
}

async fn handle_download_start(
    state: &BrokerState,
    conn: ConnectionId,
    tx: &EventTx,
    payload: DownloadStartPayload,
) {
    let Some(url) = payload.url.filter(|url| !url.is_empty()) else {
        state.uploads.send_to(
            conn,
            ServerEvent::DownloadError {
                file_id: payload.file_id,
                error: "URL is required".to_string(),
            },
        );
        return;
    };

    let file_id = payload.file_id.clone();
    let started = state
        .downloads
        .start(payload.file_id, url, payload.filename, tx.clone())
        .await;
    if !started {
        state.uploads.send_to(
            conn,
            ServerEvent::DownloadError {
                file_id,
                error: "Failed to start download".to_string(),
            },
        );
    }
}
