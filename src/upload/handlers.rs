//! Handlers for the upload actions: start, chunk, pause, resume, stop,
//! complete. Each one looks up the session, drives the status machine under
//! the session lock, and fans the resulting events out to subscribers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::common::TransferError;
use crate::protocol::{ChunkPayload, ControlPayload, ServerEvent, StartPayload, StopPayload};
use crate::server::BrokerState;
use crate::upload::handoff::HandoffMeta;
use crate::upload::registry::ConnectionId;
use crate::upload::session::UploadStatus;
use crate::upload::stager;
use crate::utils::security;

pub async fn handle_start(state: &BrokerState, conn: ConnectionId, payload: StartPayload) {
    let file_id = payload.file_id;
    if file_id.is_empty() || payload.file_size == 0 {
        state.uploads.send_to(
            conn,
            ServerEvent::error(
                Some(file_id).filter(|id| !id.is_empty()),
                TransferError::InvalidPayload("start"),
            ),
        );
        return;
    }

    let safe_name = match security::sanitize_file_name(&payload.file_name) {
        Ok(name) => name,
        Err(err) => {
            tracing::warn!(file_id, error = %err, "rejected start payload");
            state.uploads.send_to(
                conn,
                ServerEvent::error(Some(file_id), TransferError::InvalidPayload("start")),
            );
            return;
        }
    };

    let session = match state
        .uploads
        .get_or_create(&file_id, &safe_name, payload.file_size, payload.folder_id)
        .await
    {
        Ok(session) => session,
        Err(err) => {
            state
                .uploads
                .send_to(conn, ServerEvent::error(Some(file_id), err));
            return;
        }
    };

    state.uploads.subscribe(conn, &file_id);

    let (offset, status) = {
        let session_state = session.lock().await;
        (session_state.bytes_received, session_state.status)
    };
    tracing::info!(
        file_id,
        file = safe_name,
        size = payload.file_size,
        offset,
        "upload started"
    );
    state.uploads.broadcast(
        Some(conn),
        &file_id,
        ServerEvent::StartAck {
            file_id: file_id.clone(),
            offset,
            status,
        },
    );
}

pub async fn handle_chunk(state: &BrokerState, conn: ConnectionId, payload: ChunkPayload) {
    let file_id = payload.file_id;
    let Some(session) = state.uploads.get(&file_id) else {
        state.uploads.send_to(
            conn,
            ServerEvent::error(Some(file_id), TransferError::SessionNotFound),
        );
        return;
    };

    let mut session_state = session.lock().await;
    match session_state.status {
        UploadStatus::Active => {}
        UploadStatus::Paused => {
            let offset = session_state.bytes_received;
            drop(session_state);
            state.uploads.broadcast(
                Some(conn),
                &file_id,
                ServerEvent::Paused {
                    file_id: file_id.clone(),
                    offset,
                },
            );
            return;
        }
        status => {
            drop(session_state);
            tracing::warn!(file_id, %status, "chunk rejected in wrong status");
            state.uploads.broadcast(
                Some(conn),
                &file_id,
                ServerEvent::error(
                    Some(file_id.clone()),
                    TransferError::BadTransition {
                        action: "accept chunk",
                        status,
                    },
                ),
            );
            return;
        }
    }

    let expected = session_state.bytes_received;
    if payload.offset != expected {
        drop(session_state);
        tracing::warn!(file_id, expected, received = payload.offset, "offset mismatch");
        state.uploads.broadcast(
            Some(conn),
            &file_id,
            ServerEvent::OffsetMismatch {
                file_id: file_id.clone(),
                expected,
                received: payload.offset,
            },
        );
        return;
    }

    let data = match BASE64.decode(payload.data.as_bytes()) {
        Ok(data) => data,
        Err(err) => {
            drop(session_state);
            state.uploads.broadcast(
                Some(conn),
                &file_id,
                ServerEvent::error(Some(file_id.clone()), TransferError::Base64(err)),
            );
            return;
        }
    };

    if session_state.bytes_received + data.len() as u64 > session_state.file_size {
        drop(session_state);
        state.uploads.broadcast(
            Some(conn),
            &file_id,
            ServerEvent::error(Some(file_id.clone()), TransferError::ChunkOverflow),
        );
        return;
    }

    if let Err(err) = stager::append_chunk(&session_state.part_path, &data).await {
        session_state.status = UploadStatus::Error;
        drop(session_state);
        tracing::error!(file_id, error = %err, "chunk write failed");
        state.uploads.broadcast(
            Some(conn),
            &file_id,
            ServerEvent::error(Some(file_id.clone()), err),
        );
        return;
    }

    let completing = session_state.record_chunk(data.len() as u64);
    let offset = session_state.bytes_received;
    let percent = session_state.percent();
    drop(session_state);

    state.uploads.broadcast(
        Some(conn),
        &file_id,
        ServerEvent::ChunkAck {
            file_id: file_id.clone(),
            offset,
            received_bytes: data.len() as u64,
            percent,
        },
    );

    if completing {
        tracing::info!(file_id, "staged bytes reached declared size");
        state.uploads.broadcast(
            Some(conn),
            &file_id,
            ServerEvent::LocalComplete {
                file_id: file_id.clone(),
                message: "Local upload completed, finalizing...".to_string(),
            },
        );
    }
}

pub async fn handle_pause(state: &BrokerState, conn: ConnectionId, payload: ControlPayload) {
    let file_id = payload.file_id;
    let Some(session) = state.uploads.get(&file_id) else {
        state.uploads.send_to(
            conn,
            ServerEvent::error(Some(file_id), TransferError::SessionNotFound),
        );
        return;
    };

    let mut session_state = session.lock().await;
    match session_state.pause() {
        Ok(offset) => {
            let catalog_id = session_state.catalog_id;
            drop(session_state);
            state.uploads.catalog_update(catalog_id, "paused", None).await;
            tracing::info!(file_id, offset, "upload paused");
            state.uploads.broadcast(
                Some(conn),
                &file_id,
                ServerEvent::Paused {
                    file_id: file_id.clone(),
                    offset,
                },
            );
        }
        Err(err) => {
            drop(session_state);
            state
                .uploads
                .broadcast(Some(conn), &file_id, ServerEvent::error(Some(file_id.clone()), err));
        }
    }
}

pub async fn handle_resume(state: &BrokerState, conn: ConnectionId, payload: ControlPayload) {
    let file_id = payload.file_id;
    let Some(session) = state.uploads.get(&file_id) else {
        state.uploads.send_to(
            conn,
            ServerEvent::error(Some(file_id), TransferError::SessionNotFound),
        );
        return;
    };

    // a resuming client may be a brand-new connection
    state.uploads.subscribe(conn, &file_id);

    let mut session_state = session.lock().await;
    match session_state.resume() {
        Ok(offset) => {
            let catalog_id = session_state.catalog_id;
            drop(session_state);
            state
                .uploads
                .catalog_update(catalog_id, "uploading", None)
                .await;
            tracing::info!(file_id, offset, "upload resumed");
            state.uploads.broadcast(
                Some(conn),
                &file_id,
                ServerEvent::ResumeAck {
                    file_id: file_id.clone(),
                    offset,
                },
            );
        }
        Err(err) => {
            drop(session_state);
            state
                .uploads
                .broadcast(Some(conn), &file_id, ServerEvent::error(Some(file_id.clone()), err));
        }
    }
}

pub async fn handle_stop(state: &BrokerState, conn: ConnectionId, payload: StopPayload) {
    let file_id = payload.file_id;
    let Some(session) = state.uploads.get(&file_id) else {
        state.uploads.send_to(
            conn,
            ServerEvent::error(Some(file_id), TransferError::SessionNotFound),
        );
        return;
    };

    let mut session_state = session.lock().await;
    session_state.status = UploadStatus::Stopped;
    let catalog_id = session_state.catalog_id;
    let part_path = session_state.part_path.clone();
    let final_path = session_state.final_path.clone();
    drop(session_state);

    tracing::info!(file_id, delete = payload.delete, "upload stopped");
    if payload.delete {
        state.uploads.catalog_delete(catalog_id).await;
        stager::remove_artifacts(&part_path, &final_path).await;
    }

    state.uploads.broadcast(
        Some(conn),
        &file_id,
        ServerEvent::StopAck {
            file_id: file_id.clone(),
        },
    );
    state.uploads.retire(&file_id);
}

pub async fn handle_complete(state: &BrokerState, conn: ConnectionId, payload: ControlPayload) {
    let file_id = payload.file_id;
    let Some(session) = state.uploads.get(&file_id) else {
        state.uploads.send_to(
            conn,
            ServerEvent::error(Some(file_id), TransferError::SessionNotFound),
        );
        return;
    };

    let mut session_state = session.lock().await;

    if session_state.bytes_received != session_state.file_size {
        tracing::warn!(
            file_id,
            expected = session_state.file_size,
            actual = session_state.bytes_received,
            "complete rejected on size mismatch"
        );
        drop(session_state);
        state.uploads.broadcast(
            Some(conn),
            &file_id,
            ServerEvent::error(Some(file_id.clone()), TransferError::SizeMismatch),
        );
        return;
    }

    if session_state.status != UploadStatus::Completing {
        let status = session_state.status;
        drop(session_state);
        state.uploads.broadcast(
            Some(conn),
            &file_id,
            ServerEvent::error(
                Some(file_id.clone()),
                TransferError::BadTransition {
                    action: "finalize",
                    status,
                },
            ),
        );
        return;
    }

    if stager::stored_len(&session_state.part_path).await == 0 {
        // the session says everything is staged; an absent part file means
        // someone removed it out from under us
        drop(session_state);
        state.uploads.broadcast(
            Some(conn),
            &file_id,
            ServerEvent::error(Some(file_id.clone()), TransferError::PartFileMissing),
        );
        return;
    }

    let target = match stager::finalize(&session_state.part_path, &session_state.final_path).await
    {
        Ok(target) => target,
        Err(err) => {
            session_state.status = UploadStatus::Error;
            drop(session_state);
            tracing::error!(file_id, error = %err, "finalize failed");
            state.uploads.broadcast(
                Some(conn),
                &file_id,
                ServerEvent::error(Some(file_id.clone()), err),
            );
            return;
        }
    };

    session_state.final_path = target.clone();
    session_state.status = UploadStatus::Uploading;
    let catalog_id = session_state.catalog_id;
    let meta = HandoffMeta {
        file_id: file_id.clone(),
        file_name: session_state.file_name.clone(),
        file_size: session_state.file_size,
        folder_id: session_state.folder_id.clone(),
        path: target,
    };
    drop(session_state);

    state
        .uploads
        .catalog_update(catalog_id, "uploading", None)
        .await;
    tracing::info!(file_id, "beginning remote hand-off");
    state.uploads.broadcast(
        Some(conn),
        &file_id,
        ServerEvent::Uploading {
            file_id: file_id.clone(),
            message: "Uploading to remote server...".to_string(),
        },
    );

    // the hand-off runs without the session lock: the final file is immutable
    // and a concurrent stop must not wait on the network
    let result = state.store.push_file(&meta).await;

    let mut session_state = session.lock().await;
    if session_state.status != UploadStatus::Uploading {
        tracing::warn!(
            file_id,
            status = %session_state.status,
            "hand-off result discarded; session no longer uploading"
        );
        return;
    }

    match result {
        Ok(remote_file_id) => {
            session_state.status = UploadStatus::Completed;
            session_state.remote_file_id = remote_file_id.clone();
            let file_name = session_state.file_name.clone();
            drop(session_state);

            state
                .uploads
                .catalog_update(catalog_id, "completed", Some(&file_name))
                .await;
            tracing::info!(file_id, remote_file_id, "remote hand-off succeeded");
            state.uploads.broadcast(
                Some(conn),
                &file_id,
                ServerEvent::CompleteAck {
                    file_id: file_id.clone(),
                    remote_file_id,
                    status: "uploaded_to_remote".to_string(),
                },
            );

            // local copy goes away only after the response was parsed
            if let Err(err) = tokio::fs::remove_file(&meta.path).await {
                tracing::warn!(file_id, error = %err, "failed to delete handed-off file");
            }
            state.uploads.retire(&file_id);
        }
        Err(err) => {
            session_state.status = UploadStatus::Error;
            drop(session_state);

            state.uploads.catalog_update(catalog_id, "error", None).await;
            tracing::error!(file_id, error = %err, "remote hand-off failed");
            state.uploads.broadcast(
                Some(conn),
                &file_id,
                ServerEvent::error(Some(file_id.clone()), err),
            );
        }
    }
}
