//! Process-wide session registry and connection fan-out.
//!
//! Sessions are keyed by client-assigned file id and shared across every
//! connection that `start`s the same id. Connections register an outbound
//! event channel here; session events are broadcast to every subscriber.

use crate::catalog::Catalog;
use crate::common::TransferError;
use crate::protocol::{EventTx, ServerEvent};
use crate::upload::session::{SessionState, UploadSession, UploadStatus};
use crate::upload::stager;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type ConnectionId = u64;

struct ConnectionHandle {
    tx: EventTx,
    subscriptions: HashSet<String>,
}

pub struct UploadRegistry {
    sessions: DashMap<String, Arc<UploadSession>>,
    /// File ids that reached `completed` or `stopped`; never accepted again
    /// within this process.
    retired: DashSet<String>,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    next_connection: AtomicU64,
    staging_dir: PathBuf,
    catalog: Arc<dyn Catalog>,
}

impl UploadRegistry {
    pub fn new(staging_dir: PathBuf, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            sessions: DashMap::new(),
            retired: DashSet::new(),
            connections: DashMap::new(),
            next_connection: AtomicU64::new(1),
            staging_dir,
            catalog,
        }
    }

    //===============
    // Connections
    //===============

    pub fn register_connection(&self, tx: EventTx) -> ConnectionId {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(
            id,
            ConnectionHandle {
                tx,
                subscriptions: HashSet::new(),
            },
        );
        tracing::debug!(connection = id, "connection registered");
        id
    }

    /// Drop a connection. Every subscribed session still `active` is paused
    /// so it can be resumed later from any connection.
    pub async fn unregister_connection(&self, id: ConnectionId) {
        let Some((_, handle)) = self.connections.remove(&id) else {
            return;
        };
        for file_id in handle.subscriptions {
            if let Some(session) = self.get(&file_id) {
                let mut state = session.lock().await;
                if state.status == UploadStatus::Active {
                    state.status = UploadStatus::Paused;
                    tracing::info!(
                        file_id = %file_id,
                        file = %state.file_name,
                        "session paused on disconnect"
                    );
                }
            }
        }
        tracing::debug!(connection = id, "connection unregistered");
    }

    pub fn subscribe(&self, id: ConnectionId, file_id: &str) {
        if let Some(mut handle) = self.connections.get_mut(&id) {
            handle.subscriptions.insert(file_id.to_string());
        }
    }

    /// Send to one connection only; used for errors about sessions the
    /// connection is not subscribed to.
    pub fn send_to(&self, id: ConnectionId, event: ServerEvent) {
        if let Some(handle) = self.connections.get(&id) {
            let _ = handle.tx.send(event);
        }
    }

    /// Deliver an event to every connection subscribed to the session, plus
    /// the requester when it is not subscribed itself. Senders are snapshotted
    /// first so connection churn during the fan-out cannot tear the iteration,
    /// and one dead connection never blocks the rest.
    pub fn broadcast(&self, requester: Option<ConnectionId>, file_id: &str, event: ServerEvent) {
        let mut txs: Vec<EventTx> = Vec::new();
        let mut requester_covered = false;
        for entry in self.connections.iter() {
            if entry.value().subscriptions.contains(file_id) {
                if Some(*entry.key()) == requester {
                    requester_covered = true;
                }
                txs.push(entry.value().tx.clone());
            }
        }
        if !requester_covered {
            if let Some(id) = requester {
                if let Some(handle) = self.connections.get(&id) {
                    txs.push(handle.tx.clone());
                }
            }
        }
        for tx in txs {
            let _ = tx.send(event.clone());
        }
    }

    //===============
    // Sessions
    //===============

    pub fn get(&self, file_id: &str) -> Option<Arc<UploadSession>> {
        self.sessions.get(file_id).map(|s| Arc::clone(s.value()))
    }

    /// Idempotent `start`: create the session or re-attach to an existing
    /// one, reconciling the offset with the bytes already staged on disk.
    /// This is the only place disk truth feeds the offset, and it runs only
    /// at start-time, never mid-stream.
    pub async fn get_or_create(
        &self,
        file_id: &str,
        safe_name: &str,
        file_size: u64,
        folder_id: Option<String>,
    ) -> Result<Arc<UploadSession>, TransferError> {
        if self.retired.contains(file_id) {
            return Err(TransferError::FileIdRetired);
        }

        let part_path = stager::part_path(&self.staging_dir, file_id, safe_name);
        let final_path = stager::final_path(&self.staging_dir, file_id, safe_name);

        if let Some(existing) = self.get(file_id) {
            let mut state = existing.lock().await;
            if state.status.blocks_restart() {
                return Err(TransferError::BadTransition {
                    action: "restart upload",
                    status: state.status,
                });
            }
            state.file_name = safe_name.to_string();
            state.file_size = file_size;
            state.part_path = part_path.clone();
            state.final_path = final_path;
            state.bytes_received = stager::stored_len(&part_path).await;
            // a fully staged file re-attaches ready to finalize, not active
            state.status = if state.bytes_received == file_size {
                UploadStatus::Completing
            } else {
                UploadStatus::Active
            };
            if folder_id.is_some() {
                state.folder_id = folder_id;
            }
            tracing::debug!(
                file_id,
                offset = state.bytes_received,
                "resuming existing session"
            );
            drop(state);
            return Ok(existing);
        }

        let staged = stager::stored_len(&part_path).await;
        if staged > 0 {
            tracing::info!(file_id, bytes = staged, "found existing partial file");
        }

        let mut state = SessionState {
            file_name: safe_name.to_string(),
            file_size,
            status: if staged == file_size {
                UploadStatus::Completing
            } else {
                UploadStatus::Active
            },
            bytes_received: staged,
            part_path,
            final_path,
            remote_file_id: None,
            catalog_id: None,
            folder_id,
        };

        let temp_ref = format!("{file_id}_{safe_name}");
        match self
            .catalog
            .register(safe_name, file_size, "websocket", &temp_ref)
            .await
        {
            Ok(id) => state.catalog_id = Some(id),
            Err(err) => {
                tracing::warn!(file_id, error = %err, "catalog registration failed");
            }
        }

        let session = self
            .sessions
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(UploadSession::new(file_id.to_string(), state)))
            .clone();
        tracing::info!(file_id, file = safe_name, size = file_size, "created upload session");
        Ok(session)
    }

    /// Terminal removal. The id is tombstoned so it is never accepted again
    /// in this process, and every connection's subscription to it is dropped.
    pub fn retire(&self, file_id: &str) {
        self.sessions.remove(file_id);
        self.retired.insert(file_id.to_string());
        for mut entry in self.connections.iter_mut() {
            entry.value_mut().subscriptions.remove(file_id);
        }
        tracing::debug!(file_id, "session retired");
    }

    //===============
    // Catalog
    //===============

    pub async fn catalog_update(
        &self,
        catalog_id: Option<i64>,
        status: &str,
        final_path: Option<&str>,
    ) {
        if let Some(id) = catalog_id {
            if let Err(err) = self.catalog.update(id, status, final_path).await {
                tracing::warn!(catalog_id = id, status, error = %err, "catalog update failed");
            }
        }
    }

    pub async fn catalog_delete(&self, catalog_id: Option<i64>) {
        if let Some(id) = catalog_id {
            if let Err(err) = self.catalog.delete(id).await {
                tracing::warn!(catalog_id = id, error = %err, "catalog delete failed");
            }
        }
    }
}
