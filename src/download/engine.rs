//! URL fetcher with Range-based resume.
//!
//! Each download runs as its own task streaming the response body to a temp
//! file in the staging directory. Pause cancels the in-flight request and
//! keeps the temp file; resume re-issues the GET with a `Range` header from
//! the staged offset.

use crate::common::{BrokerConfig, TransferError};
use crate::protocol::{EventTx, ServerEvent};
use crate::download::session::{DownloadSession, DownloadState, DownloadStatus};
use crate::upload::stager;
use crate::utils::security;
use dashmap::DashMap;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Cheaply cloned handle to the download engine stored behind `Arc`.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<DownloadManagerInner>,
}

pub struct DownloadManagerInner {
    downloads: DashMap<String, Arc<DownloadSession>>,
    client: reqwest::Client,
    staging_dir: PathBuf,
    downloads_dir: PathBuf,
}

impl Deref for DownloadManager {
    type Target = DownloadManagerInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DownloadManager {
    pub fn new(config: &BrokerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.download_connect_timeout_secs))
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .build()?;
        Ok(Self {
            inner: Arc::new(DownloadManagerInner {
                downloads: DashMap::new(),
                client,
                staging_dir: config.staging_dir.clone(),
                downloads_dir: config.downloads_dir.clone(),
            }),
        })
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<DownloadSession>> {
        self.downloads.get(session_id).map(|s| Arc::clone(s.value()))
    }

    /// Create a session and spawn its fetch task. Returns false when the id
    /// already names a running download; a finished or errored id is simply
    /// replaced with a fresh session.
    pub async fn start(
        &self,
        file_id: Option<String>,
        url: String,
        filename: Option<String>,
        events: EventTx,
    ) -> bool {
        let session_id = file_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(existing) = self.get(&session_id) {
            let state = existing.lock().await;
            if matches!(state.status, DownloadStatus::Pending | DownloadStatus::Active) {
                return false;
            }
        }

        let filename = filename
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| name_from_url(&url));
        let temp_path = self.staging_dir.join(format!(
            "{session_id}_{}.download",
            security::filtered_file_name(&filename)
        ));

        let session = Arc::new(DownloadSession::new(
            session_id.clone(),
            DownloadState {
                url,
                filename,
                total_size: 0,
                downloaded_bytes: 0,
                status: DownloadStatus::Pending,
                temp_path,
                cancel: None,
            },
        ));
        self.downloads.insert(session_id.clone(), session.clone());
        tracing::info!(session = session_id, "created download session");

        self.spawn_fetch(session, events).await;
        true
    }

    /// Cancel the in-flight request; the temp file stays for a later resume.
    pub async fn pause(&self, session_id: &str) {
        if let Some(session) = self.get(session_id) {
            let mut state = session.lock().await;
            if let Some(token) = state.cancel.take() {
                token.cancel();
            }
            if state.status == DownloadStatus::Active {
                state.status = DownloadStatus::Paused;
            }
            tracing::info!(session = session_id, "download paused");
        }
    }

    /// Re-issue the fetch from the staged offset. Only paused sessions
    /// resume; anything else is refused.
    pub async fn resume(&self, session_id: &str, events: EventTx) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        {
            let state = session.lock().await;
            if state.status != DownloadStatus::Paused {
                return false;
            }
        }
        tracing::info!(session = session_id, "download resumed");
        self.spawn_fetch(session, events).await;
        true
    }

    /// Cancel, delete the temp file, and forget the session.
    pub async fn stop(&self, session_id: &str) {
        if let Some((_, session)) = self.downloads.remove(session_id) {
            let mut state = session.lock().await;
            state.status = DownloadStatus::Stopped;
            if let Some(token) = state.cancel.take() {
                token.cancel();
            }
            let temp_path = state.temp_path.clone();
            drop(state);

            match fs::remove_file(&temp_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(session = session_id, error = %err, "failed to delete download temp")
                }
            }
            tracing::info!(session = session_id, "download stopped");
        }
    }

    async fn spawn_fetch(&self, session: Arc<DownloadSession>, events: EventTx) {
        let token = CancellationToken::new();
        {
            let mut state = session.lock().await;
            state.status = DownloadStatus::Active;
            state.cancel = Some(token.clone());
        }
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.fetch(&session, &events, &token).await {
                let mut state = session.lock().await;
                if state.status == DownloadStatus::Active {
                    state.status = DownloadStatus::Error;
                }
                state.cancel = None;
                drop(state);
                tracing::error!(session = session.session_id, error = %err, "download failed");
                let _ = events.send(ServerEvent::DownloadError {
                    file_id: Some(session.session_id.clone()),
                    error: err.to_string(),
                });
            }
        });
    }

    async fn fetch(
        &self,
        session: &Arc<DownloadSession>,
        events: &EventTx,
        token: &CancellationToken,
    ) -> Result<(), TransferError> {
        let session_id = session.session_id.clone();
        let (url, mut downloaded, temp_path, filename) = {
            let state = session.lock().await;
            (
                state.url.clone(),
                state.downloaded_bytes,
                state.temp_path.clone(),
                state.filename.clone(),
            )
        };

        let _ = events.send(ServerEvent::DownloadStartAck {
            file_id: session_id.clone(),
            filename: filename.clone(),
            offset: downloaded,
        });

        let mut request = self.client.get(&url);
        let resuming = downloaded > 0;
        if resuming {
            request = request.header(RANGE, format!("bytes={downloaded}-"));
        }
        let response = request.send().await.map_err(TransferError::DownloadFailed)?;

        let code = response.status();
        if !code.is_success() {
            return Err(TransferError::DownloadHttp(code));
        }

        let supports_resume = code == StatusCode::PARTIAL_CONTENT;
        if resuming && !supports_resume {
            // origin ignored the Range header and restarted the body
            tracing::debug!(session = session_id, "origin restarted body; truncating temp");
            downloaded = 0;
        }

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let total_size = {
            let mut state = session.lock().await;
            state.downloaded_bytes = downloaded;
            if state.total_size == 0 {
                if let Some(len) = content_length {
                    state.total_size = if supports_resume { downloaded + len } else { len };
                }
            }
            state.total_size
        };

        let _ = events.send(ServerEvent::DownloadInfo {
            file_id: session_id.clone(),
            total_size,
            supports_resume,
        });

        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io("create staging dir", e))?;
        }
        let mut file = if downloaded > 0 {
            OpenOptions::new().append(true).open(&temp_path).await
        } else {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .await
        }
        .map_err(|e| TransferError::io("open download temp", e))?;

        let mut stream = response.bytes_stream();
        let mut last_progress = Instant::now();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    file.flush()
                        .await
                        .map_err(|e| TransferError::io("flush download temp", e))?;
                    let mut state = session.lock().await;
                    state.downloaded_bytes = downloaded;
                    // stop() flips the status before cancelling; only an
                    // actively fetching session becomes paused here
                    if state.status == DownloadStatus::Active {
                        state.status = DownloadStatus::Paused;
                    }
                    state.cancel = None;
                    tracing::info!(session = session_id, offset = downloaded, "fetch cancelled");
                    return Ok(());
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        file.write_all(&bytes)
                            .await
                            .map_err(|e| TransferError::io("write download temp", e))?;
                        downloaded += bytes.len() as u64;
                        session.lock().await.downloaded_bytes = downloaded;

                        if last_progress.elapsed() >= PROGRESS_INTERVAL {
                            let progress = if total_size > 0 {
                                downloaded as f64 / total_size as f64 * 100.0
                            } else {
                                0.0
                            };
                            let _ = events.send(ServerEvent::DownloadProgress {
                                file_id: session_id.clone(),
                                downloaded_bytes: downloaded,
                                total_size,
                                progress,
                            });
                            last_progress = Instant::now();
                        }
                    }
                    Some(Err(err)) => return Err(TransferError::DownloadFailed(err)),
                    None => break,
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| TransferError::io("flush download temp", e))?;
        drop(file);

        if total_size > 0 && downloaded < total_size {
            // short body; leave the session paused so a Range resume can
            // pick up from the staged offset
            let mut state = session.lock().await;
            state.downloaded_bytes = downloaded;
            if state.status == DownloadStatus::Active {
                state.status = DownloadStatus::Paused;
            }
            state.cancel = None;
            drop(state);
            tracing::warn!(
                session = session_id,
                downloaded,
                total_size,
                "download ended early"
            );
            let _ = events.send(ServerEvent::DownloadError {
                file_id: Some(session_id.clone()),
                error: format!("Download ended early: {downloaded} of {total_size} bytes"),
            });
            return Ok(());
        }

        fs::create_dir_all(&self.downloads_dir)
            .await
            .map_err(|e| TransferError::io("create downloads dir", e))?;
        let target = stager::free_download_path(&self.downloads_dir.join(&filename)).await;
        fs::rename(&temp_path, &target)
            .await
            .map_err(|e| TransferError::io("place download", e))?;
        let placed_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(filename);

        {
            let mut state = session.lock().await;
            state.status = DownloadStatus::Completed;
            state.downloaded_bytes = downloaded;
            state.filename = placed_name.clone();
            state.cancel = None;
        }
        tracing::info!(
            session = session_id,
            file = placed_name,
            bytes = downloaded,
            "download completed"
        );
        let _ = events.send(ServerEvent::DownloadComplete {
            file_id: session_id,
            filename: placed_name,
            file_path: target.display().to_string(),
            total_size: downloaded,
        });
        Ok(())
    }
}

/// Basename of the URL path, falling back to a generic name.
fn name_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.last().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "download".to_string())
}
