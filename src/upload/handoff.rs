//! Streaming hand-off of finalized files to the downstream HTTP store.

use crate::common::{BrokerConfig, TransferError};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

/// Metadata carried into one hand-off request.
pub struct HandoffMeta {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub folder_id: Option<String>,
    pub path: PathBuf,
}

/// Client for the downstream store finished uploads are posted to.
pub struct RemoteStore {
    client: reqwest::Client,
    url: String,
    token: String,
}

#[derive(Deserialize)]
struct StoreResponse {
    file_id: Option<String>,
}

impl RemoteStore {
    pub fn new(config: &BrokerConfig) -> Self {
        // no overall timeout here: hand-off duration scales with file size
        Self {
            client: reqwest::Client::new(),
            url: config.remote_url.clone(),
            token: config.remote_token.clone(),
        }
    }

    /// Stream the finalized file as the body of a single POST.
    ///
    /// The on-disk length is re-checked against the declared size before any
    /// bytes leave the machine; a 2xx response must carry a JSON body whose
    /// `file_id` becomes the remote id.
    pub async fn push_file(&self, meta: &HandoffMeta) -> Result<Option<String>, TransferError> {
        let file = File::open(&meta.path)
            .await
            .map_err(|e| TransferError::io("open finalized file", e))?;
        let actual = file
            .metadata()
            .await
            .map_err(|e| TransferError::io("stat finalized file", e))?
            .len();
        if actual != meta.file_size {
            return Err(TransferError::DiskSizeMismatch {
                expected: meta.file_size,
                actual,
            });
        }

        let mut request = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("X-File-Name", header_value(&meta.file_name)?)
            .header("X-File-Size", meta.file_size.to_string())
            .header("X-File-ID", header_value(&meta.file_id)?)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        if let Some(folder_id) = &meta.folder_id {
            request = request.header("X-Folder-ID", header_value(folder_id)?);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::RemoteStatus(status));
        }

        let parsed: StoreResponse = response.json().await?;
        Ok(parsed.file_id)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, TransferError> {
    HeaderValue::from_str(value).map_err(|_| TransferError::InvalidHeader)
}
