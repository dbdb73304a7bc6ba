//! WebSocket transport server and shared broker state.

pub mod ws;

use crate::catalog::Catalog;
use crate::common::BrokerConfig;
use crate::download::DownloadManager;
use crate::upload::{RemoteStore, UploadRegistry};
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::ops::Deref;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Cheaply cloned handle to broker state stored behind `Arc`.
#[derive(Clone)]
pub struct BrokerState {
    inner: Arc<BrokerInner>,
}

pub struct BrokerInner {
    pub config: BrokerConfig,
    pub uploads: UploadRegistry,
    pub downloads: DownloadManager,
    pub store: RemoteStore,
}

impl Deref for BrokerState {
    type Target = BrokerInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl BrokerState {
    /// Build broker state with an injected catalog; creates the staging and
    /// downloads directories up front so transfers never race their creation.
    pub fn new(config: BrokerConfig, catalog: Arc<dyn Catalog>) -> Result<Self> {
        std::fs::create_dir_all(&config.staging_dir).context("create staging dir")?;
        std::fs::create_dir_all(&config.downloads_dir).context("create downloads dir")?;

        let uploads = UploadRegistry::new(config.staging_dir.clone(), catalog);
        let downloads = DownloadManager::new(&config)?;
        let store = RemoteStore::new(&config);

        Ok(Self {
            inner: Arc::new(BrokerInner {
                config,
                uploads,
                downloads,
                store,
            }),
        })
    }
}

/// Health probe plus the WebSocket endpoint.
pub fn create_router(state: &BrokerState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/ws", get(ws::ws_handler))
        .with_state(state.clone())
}

/// Bind the configured address; port 0 lets the OS pick (used in tests).
pub async fn bind(config: &BrokerConfig) -> Result<TcpListener> {
    TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("bind {}:{}", config.host, config.port))
}

pub async fn run(listener: TcpListener, state: BrokerState) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "broker listening");
    axum::serve(listener, create_router(&state))
        .await
        .context("transport server exited")
}
