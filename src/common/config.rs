//! Broker configuration: defaults, optional TOML file, environment overrides.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_FRAME: usize = 8 * 1024 * 1024; // 8 MiB

/// Runtime configuration for the broker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Host the WebSocket transport binds to.
    pub host: String,
    /// Port the WebSocket transport binds to. Zero lets the OS pick.
    pub port: u16,
    /// Directory for in-flight part files.
    pub staging_dir: PathBuf,
    /// Directory completed downloads are placed in.
    pub downloads_dir: PathBuf,
    /// Downstream HTTP store finished uploads are posted to.
    pub remote_url: String,
    /// Bearer credential for the downstream store.
    pub remote_token: String,
    /// Maximum WebSocket message size in bytes.
    pub max_frame_bytes: usize,
    /// Connect timeout for outbound downloads, in seconds.
    pub download_connect_timeout_secs: u64,
    /// Overall timeout for outbound downloads, in seconds.
    pub download_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            staging_dir: PathBuf::from("staging"),
            downloads_dir: PathBuf::from("downloads"),
            remote_url: "http://127.0.0.1:5000/api/upload".to_string(),
            remote_token: "dev-token".to_string(),
            max_frame_bytes: DEFAULT_MAX_FRAME,
            download_connect_timeout_secs: 30,
            download_timeout_secs: 300,
        }
    }
}

impl BrokerConfig {
    /// Layered load: defaults, then the TOML file if given, then
    /// `DROPRELAY_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("DROPRELAY_"))
            .extract()
            .context("invalid broker configuration")
    }
}
