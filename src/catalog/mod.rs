//! Interface to the external metadata catalog.
//!
//! The broker only issues writes and never reads metadata back, so the
//! catalog can be an SQL store, a KV store, or nothing at all. Catalog
//! failures are logged by callers and never fail a transfer.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Record a newly staged file; returns the catalog id for later updates.
    async fn register(
        &self,
        name: &str,
        size: u64,
        owner: &str,
        temp_ref: &str,
    ) -> anyhow::Result<i64>;

    /// Update transfer status, optionally recording the final path.
    async fn update(&self, id: i64, status: &str, final_path: Option<&str>) -> anyhow::Result<()>;

    async fn delete(&self, id: i64) -> anyhow::Result<()>;
}

/// Catalog that records nothing; used when no metadata store is wired up.
pub struct NoopCatalog {
    next_id: AtomicI64,
}

impl NoopCatalog {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for NoopCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Catalog for NoopCatalog {
    async fn register(
        &self,
        _name: &str,
        _size: u64,
        _owner: &str,
        _temp_ref: &str,
    ) -> anyhow::Result<i64> {
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn update(
        &self,
        _id: i64,
        _status: &str,
        _final_path: Option<&str>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn delete(&self, _id: i64) -> anyhow::Result<()> {
        Ok(())
    }
}
