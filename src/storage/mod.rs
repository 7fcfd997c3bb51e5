// Durable credential storage
pub mod rocks_store;

use async_trait::async_trait;
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::security::credentials::{self, short_fingerprint, Credential, CredentialSummary};

pub use rocks_store::RocksCredentialStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("RocksDB error: {0}")]
    Rocks(#[from] rocksdb::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Credential not found")]
    NotFound,
    #[error("Other error: {0}")]
    Other(String),
}

/// Record of issued agent credentials.
///
/// Every call may block on disk I/O; callers must not hold shared locks
/// across an await on these methods.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Issue a new credential and return its plaintext secret. The secret
    /// cannot be read back from storage afterwards.
    async fn create(&self, label: &str) -> Result<String, StoreError> {
        self.create_owned(label, None).await
    }

    async fn create_owned(&self, label: &str, owner: Option<String>) -> Result<String, StoreError>;

    /// Insert `secret` unless it already exists. Never overwrites.
    async fn ensure(&self, secret: &str, label: &str) -> Result<(), StoreError>;

    fn is_valid_format(&self, secret: &str) -> bool {
        credentials::is_valid_format(secret)
    }

    /// Bearer check: well-formed, stored, and not past its expiry.
    async fn validate(&self, secret: &str) -> Result<bool, StoreError>;

    async fn exists_and_unexpired(&self, secret: &str) -> Result<bool, StoreError>;

    async fn lookup(&self, secret: &str) -> Result<Option<Credential>, StoreError>;

    /// Best-effort; a lost update only makes `last_used_at` slightly stale.
    async fn touch_last_used(&self, secret: &str) -> Result<(), StoreError>;

    /// The active record behind `secret`, with its last use stamped. `None`
    /// for malformed, unknown or expired secrets. A failed stamp is logged,
    /// not returned.
    async fn record_use(&self, secret: &str) -> Result<Option<Credential>, StoreError> {
        if !self.validate(secret).await? {
            return Ok(None);
        }
        let credential = self.lookup(secret).await?;
        if let Err(e) = self.touch_last_used(secret).await {
            warn!("⚠️  Failed to record last use of {}: {}", short_fingerprint(secret), e);
        }
        Ok(credential)
    }

    /// Replace `old_secret` with a new credential; the old one stays valid for
    /// the rotation grace period.
    async fn rotate(&self, old_secret: &str) -> Result<String, StoreError>;

    /// Delete every credential whose expiry has passed. Returns the number removed.
    async fn sweep_expired(&self) -> Result<usize, StoreError>;

    async fn list(&self) -> Result<Vec<CredentialSummary>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Run `sweep_expired` on a fixed interval until the task is aborted.
pub fn spawn_expiry_sweeper(store: Arc<dyn CredentialStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.sweep_expired().await {
                Ok(removed) => debug!("Credential sweep pass removed {}", removed),
                Err(e) => error!("❌ Credential sweep failed: {}", e),
            }
        }
    })
}
