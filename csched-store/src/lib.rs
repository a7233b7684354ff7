//! The configuration/artifact bucket (spec §5, §6): the single source of
//! truth for catalog, registry, forecast, and schedule documents.
//!
//! Writers coordinate via atomic temp-then-rename (spec §4.5, §5); readers
//! never hold locks and either observe the previous full object or the new
//! one, never a partial one.

pub mod fs;
pub mod mem;

pub use fs::FsObjectStore;
pub use mem::InMemoryObjectStore;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(String),
}

/// Bucket contract used by every component that reads or writes a
/// configuration/artifact object (catalog, registry, forecast, schedule).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object's raw bytes.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Atomically write an object: write to a temp key, then rename into
    /// place, so concurrent readers never observe a torn write.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// List keys under a prefix (used to discover `schedule_<id>.json`
    /// objects and deployable artifacts).
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
