//! Durable settings for the heating daemon.
//!
//! A minimal key/value contract over `(device_id, setting_key) → string`.
//! The core only persists one key — the setpoint — so the store stays a
//! small seam: redb in production, an in-memory map in tests and
//! storage-less deployments. Persistence failures are the caller's to log;
//! the in-memory state always wins.

mod memory;
mod redb_store;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemorySettingsStore;
pub use redb_store::RedbSettingsStore;

/// Setting key for the persisted setpoint temperature.
pub const SETPOINT_KEY: &str = "setpoint_temperature";

/// Errors from the settings backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("transaction: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit: {0}")]
    Commit(#[from] redb::CommitError),
}

/// Durable key/value settings per device.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, device_id: &str, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, device_id: &str, key: &str, value: &str) -> Result<(), StorageError>;
}
