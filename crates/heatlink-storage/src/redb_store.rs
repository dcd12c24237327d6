//! redb-backed settings store.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, TableDefinition};
use tracing::debug;

use crate::{SettingsStore, StorageError};

// key = (device_id, setting_key), value = setting as string
const SETTINGS_TABLE: TableDefinition<(&str, &str), &str> = TableDefinition::new("settings");

/// Settings persisted in a single-file redb database.
///
/// Transactions are short single-key operations, so they run inline on the
/// async callers; there is no separate blocking pool.
#[derive(Clone)]
pub struct RedbSettingsStore {
    db: Arc<Database>,
}

impl RedbSettingsStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path)?;
        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl SettingsStore for RedbSettingsStore {
    async fn get(&self, device_id: &str, key: &str) -> Result<Option<String>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(SETTINGS_TABLE) {
            Ok(table) => table,
            // Fresh database: nothing has been written yet.
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let value = table.get((device_id, key))?.map(|v| v.value().to_string());
        Ok(value)
    }

    async fn set(&self, device_id: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS_TABLE)?;
            table.insert((device_id, key), value)?;
        }
        txn.commit()?;
        debug!(device_id, key, value, "setting persisted");
        Ok(())
    }
}
