//! In-memory settings store for tests and storage-less deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{SettingsStore, StorageError};

/// Volatile map with the same contract as the durable backends.
#[derive(Default)]
pub struct MemorySettingsStore {
    values: RwLock<HashMap<(String, String), String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, device_id: &str, key: &str) -> Result<Option<String>, StorageError> {
        let values = self.values.read().await;
        Ok(values
            .get(&(device_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn set(&self, device_id: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self.values.write().await;
        values.insert(
            (device_id.to_string(), key.to_string()),
            value.to_string(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set() {
        let store = MemorySettingsStore::new();
        assert_eq!(store.get("a", "k").await.unwrap(), None);
        store.set("a", "k", "v").await.unwrap();
        assert_eq!(store.get("a", "k").await.unwrap(), Some("v".to_string()));
    }
}
