use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DurableStore, StoreError, StoreKey, StoredRecord};

/// `DurableStore` backed by process memory. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    record: RwLock<StoredRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `record`.
    pub fn with_record(record: StoredRecord) -> Self {
        Self {
            record: RwLock::new(record),
        }
    }

    /// Returns a copy of everything currently stored.
    pub async fn snapshot(&self) -> StoredRecord {
        self.record.read().await.clone()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, keys: &[StoreKey]) -> Result<StoredRecord, StoreError> {
        Ok(self.record.read().await.project(keys))
    }

    async fn set(&self, record: StoredRecord) -> Result<(), StoreError> {
        self.record.write().await.merge(record);
        Ok(())
    }

    async fn remove(&self, keys: &[StoreKey]) -> Result<(), StoreError> {
        self.record.write().await.remove(keys);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.record.write().await = StoredRecord::default();
        Ok(())
    }
}
