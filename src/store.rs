use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::rate_limit::IdentifierRecord;

/// Durable home of identifier records.
///
/// Implementations do not need their own read-modify-write locking: every
/// identifier has a single actor that is the only caller for its key.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load(&self, identifier: &str) -> Result<Option<IdentifierRecord>, StoreError>;

    async fn save(&self, identifier: &str, record: &IdentifierRecord) -> Result<(), StoreError>;

    /// Removes the record. Returns whether one existed.
    async fn delete(&self, identifier: &str) -> Result<bool, StoreError>;
}

// In-process store, lost on restart
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, IdentifierRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load(&self, identifier: &str) -> Result<Option<IdentifierRecord>, StoreError> {
        Ok(self.records.get(identifier).map(|entry| entry.value().clone()))
    }

    async fn save(&self, identifier: &str, record: &IdentifierRecord) -> Result<(), StoreError> {
        self.records.insert(identifier.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, identifier: &str) -> Result<bool, StoreError> {
        Ok(self.records.remove(identifier).is_some())
    }
}
