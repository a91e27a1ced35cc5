use async_trait::async_trait;
use shared::HistoryRecord;
use tokio::sync::RwLock;

use super::{HistoryEntry, HistoryError, HistoryStore};

/// Process-local store; records are lost on restart.
#[derive(Default)]
pub struct MemoryHistoryStore {
    records: RwLock<Vec<HistoryRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> Result<HistoryRecord, HistoryError> {
        let record = entry.into_record();
        self.records.write().await.push(record.clone());
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        Ok(self.records.read().await.clone())
    }
}
