pub mod dynamodb;
pub mod memory;

use async_trait::async_trait;
use chrono::Utc;
use shared::{ClassificationResult, HistoryRecord, ImageSource, PatientInfo};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("History store is not configured")]
    Disabled,
    #[error("DynamoDB error: {0}")]
    DynamoDb(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid data format: {0}")]
    InvalidData(String),
}

/// A prediction waiting to be persisted. The store assigns identity and
/// timestamp when it writes the record.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub patient: PatientInfo,
    pub result: ClassificationResult,
    pub image_source: ImageSource,
    pub image_sha256: String,
}

impl HistoryEntry {
    pub fn into_record(self) -> HistoryRecord {
        HistoryRecord {
            id: Uuid::new_v4().to_string(),
            patient: self.patient,
            result: self.result,
            image_source: self.image_source,
            image_sha256: self.image_sha256,
            created_at: Utc::now(),
        }
    }
}

/// Append-only log of predictions.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, entry: HistoryEntry) -> Result<HistoryRecord, HistoryError>;

    async fn list(&self) -> Result<Vec<HistoryRecord>, HistoryError>;
}

#[derive(Clone, Default)]
pub struct HistoryService {
    store: Option<Arc<dyn HistoryStore>>,
}

impl HistoryService {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store: Some(store) }
    }

    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Persists the entry if a store is configured. Failures are logged and
    /// swallowed so a completed classification is never lost to the client.
    pub async fn record(&self, entry: HistoryEntry) -> Option<HistoryRecord> {
        let store = self.store.as_ref()?;
        match store.append(entry).await {
            Ok(record) => {
                log::info!(
                    "Stored history record {} ({})",
                    record.id,
                    record.result.predicted_class
                );
                Some(record)
            }
            Err(e) => {
                log::error!("Failed to persist history record: {}", e);
                None
            }
        }
    }

    /// All records, newest first.
    pub async fn list(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let store = self.store.as_ref().ok_or(HistoryError::Disabled)?;
        let mut records = store.list().await?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
