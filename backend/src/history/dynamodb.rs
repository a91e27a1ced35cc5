use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, Utc};
use shared::{HistoryRecord, ImageSource, PatientInfo};
use std::collections::HashMap;
use std::str::FromStr;

use super::{HistoryEntry, HistoryError, HistoryStore};

type Item = HashMap<String, AttributeValue>;

/// History table keyed by `id`. Records are written once and never updated.
#[derive(Clone)]
pub struct DynamoDbHistoryStore {
    client: Client,
    table: String,
}

impl DynamoDbHistoryStore {
    pub fn new(client: Client, table: String) -> Self {
        Self { client, table }
    }

    /// Builds a client from the standard AWS environment (credentials,
    /// region, `AWS_ENDPOINT_URL`).
    pub async fn from_env(table: String) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::new(Client::new(&aws_config), table)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn check_table(&self) -> Result<(), HistoryError> {
        match self
            .client
            .describe_table()
            .table_name(&self.table)
            .send()
            .await
        {
            Ok(response) => {
                log::info!(
                    "DynamoDB table '{}' exists with status: {:?}",
                    self.table,
                    response.table().and_then(|t| t.table_status())
                );
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "DynamoDB table '{}' does not exist or is not accessible: {:?}",
                    self.table,
                    e
                );
                Err(HistoryError::DynamoDb(format!(
                    "Table '{}' not accessible: {}",
                    self.table, e
                )))
            }
        }
    }
}

#[async_trait]
impl HistoryStore for DynamoDbHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> Result<HistoryRecord, HistoryError> {
        let record = entry.into_record();
        let item = record_to_item(&record)?;

        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(id)")
            .send()
            .await
            .map_err(|e| {
                log::error!("DynamoDB put_item failed for record {}: {:?}", record.id, e);
                HistoryError::DynamoDb(e.to_string())
            })?;

        Ok(record)
    }

    async fn list(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let mut records = Vec::new();
        let mut start_key: Option<Item> = None;

        loop {
            let output = self
                .client
                .scan()
                .table_name(&self.table)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| HistoryError::DynamoDb(e.to_string()))?;

            if let Some(items) = output.items {
                for item in items {
                    records.push(record_from_item(item)?);
                }
            }

            match output.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }

        log::debug!("Scanned {} history records from '{}'", records.len(), self.table);
        Ok(records)
    }
}

fn record_to_item(record: &HistoryRecord) -> Result<Item, HistoryError> {
    let mut item = HashMap::new();
    item.insert("id".to_string(), AttributeValue::S(record.id.clone()));
    item.insert(
        "created_at".to_string(),
        AttributeValue::S(record.created_at.to_rfc3339()),
    );

    if let Some(name) = &record.patient.patient_name {
        item.insert("patient_name".to_string(), AttributeValue::S(name.clone()));
    }
    if let Some(age) = record.patient.patient_age {
        item.insert("patient_age".to_string(), AttributeValue::N(age.to_string()));
    }
    if let Some(contact) = &record.patient.contact_no {
        item.insert("contact_no".to_string(), AttributeValue::S(contact.clone()));
    }
    if let Some(duration) = record.patient.scar_duration {
        item.insert(
            "scar_duration".to_string(),
            AttributeValue::N(duration.to_string()),
        );
    }

    item.insert(
        "image_source".to_string(),
        AttributeValue::S(record.image_source.to_string()),
    );
    item.insert(
        "image_sha256".to_string(),
        AttributeValue::S(record.image_sha256.clone()),
    );
    item.insert(
        "result".to_string(),
        AttributeValue::S(serde_json::to_string(&record.result)?),
    );

    Ok(item)
}

fn record_from_item(item: Item) -> Result<HistoryRecord, HistoryError> {
    let string = |key: &str| item.get(key).and_then(|v| v.as_s().ok()).cloned();
    let number = |key: &str| {
        item.get(key)
            .and_then(|v| v.as_n().ok())
            .and_then(|s| s.parse::<u32>().ok())
    };

    let id = string("id").ok_or_else(|| HistoryError::InvalidData("Invalid id".to_string()))?;

    let created_at = string("created_at")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| HistoryError::InvalidData("Invalid created_at".to_string()))?;

    let result = string("result")
        .ok_or_else(|| HistoryError::InvalidData("Invalid result".to_string()))?;
    let result = serde_json::from_str(&result)?;

    let image_source = string("image_source")
        .and_then(|s| ImageSource::from_str(&s).ok())
        .ok_or_else(|| HistoryError::InvalidData("Invalid image_source".to_string()))?;

    let image_sha256 = string("image_sha256").unwrap_or_default();

    Ok(HistoryRecord {
        id,
        patient: PatientInfo {
            patient_name: string("patient_name"),
            patient_age: number("patient_age"),
            contact_no: string("contact_no"),
            scar_duration: number("scar_duration"),
        },
        result,
        image_source,
        image_sha256,
        created_at,
    })
}
