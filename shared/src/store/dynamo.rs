use super::{
    ChangeEvent, ChangeKind, Collection, Document, Insert, LedgerStore, StorePath, Swap,
    CHANGE_CHANNEL_CAPACITY,
};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use aws_sdk_dynamodb::error::{BuildError, DisplayErrorContext, SdkError};
use aws_sdk_dynamodb::types::{AttributeValue, Put, ReturnValue, TransactWriteItem};
use aws_sdk_dynamodb::Client as DynamoClient;
use std::collections::HashMap;
use tokio::sync::broadcast;

const UPDATE_FIELDS_ATTEMPTS: u32 = 8;

/// Single-table DynamoDB backend.
///
/// Items are keyed `PK = SK = USER#<id>` (and so on per collection), hold the
/// entity as a JSON string in `data` and a numeric `version`. Conditional
/// writes use `attribute_not_exists(PK)` and `#version = :expected`.
pub struct DynamoStore {
    client: DynamoClient,
    table_name: String,
    changes: broadcast::Sender<ChangeEvent>,
}

impl DynamoStore {
    pub fn new(client: DynamoClient, table_name: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            client,
            table_name: table_name.into(),
            changes,
        }
    }

    fn publish(&self, path: &StorePath, kind: ChangeKind, version: u64, value: Option<serde_json::Value>) {
        let _ = self.changes.send(ChangeEvent {
            path: path.clone(),
            kind,
            version,
            value,
        });
    }

    fn item_for(path: &StorePath, version: u64, value: &serde_json::Value) -> Result<HashMap<String, AttributeValue>> {
        let pk = path.partition_key();
        let data = serde_json::to_string(value).map_err(|e| LedgerError::Serialization {
            path: path.to_string(),
            message: e.to_string(),
        })?;

        let mut item = HashMap::new();
        item.insert("PK".to_string(), AttributeValue::S(pk.clone()));
        item.insert("SK".to_string(), AttributeValue::S(pk));
        item.insert(
            "entity_type".to_string(),
            AttributeValue::S(path.collection.as_str().to_string()),
        );
        item.insert("entity_id".to_string(), AttributeValue::S(path.id.clone()));
        item.insert("data".to_string(), AttributeValue::S(data));
        item.insert("version".to_string(), AttributeValue::N(version.to_string()));
        Ok(item)
    }

    fn document_from(path: StorePath, item: &HashMap<String, AttributeValue>) -> Result<Document> {
        let corrupt = |message: &str| LedgerError::Serialization {
            path: path.to_string(),
            message: message.to_string(),
        };
        let version = item
            .get("version")
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| corrupt("missing version"))?;
        let data = item
            .get("data")
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| corrupt("missing data"))?;
        let value = serde_json::from_str(data).map_err(|e| corrupt(&e.to_string()))?;
        Ok(Document { path, version, value })
    }

    /// Conditional put; `Ok(false)` when the condition did not hold.
    async fn conditional_put(
        &self,
        item: HashMap<String, AttributeValue>,
        condition: &str,
        expected_version: Option<u64>,
    ) -> Result<bool> {
        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression(condition);

        if let Some(expected) = expected_version {
            request = request
                .expression_attribute_names("#version", "version")
                .expression_attribute_values(":expected", AttributeValue::N(expected.to_string()));
        }

        match request.send().await {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(e)) if e.err().is_conditional_check_failed_exception() => Ok(false),
            Err(e) => Err(unavailable(e)),
        }
    }
}

fn unavailable<E, R>(e: SdkError<E, R>) -> LedgerError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("{}", DisplayErrorContext(&e));
    tracing::error!("DynamoDB request failed: {}", message);
    LedgerError::StorageUnavailable(message)
}

fn invalid_request(e: BuildError) -> LedgerError {
    LedgerError::StorageUnavailable(format!("could not build DynamoDB request: {}", e))
}

#[async_trait]
impl LedgerStore for DynamoStore {
    async fn get(&self, path: &StorePath) -> Result<Option<Document>> {
        let pk = path.partition_key();
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(pk.clone()))
            .key("SK", AttributeValue::S(pk))
            .consistent_read(true)
            .send()
            .await
            .map_err(unavailable)?;

        result
            .item()
            .map(|item| Self::document_from(path.clone(), item))
            .transpose()
    }

    async fn put(&self, path: &StorePath, value: serde_json::Value) -> Result<Document> {
        // Versions stay monotonic across blind writes
        let previous = self.get(path).await?;
        let version = previous.as_ref().map(|d| d.version + 1).unwrap_or(1);
        let item = Self::item_for(path, version, &value)?;

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .send()
            .await
            .map_err(unavailable)?;

        let kind = if previous.is_some() { ChangeKind::Updated } else { ChangeKind::Created };
        self.publish(path, kind, version, Some(value.clone()));
        Ok(Document {
            path: path.clone(),
            version,
            value,
        })
    }

    async fn insert(&self, path: &StorePath, value: serde_json::Value) -> Result<Insert> {
        let item = Self::item_for(path, 1, &value)?;
        if self
            .conditional_put(item, "attribute_not_exists(PK)", None)
            .await?
        {
            self.publish(path, ChangeKind::Created, 1, Some(value.clone()));
            return Ok(Insert::Inserted(Document {
                path: path.clone(),
                version: 1,
                value,
            }));
        }

        match self.get(path).await? {
            Some(existing) => Ok(Insert::Exists(existing)),
            // Deleted between the failed condition and the read
            None => Err(LedgerError::StorageUnavailable(format!(
                "{} changed while inserting",
                path
            ))),
        }
    }

    async fn compare_and_swap(
        &self,
        path: &StorePath,
        expected_version: u64,
        value: serde_json::Value,
    ) -> Result<Swap> {
        let version = expected_version + 1;
        let item = Self::item_for(path, version, &value)?;
        if !self
            .conditional_put(item, "#version = :expected", Some(expected_version))
            .await?
        {
            tracing::debug!("Conditional write lost on {} at version {}", path, expected_version);
            return Ok(Swap::Conflict);
        }

        self.publish(path, ChangeKind::Updated, version, Some(value.clone()));
        Ok(Swap::Swapped(Document {
            path: path.clone(),
            version,
            value,
        }))
    }

    async fn compare_and_swap_with_marker(
        &self,
        path: &StorePath,
        expected_version: u64,
        value: serde_json::Value,
        marker: &StorePath,
        marker_value: serde_json::Value,
    ) -> Result<Swap> {
        let version = expected_version + 1;
        let swap = Put::builder()
            .table_name(&self.table_name)
            .set_item(Some(Self::item_for(path, version, &value)?))
            .condition_expression("#version = :expected")
            .expression_attribute_names("#version", "version")
            .expression_attribute_values(":expected", AttributeValue::N(expected_version.to_string()))
            .build()
            .map_err(invalid_request)?;
        let mark = Put::builder()
            .table_name(&self.table_name)
            .set_item(Some(Self::item_for(marker, 1, &marker_value)?))
            .condition_expression("attribute_not_exists(PK)")
            .build()
            .map_err(invalid_request)?;

        let result = self
            .client
            .transact_write_items()
            .transact_items(TransactWriteItem::builder().put(swap).build())
            .transact_items(TransactWriteItem::builder().put(mark).build())
            .send()
            .await;
        match result {
            Ok(_) => {}
            // Either condition failed, or another transaction touched the items
            Err(SdkError::ServiceError(e)) if e.err().is_transaction_canceled_exception() => {
                tracing::debug!("Marked write lost on {} at version {}", path, expected_version);
                return Ok(Swap::Conflict);
            }
            Err(e) => return Err(unavailable(e)),
        }

        self.publish(path, ChangeKind::Updated, version, Some(value.clone()));
        self.publish(marker, ChangeKind::Created, 1, Some(marker_value));
        Ok(Swap::Swapped(Document {
            path: path.clone(),
            version,
            value,
        }))
    }

    async fn update_fields(
        &self,
        path: &StorePath,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<Document>> {
        // Fields live inside the JSON `data` attribute, so a partial update is
        // a conditional read-merge-write.
        for _ in 0..UPDATE_FIELDS_ATTEMPTS {
            let Some(current) = self.get(path).await? else {
                return Ok(None);
            };
            let mut value = current.value.clone();
            if let Some(object) = value.as_object_mut() {
                for (k, v) in &fields {
                    object.insert(k.clone(), v.clone());
                }
            }
            if let Swap::Swapped(doc) = self.compare_and_swap(path, current.version, value).await? {
                return Ok(Some(doc));
            }
        }
        Err(LedgerError::Conflict {
            path: path.clone(),
            attempts: UPDATE_FIELDS_ATTEMPTS,
        })
    }

    async fn delete(&self, path: &StorePath) -> Result<bool> {
        let pk = path.partition_key();
        let result = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(pk.clone()))
            .key("SK", AttributeValue::S(pk))
            .return_values(ReturnValue::AllOld)
            .send()
            .await
            .map_err(unavailable)?;

        let removed = result.attributes().map(|a| !a.is_empty()).unwrap_or(false);
        if removed {
            let version = result
                .attributes()
                .and_then(|a| a.get("version"))
                .and_then(|v| v.as_n().ok())
                .and_then(|n| n.parse::<u64>().ok())
                .map(|v| v + 1)
                .unwrap_or_default();
            self.publish(path, ChangeKind::Deleted, version, None);
        }
        Ok(removed)
    }

    async fn list(&self, collection: Collection) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let result = self
                .client
                .scan()
                .table_name(&self.table_name)
                .filter_expression("entity_type = :type")
                .expression_attribute_values(":type", AttributeValue::S(collection.as_str().to_string()))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(unavailable)?;

            for item in result.items() {
                let Some((_, id)) = item
                    .get("PK")
                    .and_then(|v| v.as_s().ok())
                    .and_then(|pk| Collection::from_key(pk))
                else {
                    continue;
                };
                let path = StorePath::new(collection, id);
                match Self::document_from(path, item) {
                    Ok(doc) => documents.push(doc),
                    Err(e) => tracing::warn!("Skipping unreadable item: {}", e),
                }
            }

            match result.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(documents)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
