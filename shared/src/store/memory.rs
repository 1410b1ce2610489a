use super::{
    ChangeEvent, ChangeKind, Collection, Document, Insert, LedgerStore, StorePath, Swap,
    CHANGE_CHANNEL_CAPACITY,
};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

#[derive(Default)]
struct Table {
    documents: BTreeMap<StorePath, (u64, serde_json::Value)>,
    last_version: u64,
}

impl Table {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }
}

/// In-memory storage backend for testing and development
pub struct MemoryStore {
    table: Arc<RwLock<Table>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            table: Arc::new(RwLock::new(Table::default())),
            changes,
        }
    }

    fn publish(&self, path: &StorePath, kind: ChangeKind, version: u64, value: Option<serde_json::Value>) {
        // No subscribers is not an error
        let _ = self.changes.send(ChangeEvent {
            path: path.clone(),
            kind,
            version,
            value,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get(&self, path: &StorePath) -> Result<Option<Document>> {
        let table = self.table.read().await;
        Ok(table.documents.get(path).map(|(version, value)| Document {
            path: path.clone(),
            version: *version,
            value: value.clone(),
        }))
    }

    async fn put(&self, path: &StorePath, value: serde_json::Value) -> Result<Document> {
        let mut table = self.table.write().await;
        let version = table.next_version();
        let existed = table
            .documents
            .insert(path.clone(), (version, value.clone()))
            .is_some();
        drop(table);

        let kind = if existed { ChangeKind::Updated } else { ChangeKind::Created };
        self.publish(path, kind, version, Some(value.clone()));
        Ok(Document {
            path: path.clone(),
            version,
            value,
        })
    }

    async fn insert(&self, path: &StorePath, value: serde_json::Value) -> Result<Insert> {
        let mut table = self.table.write().await;
        if let Some((version, existing)) = table.documents.get(path) {
            return Ok(Insert::Exists(Document {
                path: path.clone(),
                version: *version,
                value: existing.clone(),
            }));
        }
        let version = table.next_version();
        table.documents.insert(path.clone(), (version, value.clone()));
        drop(table);

        self.publish(path, ChangeKind::Created, version, Some(value.clone()));
        Ok(Insert::Inserted(Document {
            path: path.clone(),
            version,
            value,
        }))
    }

    async fn compare_and_swap(
        &self,
        path: &StorePath,
        expected_version: u64,
        value: serde_json::Value,
    ) -> Result<Swap> {
        let mut table = self.table.write().await;
        match table.documents.get(path) {
            Some((current, _)) if *current == expected_version => {}
            _ => return Ok(Swap::Conflict),
        }
        let version = table.next_version();
        table.documents.insert(path.clone(), (version, value.clone()));
        drop(table);

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
        let mut table = self.table.write().await;
        match table.documents.get(path) {
            Some((current, _)) if *current == expected_version => {}
            _ => return Ok(Swap::Conflict),
        }
        if table.documents.contains_key(marker) {
            return Ok(Swap::Conflict);
        }
        let version = table.next_version();
        table.documents.insert(path.clone(), (version, value.clone()));
        let marker_version = table.next_version();
        table
            .documents
            .insert(marker.clone(), (marker_version, marker_value.clone()));
        drop(table);

        self.publish(path, ChangeKind::Updated, version, Some(value.clone()));
        self.publish(marker, ChangeKind::Created, marker_version, Some(marker_value));
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
        let mut table = self.table.write().await;
        let version = table.next_version();
        let Some((stored_version, value)) = table.documents.get_mut(path) else {
            return Ok(None);
        };
        if let Some(object) = value.as_object_mut() {
            for (k, v) in fields {
                object.insert(k, v);
            }
        }
        *stored_version = version;
        let value = value.clone();
        drop(table);

        self.publish(path, ChangeKind::Updated, version, Some(value.clone()));
        Ok(Some(Document {
            path: path.clone(),
            version,
            value,
        }))
    }

    async fn delete(&self, path: &StorePath) -> Result<bool> {
        let mut table = self.table.write().await;
        let removed = table.documents.remove(path);
        let version = table.next_version();
        drop(table);

        if removed.is_some() {
            self.publish(path, ChangeKind::Deleted, version, None);
        }
        Ok(removed.is_some())
    }

    async fn list(&self, collection: Collection) -> Result<Vec<Document>> {
        let table = self.table.read().await;
        Ok(table
            .documents
            .iter()
            .filter(|(path, _)| path.collection == collection)
            .map(|(path, (version, value))| Document {
                path: path.clone(),
                version: *version,
                value: value.clone(),
            })
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(id: &str) -> StorePath {
        StorePath::new(Collection::Jobs, id)
    }

    #[tokio::test]
    async fn test_insert_is_conditional_on_absence() {
        let store = MemoryStore::new();
        let first = store.insert(&path("a"), json!({"n": 1})).await.unwrap();
        assert!(matches!(first, Insert::Inserted(_)));

        match store.insert(&path("a"), json!({"n": 2})).await.unwrap() {
            Insert::Exists(doc) => assert_eq!(doc.value, json!({"n": 1})),
            other => panic!("expected Exists, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_compare_and_swap_rejects_stale_version() {
        let store = MemoryStore::new();
        let doc = store.put(&path("a"), json!({"n": 1})).await.unwrap();

        let swapped = store
            .compare_and_swap(&path("a"), doc.version, json!({"n": 2}))
            .await
            .unwrap();
        let Swap::Swapped(new_doc) = swapped else { panic!("expected swap") };
        assert!(new_doc.version > doc.version);

        // Second writer still holds the old version
        let stale = store
            .compare_and_swap(&path("a"), doc.version, json!({"n": 3}))
            .await
            .unwrap();
        assert_eq!(stale, Swap::Conflict);

        let missing = store
            .compare_and_swap(&path("b"), 1, json!({}))
            .await
            .unwrap();
        assert_eq!(missing, Swap::Conflict);
    }

    #[tokio::test]
    async fn test_marked_swap_writes_both_or_neither() {
        let store = MemoryStore::new();
        let marker = StorePath::new(Collection::Awards, "u1#bonus:b1");
        let doc = store.put(&path("a"), json!({"n": 1})).await.unwrap();

        let swapped = store
            .compare_and_swap_with_marker(&path("a"), doc.version, json!({"n": 2}), &marker, json!({}))
            .await
            .unwrap();
        let Swap::Swapped(new_doc) = swapped else { panic!("expected swap") };
        assert!(store.get(&marker).await.unwrap().is_some());

        // Marker already present: the document must stay as it is
        let again = store
            .compare_and_swap_with_marker(&path("a"), new_doc.version, json!({"n": 3}), &marker, json!({}))
            .await
            .unwrap();
        assert_eq!(again, Swap::Conflict);
        assert_eq!(store.get(&path("a")).await.unwrap().unwrap().value, json!({"n": 2}));

        let other = StorePath::new(Collection::Awards, "u1#bonus:b2");
        let stale = store
            .compare_and_swap_with_marker(&path("a"), doc.version, json!({"n": 4}), &other, json!({}))
            .await
            .unwrap();
        assert_eq!(stale, Swap::Conflict);
        assert!(store.get(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_fields_bumps_version_and_merges() {
        let store = MemoryStore::new();
        let doc = store.put(&path("a"), json!({"n": 1, "s": "x"})).await.unwrap();

        let mut fields = serde_json::Map::new();
        fields.insert("s".into(), json!("y"));
        let updated = store.update_fields(&path("a"), fields.clone()).await.unwrap().unwrap();
        assert_eq!(updated.value, json!({"n": 1, "s": "y"}));
        assert!(updated.version > doc.version);

        assert!(store.update_fields(&path("zz"), fields).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscribers_see_every_write() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        store.put(&path("a"), json!({})).await.unwrap();
        store.put(&path("a"), json!({"x": 1})).await.unwrap();
        assert!(store.delete(&path("a")).await.unwrap());
        assert!(!store.delete(&path("a")).await.unwrap());

        assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Created);
        assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Updated);
        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.kind, ChangeKind::Deleted);
        assert!(deleted.value.is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_collection() {
        let store = MemoryStore::new();
        store.put(&path("a"), json!({})).await.unwrap();
        store
            .put(&StorePath::new(Collection::Users, "u"), json!({}))
            .await
            .unwrap();

        let jobs = store.list(Collection::Jobs).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].path.id, "a");
    }
}
