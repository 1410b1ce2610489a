//! Path-addressed document storage for every ledger entity.
//!
//! Documents live at `{collection}/{id}` and carry a version that moves on
//! every write. Writes that touch hot counters go through
//! [`LedgerStore::compare_and_swap`] so concurrent sessions never lose an
//! update.

pub mod dynamo;
pub mod memory;

pub use dynamo::DynamoStore;
pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Users,
    Jobs,
    Submissions,
    Withdrawals,
    Deposits,
    Verifications,
    /// Applied balance-award markers, one per user and award key
    Awards,
    Settings,
}

impl Collection {
    pub const ALL: [Collection; 8] = [
        Collection::Users,
        Collection::Jobs,
        Collection::Submissions,
        Collection::Withdrawals,
        Collection::Deposits,
        Collection::Verifications,
        Collection::Awards,
        Collection::Settings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Jobs => "jobs",
            Collection::Submissions => "submissions",
            Collection::Withdrawals => "withdrawals",
            Collection::Deposits => "deposits",
            Collection::Verifications => "verifications",
            Collection::Awards => "awards",
            Collection::Settings => "settings",
        }
    }

    /// Partition key prefix used by the single-table layout.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Collection::Users => "USER#",
            Collection::Jobs => "JOB#",
            Collection::Submissions => "SUBMISSION#",
            Collection::Withdrawals => "WITHDRAWAL#",
            Collection::Deposits => "DEPOSIT#",
            Collection::Verifications => "VERIFICATION#",
            Collection::Awards => "AWARD#",
            Collection::Settings => "SETTINGS#",
        }
    }

    pub fn from_key(pk: &str) -> Option<(Collection, &str)> {
        Self::ALL
            .iter()
            .find_map(|c| pk.strip_prefix(c.key_prefix()).map(|id| (*c, id)))
    }

    pub fn parse(name: &str) -> Option<Collection> {
        Self::ALL.iter().copied().find(|c| c.as_str() == name)
    }

    /// Singular entity name, as used in change messages.
    pub fn entity_name(&self) -> &'static str {
        match self {
            Collection::Users => "user",
            Collection::Jobs => "job",
            Collection::Submissions => "submission",
            Collection::Withdrawals => "withdrawal",
            Collection::Deposits => "deposit",
            Collection::Verifications => "verification",
            Collection::Awards => "award",
            Collection::Settings => "settings",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorePath {
    pub collection: Collection,
    pub id: String,
}

impl StorePath {
    pub fn new(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
        }
    }

    pub fn partition_key(&self) -> String {
        format!("{}{}", self.collection.key_prefix(), self.id)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub path: StorePath,
    pub version: u64,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Insert {
    Inserted(Document),
    /// Something already lives at the path; nothing was written.
    Exists(Document),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Swap {
    Swapped(Document),
    /// The version moved (or the document vanished) since it was read.
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// Pushed to subscribers after every successful write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub path: StorePath,
    pub kind: ChangeKind,
    pub version: u64,
    pub value: Option<serde_json::Value>,
}

impl ChangeEvent {
    pub fn message_type(&self) -> String {
        format!("{}_{}", self.path.collection.entity_name(), self.kind.as_str())
    }
}

pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Durable key-path store. Every call may fail with `StorageUnavailable`
/// independently of business logic.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Point read
    async fn get(&self, path: &StorePath) -> Result<Option<Document>>;

    /// Unconditional write
    async fn put(&self, path: &StorePath, value: serde_json::Value) -> Result<Document>;

    /// Write only if nothing exists at `path`
    async fn insert(&self, path: &StorePath, value: serde_json::Value) -> Result<Insert>;

    /// Write only if the stored version still equals `expected_version`
    async fn compare_and_swap(
        &self,
        path: &StorePath,
        expected_version: u64,
        value: serde_json::Value,
    ) -> Result<Swap>;

    /// Compare-and-swap `path` and create `marker` as one atomic write.
    /// Reports `Conflict` when the version moved or the marker already exists.
    async fn compare_and_swap_with_marker(
        &self,
        path: &StorePath,
        expected_version: u64,
        value: serde_json::Value,
        marker: &StorePath,
        marker_value: serde_json::Value,
    ) -> Result<Swap>;

    /// Merge top-level fields into an existing document; `None` if absent
    async fn update_fields(
        &self,
        path: &StorePath,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<Document>>;

    /// Returns whether something was removed
    async fn delete(&self, path: &StorePath) -> Result<bool>;

    async fn list(&self, collection: Collection) -> Result<Vec<Document>>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_and_keys() {
        let path = StorePath::new(Collection::Users, "abc");
        assert_eq!(path.to_string(), "users/abc");
        assert_eq!(path.partition_key(), "USER#abc");

        assert_eq!(Collection::from_key("JOB#42"), Some((Collection::Jobs, "42")));
        assert_eq!(Collection::from_key("CONNECTION#1"), None);
        assert_eq!(
            Collection::from_key("AWARD#u1#job:j1:s1"),
            Some((Collection::Awards, "u1#job:j1:s1"))
        );
        assert_eq!(Collection::parse("deposits"), Some(Collection::Deposits));
    }

    #[test]
    fn test_change_message_type() {
        let event = ChangeEvent {
            path: StorePath::new(Collection::Verifications, "v1"),
            kind: ChangeKind::Updated,
            version: 3,
            value: None,
        };
        assert_eq!(event.message_type(), "verification_updated");
    }
}
