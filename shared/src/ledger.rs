use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::store::{ChangeEvent, Collection, Document, Insert, LedgerStore, StorePath, Swap};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A document type owned by the ledger.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: Collection;
    const NAME: &'static str;

    fn id(&self) -> &str;

    fn path_for(id: &str) -> StorePath {
        StorePath::new(Self::COLLECTION, id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub entity: T,
}

/// What a mutation closure decided after looking at the current document.
pub enum Mutation<R> {
    /// Write the modified document
    Apply(R),
    /// Leave the document untouched (already applied, nothing to do)
    Keep(R),
}

/// Result of [`Ledger::mutate`].
#[derive(Debug, Clone)]
pub struct Mutated<T, R> {
    pub entity: T,
    pub outcome: R,
    /// False when the closure returned [`Mutation::Keep`]
    pub written: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    New,
    AlreadyExisted,
}

/// Typed access to the store, shared by every engine.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    config: Arc<LedgerConfig>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    fn decode<T: Entity>(doc: &Document) -> Result<T> {
        serde_json::from_value(doc.value.clone()).map_err(|e| LedgerError::Serialization {
            path: doc.path.to_string(),
            message: e.to_string(),
        })
    }

    fn encode<T: Entity>(entity: &T) -> Result<serde_json::Value> {
        serde_json::to_value(entity).map_err(|e| LedgerError::Serialization {
            path: T::path_for(entity.id()).to_string(),
            message: e.to_string(),
        })
    }

    pub async fn find<T: Entity>(&self, id: &str) -> Result<Option<Versioned<T>>> {
        match self.store.get(&T::path_for(id)).await? {
            Some(doc) => Ok(Some(Versioned {
                version: doc.version,
                entity: Self::decode(&doc)?,
            })),
            None => Ok(None),
        }
    }

    pub async fn fetch<T: Entity>(&self, id: &str) -> Result<T> {
        self.find::<T>(id)
            .await?
            .map(|v| v.entity)
            .ok_or_else(|| LedgerError::not_found(T::NAME, id))
    }

    /// Insert unless the id is taken; a retried create observes its own
    /// earlier write instead of duplicating it.
    pub async fn create<T: Entity>(&self, entity: &T) -> Result<(T, Created)> {
        let path = T::path_for(entity.id());
        match self.store.insert(&path, Self::encode(entity)?).await? {
            Insert::Inserted(_) => Ok((entity.clone(), Created::New)),
            Insert::Exists(doc) => Ok((Self::decode(&doc)?, Created::AlreadyExisted)),
        }
    }

    /// Unconditional overwrite, for documents that hold no balances or
    /// counters. Returns the stored version.
    pub async fn save<T: Entity>(&self, entity: &T) -> Result<u64> {
        let doc = self.store.put(&T::path_for(entity.id()), Self::encode(entity)?).await?;
        Ok(doc.version)
    }

    pub async fn list<T: Entity>(&self) -> Result<Vec<T>> {
        self.store
            .list(T::COLLECTION)
            .await?
            .iter()
            .map(Self::decode)
            .collect()
    }

    pub async fn remove<T: Entity>(&self, id: &str) -> Result<bool> {
        self.store.delete(&T::path_for(id)).await
    }

    /// Merge plain fields that are not balances or counters.
    pub async fn update_fields<T: Entity>(
        &self,
        id: &str,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<T> {
        let doc = self
            .store
            .update_fields(&T::path_for(id), fields)
            .await?
            .ok_or_else(|| LedgerError::not_found(T::NAME, id))?;
        Self::decode(&doc)
    }

    /// Read, let `f` modify a copy, and write it back only if nobody else
    /// wrote in between. On conflict the whole cycle runs again against the
    /// fresh document, so `f` must be free of side effects.
    pub async fn mutate<T, R, F>(&self, id: &str, mut f: F) -> Result<Mutated<T, R>>
    where
        T: Entity,
        R: Send,
        F: FnMut(&mut T) -> Result<Mutation<R>> + Send,
    {
        let path = T::path_for(id);
        let attempts = self.config.max_cas_attempts.max(1);

        for attempt in 1..=attempts {
            let doc = self
                .store
                .get(&path)
                .await?
                .ok_or_else(|| LedgerError::not_found(T::NAME, id))?;
            let mut entity: T = Self::decode(&doc)?;

            let outcome = match f(&mut entity)? {
                Mutation::Keep(outcome) => {
                    return Ok(Mutated {
                        entity,
                        outcome,
                        written: false,
                    })
                }
                Mutation::Apply(outcome) => outcome,
            };

            match self
                .store
                .compare_and_swap(&path, doc.version, Self::encode(&entity)?)
                .await?
            {
                Swap::Swapped(_) => {
                    return Ok(Mutated {
                        entity,
                        outcome,
                        written: true,
                    })
                }
                Swap::Conflict => {
                    tracing::debug!(path = %path, attempt, "Conditional update conflicted, re-reading");
                }
            }
        }

        tracing::warn!(path = %path, attempts, "Giving up after repeated conflicts");
        Err(LedgerError::Conflict { path, attempts })
    }

    /// Like [`Ledger::mutate`], but the write also creates `marker`, and
    /// nothing happens once the marker exists. Returns `None` in that case.
    /// Used for changes that must land at most once without growing the
    /// document they modify.
    pub async fn mutate_once<T, M, R, F>(&self, id: &str, marker: &M, mut f: F) -> Result<Option<Mutated<T, R>>>
    where
        T: Entity,
        M: Entity,
        R: Send,
        F: FnMut(&mut T) -> Result<R> + Send,
    {
        let path = T::path_for(id);
        let marker_path = M::path_for(marker.id());
        let marker_value = Self::encode(marker)?;
        let attempts = self.config.max_cas_attempts.max(1);

        for attempt in 1..=attempts {
            if self.store.get(&marker_path).await?.is_some() {
                return Ok(None);
            }
            let doc = self
                .store
                .get(&path)
                .await?
                .ok_or_else(|| LedgerError::not_found(T::NAME, id))?;
            let mut entity: T = Self::decode(&doc)?;
            let outcome = f(&mut entity)?;

            match self
                .store
                .compare_and_swap_with_marker(&path, doc.version, Self::encode(&entity)?, &marker_path, marker_value.clone())
                .await?
            {
                Swap::Swapped(_) => {
                    return Ok(Some(Mutated {
                        entity,
                        outcome,
                        written: true,
                    }))
                }
                Swap::Conflict => {
                    tracing::debug!(path = %path, marker = %marker_path, attempt, "Marked update conflicted, re-reading");
                }
            }
        }

        tracing::warn!(path = %path, attempts, "Giving up after repeated conflicts");
        Err(LedgerError::Conflict { path, attempts })
    }

    /// Push updates for one collection, or every collection when `None`.
    pub fn subscribe(&self, collection: Option<Collection>) -> Subscription {
        Subscription {
            rx: self.store.subscribe(),
            collection,
        }
    }
}

/// Stream of changes under a path prefix. Consistency is eventual: a read
/// made right after a call may still be older than the next pushed event.
pub struct Subscription {
    rx: broadcast::Receiver<ChangeEvent>,
    collection: Option<Collection>,
}

impl Subscription {
    /// Next matching change; `None` once the store is gone. Subscribers
    /// that fall behind skip the dropped events and should re-read.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.collection.map_or(true, |c| c == event.path.collection) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Subscriber lagged; some change events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
