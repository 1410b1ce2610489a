//! Client-side mirror of ledger documents with optimistic edits.
//!
//! A local edit is shown immediately but stays unconfirmed until a pushed
//! change at or beyond the version it was based on arrives. If the pushed
//! document matches the edit it is confirmed, otherwise the edit is dropped
//! and the authoritative document wins.

use crate::error::Result;
use crate::ledger::{Entity, Ledger, Versioned};
use crate::store::{ChangeEvent, ChangeKind};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Authoritative copy updated, no local edit was waiting on it
    Updated,
    Confirmed,
    RolledBack,
    /// Older than what the view already holds, or another collection
    Ignored,
}

struct Overlay<T> {
    base_version: u64,
    value: T,
}

pub struct LocalView<T: Entity> {
    confirmed: HashMap<String, Versioned<T>>,
    pending: HashMap<String, Overlay<T>>,
}

impl<T: Entity> Default for LocalView<T> {
    fn default() -> Self {
        Self {
            confirmed: HashMap::new(),
            pending: HashMap::new(),
        }
    }
}

impl<T: Entity> LocalView<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-read one document from the ledger, e.g. after reconnecting.
    pub async fn refresh(&mut self, ledger: &Ledger, id: &str) -> Result<()> {
        match ledger.find::<T>(id).await? {
            Some(doc) => self.seed(doc),
            None => {
                self.confirmed.remove(id);
                self.pending.remove(id);
            }
        }
        Ok(())
    }

    pub fn seed(&mut self, doc: Versioned<T>) {
        let id = doc.entity.id().to_string();
        match self.confirmed.get(&id) {
            Some(existing) if existing.version >= doc.version => {}
            _ => {
                self.confirmed.insert(id, doc);
            }
        }
    }

    /// What the user should see: the local edit if one is waiting, else the
    /// last authoritative copy.
    pub fn get(&self, id: &str) -> Option<&T> {
        self.pending
            .get(id)
            .map(|o| &o.value)
            .or_else(|| self.confirmed.get(id).map(|v| &v.entity))
    }

    pub fn confirmed(&self, id: &str) -> Option<&Versioned<T>> {
        self.confirmed.get(id)
    }

    pub fn is_unconfirmed(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn apply_local(&mut self, value: T) {
        let id = value.id().to_string();
        let base_version = self.confirmed.get(&id).map_or(0, |v| v.version);
        self.pending.insert(id, Overlay { base_version, value });
    }

    /// Drop a local edit, typically because the write behind it failed.
    pub fn rollback(&mut self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    pub fn on_change(&mut self, event: &ChangeEvent) -> Reconciled {
        if event.path.collection != T::COLLECTION {
            return Reconciled::Ignored;
        }
        let id = event.path.id.as_str();
        if self.confirmed.get(id).is_some_and(|v| v.version >= event.version) {
            return Reconciled::Ignored;
        }

        let incoming = match (event.kind, &event.value) {
            (ChangeKind::Deleted, _) | (_, None) => None,
            (_, Some(value)) => match serde_json::from_value::<T>(value.clone()) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    tracing::warn!(path = %event.path, error = %e, "Ignoring undecodable change event");
                    return Reconciled::Ignored;
                }
            },
        };

        match incoming {
            Some(entity) => {
                self.confirmed.insert(
                    id.to_string(),
                    Versioned {
                        version: event.version,
                        entity,
                    },
                );
            }
            None => {
                self.confirmed.remove(id);
            }
        }

        let settles = self
            .pending
            .get(id)
            .is_some_and(|o| event.version > o.base_version);
        if !settles {
            return Reconciled::Updated;
        }

        let overlay = match self.pending.remove(id) {
            Some(o) => o,
            None => return Reconciled::Updated,
        };
        let matches = event.value.is_some()
            && serde_json::to_value(&overlay.value).ok().as_ref() == event.value.as_ref();
        if matches {
            Reconciled::Confirmed
        } else {
            tracing::debug!(path = %event.path, "Local edit rolled back by authoritative change");
            Reconciled::RolledBack
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::money::Money;
    use crate::store::{Collection, MemoryStore, StorePath};
    use crate::types::{Job, JobCategory};
    use std::sync::Arc;

    fn job(title: &str) -> Job {
        Job {
            job_id: "j1".into(),
            poster_id: "p1".into(),
            title: title.into(),
            category: JobCategory::Instagram,
            payout: Money::from_millis(15),
            completed_count: 0,
            max_count: 4,
            target_country: "International".into(),
            is_top_job: false,
            instructions: None,
            thumbnail: None,
            completed_units: Default::default(),
            funded: true,
            closed: false,
            created_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    fn event(version: u64, job: &Job) -> ChangeEvent {
        ChangeEvent {
            path: StorePath::new(Collection::Jobs, "j1"),
            kind: ChangeKind::Updated,
            version,
            value: Some(serde_json::to_value(job).unwrap()),
        }
    }

    #[test]
    fn test_matching_push_confirms_edit() {
        let mut view = LocalView::<Job>::new();
        view.seed(Versioned { version: 3, entity: job("Like") });
        view.apply_local(job("Like and share"));
        assert!(view.is_unconfirmed("j1"));
        assert_eq!(view.get("j1").unwrap().title, "Like and share");

        assert_eq!(view.on_change(&event(4, &job("Like and share"))), Reconciled::Confirmed);
        assert!(!view.is_unconfirmed("j1"));
        assert_eq!(view.confirmed("j1").unwrap().version, 4);
    }

    #[test]
    fn test_conflicting_push_rolls_back() {
        let mut view = LocalView::<Job>::new();
        view.seed(Versioned { version: 3, entity: job("Like") });
        view.apply_local(job("Mine"));

        assert_eq!(view.on_change(&event(2, &job("Old"))), Reconciled::Ignored);
        assert!(view.is_unconfirmed("j1"));

        assert_eq!(view.on_change(&event(5, &job("Theirs"))), Reconciled::RolledBack);
        assert_eq!(view.get("j1").unwrap().title, "Theirs");
    }

    #[tokio::test]
    async fn test_refresh_and_explicit_rollback() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()), LedgerConfig::default());
        ledger.create(&job("Stored")).await.unwrap();

        let mut view = LocalView::<Job>::new();
        view.refresh(&ledger, "j1").await.unwrap();
        view.apply_local(job("Draft"));
        assert!(view.rollback("j1"));
        assert_eq!(view.get("j1").unwrap().title, "Stored");
    }
}
