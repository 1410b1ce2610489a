#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use taskhub_shared::auth::{Actor, AdminPolicy, Identity};
use taskhub_shared::balance::BalanceField;
use taskhub_shared::config::LedgerConfig;
use taskhub_shared::types::{Job, JobCategory, NewJob, INTERNATIONAL};
use taskhub_shared::store::{
    ChangeEvent, Collection, Document, Insert, LedgerStore, MemoryStore, StorePath, Swap,
};
use taskhub_shared::{LedgerError, Money, Result, Services};
use tokio::sync::broadcast;

pub const ADMIN_EMAIL: &str = "admin@example.com";

/// Wraps the in-memory store and fails chosen writes with
/// `StorageUnavailable`, standing in for a timeout or a crash mid-operation.
pub struct FaultyStore {
    inner: MemoryStore,
    faults: Mutex<Vec<(StorePath, u32)>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `times` writes to `path`.
    pub fn fail_writes(&self, path: StorePath, times: u32) {
        self.faults.lock().unwrap().push((path, times));
    }

    fn check(&self, path: &StorePath) -> Result<()> {
        let mut faults = self.faults.lock().unwrap();
        if let Some(fault) = faults.iter_mut().find(|(p, left)| p == path && *left > 0) {
            fault.1 -= 1;
            return Err(LedgerError::StorageUnavailable(format!("injected fault writing {}", path)));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for FaultyStore {
    async fn get(&self, path: &StorePath) -> Result<Option<Document>> {
        self.inner.get(path).await
    }

    async fn put(&self, path: &StorePath, value: serde_json::Value) -> Result<Document> {
        self.check(path)?;
        self.inner.put(path, value).await
    }

    async fn insert(&self, path: &StorePath, value: serde_json::Value) -> Result<Insert> {
        self.check(path)?;
        self.inner.insert(path, value).await
    }

    async fn compare_and_swap(
        &self,
        path: &StorePath,
        expected_version: u64,
        value: serde_json::Value,
    ) -> Result<Swap> {
        self.check(path)?;
        self.inner.compare_and_swap(path, expected_version, value).await
    }

    async fn compare_and_swap_with_marker(
        &self,
        path: &StorePath,
        expected_version: u64,
        value: serde_json::Value,
        marker: &StorePath,
        marker_value: serde_json::Value,
    ) -> Result<Swap> {
        self.check(path)?;
        self.check(marker)?;
        self.inner
            .compare_and_swap_with_marker(path, expected_version, value, marker, marker_value)
            .await
    }

    async fn update_fields(
        &self,
        path: &StorePath,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<Document>> {
        self.check(path)?;
        self.inner.update_fields(path, fields).await
    }

    async fn delete(&self, path: &StorePath) -> Result<bool> {
        self.check(path)?;
        self.inner.delete(path).await
    }

    async fn list(&self, collection: Collection) -> Result<Vec<Document>> {
        self.inner.list(collection).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.subscribe()
    }
}

pub fn config() -> LedgerConfig {
    LedgerConfig::default().with_admin_email(ADMIN_EMAIL)
}

pub fn services() -> Services {
    Services::new(Arc::new(MemoryStore::new()), config())
}

pub fn faulty_services() -> (Arc<FaultyStore>, Services) {
    let store = Arc::new(FaultyStore::new());
    let services = Services::new(store.clone(), config());
    (store, services)
}

pub fn identity(user_id: &str, email: &str) -> Identity {
    Identity {
        user_id: user_id.to_string(),
        email: email.to_string(),
        name: None,
    }
}

/// Admin actor that has no user record of its own.
pub fn admin() -> Actor {
    AdminPolicy::new(Some(ADMIN_EMAIL.to_string())).actor(identity("admin", ADMIN_EMAIL))
}

pub async fn worker(services: &Services, user_id: &str) -> Actor {
    services
        .users
        .ensure_user(identity(user_id, &format!("{}@example.com", user_id)))
        .await
        .unwrap()
        .0
}

pub async fn worker_with_earnings(services: &Services, user_id: &str, earnings: &str) -> Actor {
    let actor = worker(services, user_id).await;
    let amount: Money = earnings.parse().unwrap();
    if !amount.is_zero() {
        services
            .balances
            .credit(user_id, BalanceField::Earnings, amount)
            .await
            .unwrap();
    }
    actor
}

pub fn user_path(user_id: &str) -> StorePath {
    StorePath::new(Collection::Users, user_id)
}

pub fn new_job(payout: &str, max_count: u32) -> NewJob {
    NewJob {
        title: "Follow the page".to_string(),
        category: JobCategory::Facebook,
        payout: payout.parse().unwrap(),
        max_count,
        target_country: INTERNATIONAL.to_string(),
        is_top_job: false,
        instructions: None,
        thumbnail: None,
        request_id: None,
    }
}

/// Credit the poster's deposit with exactly the escrow, then post.
pub async fn post_job(services: &Services, poster: &Actor, payout: &str, max_count: u32) -> Job {
    let new_job = new_job(payout, max_count);
    let escrow = new_job.payout.checked_mul(max_count).unwrap();
    services
        .balances
        .credit(poster.user_id(), BalanceField::Deposit, escrow)
        .await
        .unwrap();
    services.jobs.post_job(poster, new_job).await.unwrap()
}

pub async fn deposit(services: &Services, user_id: &str) -> Money {
    services.users.get_user(user_id).await.unwrap().deposit
}

pub async fn earnings(services: &Services, user_id: &str) -> Money {
    services.users.get_user(user_id).await.unwrap().earnings
}
