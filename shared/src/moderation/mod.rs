//! Admin-moderated request queues.
//!
//! Every queue has the same shape: an entry is created `Pending` and moves
//! exactly once to one of two terminal states. The terminal status is
//! written first through a conditional update, then the queue's side effect
//! runs as a keyed, replayable step. A crash between the two leaves a
//! terminal entry whose effect can be re-driven with the queue's `recover`.

pub mod deposits;
pub mod verifications;
pub mod withdrawals;

pub use deposits::DepositQueue;
pub use verifications::VerificationQueue;
pub use withdrawals::WithdrawalQueue;

use crate::auth::Actor;
use crate::error::{LedgerError, Result};
use crate::ledger::{Entity, Ledger, Mutation};
use crate::types::{
    Deposit, DepositStatus, User, VerificationRequest, VerificationRequestStatus, Withdrawal,
    WithdrawalStatus,
};
use std::fmt::Display;

pub trait QueueItem: Entity {
    type Status: Copy + PartialEq + Display + Send + Sync;
    const QUEUE: &'static str;
    const PENDING: Self::Status;

    fn owner(&self) -> &str;
    fn status(&self) -> Self::Status;
    fn set_decision(&mut self, status: Self::Status, decided_at: String);
}

impl QueueItem for Withdrawal {
    type Status = WithdrawalStatus;
    const QUEUE: &'static str = "withdrawal";
    const PENDING: WithdrawalStatus = WithdrawalStatus::Pending;

    fn owner(&self) -> &str {
        &self.user_id
    }

    fn status(&self) -> WithdrawalStatus {
        self.status
    }

    fn set_decision(&mut self, status: WithdrawalStatus, decided_at: String) {
        self.status = status;
        self.decided_at = Some(decided_at);
    }
}

impl QueueItem for Deposit {
    type Status = DepositStatus;
    const QUEUE: &'static str = "deposit";
    const PENDING: DepositStatus = DepositStatus::Pending;

    fn owner(&self) -> &str {
        &self.user_id
    }

    fn status(&self) -> DepositStatus {
        self.status
    }

    fn set_decision(&mut self, status: DepositStatus, decided_at: String) {
        self.status = status;
        self.decided_at = Some(decided_at);
    }
}

impl QueueItem for VerificationRequest {
    type Status = VerificationRequestStatus;
    const QUEUE: &'static str = "verification";
    const PENDING: VerificationRequestStatus = VerificationRequestStatus::Pending;

    fn owner(&self) -> &str {
        &self.user_id
    }

    fn status(&self) -> VerificationRequestStatus {
        self.status
    }

    fn set_decision(&mut self, status: VerificationRequestStatus, decided_at: String) {
        self.status = status;
        self.decided_at = Some(decided_at);
    }
}

pub(crate) fn already_processed<T: QueueItem>(item: &T) -> LedgerError {
    LedgerError::AlreadyProcessed {
        queue: T::QUEUE,
        id: item.id().to_string(),
        status: item.status().to_string(),
    }
}

/// Conditionally move a pending entry to `target`. Fails with
/// `AlreadyProcessed` and writes nothing when the entry is already terminal.
pub(crate) async fn transition<T: QueueItem>(
    ledger: &Ledger,
    actor: &Actor,
    id: &str,
    target: T::Status,
) -> Result<T> {
    actor.require_admin(&format!("decide {} requests", T::QUEUE))?;
    if target == T::PENDING {
        return Err(LedgerError::InvalidInput(format!(
            "{} requests can only move to a terminal state",
            T::QUEUE
        )));
    }

    let decided_at = chrono::Utc::now().to_rfc3339();
    let result = ledger
        .mutate::<T, _, _>(id, |item| {
            if item.status() != T::PENDING {
                return Err(already_processed(item));
            }
            item.set_decision(target, decided_at.clone());
            Ok(Mutation::Apply(()))
        })
        .await
        .inspect_err(|e| {
            if let LedgerError::AlreadyProcessed { status, .. } = e {
                tracing::info!(queue = T::QUEUE, id, status = %status, "Decision refused, already processed");
            }
        })?;

    tracing::info!(
        queue = T::QUEUE,
        id,
        user_id = %result.entity.owner(),
        status = %target,
        admin_id = %actor.user_id(),
        "Moderation decision recorded"
    );
    Ok(result.entity)
}

/// Admins see the whole queue, everyone else only their own entries.
pub(crate) async fn list_for<T: QueueItem>(ledger: &Ledger, actor: &Actor) -> Result<Vec<T>> {
    let mut items = ledger.list::<T>().await?;
    if !actor.is_admin() {
        items.retain(|item| item.owner() == actor.user_id());
    }
    Ok(items)
}

pub(crate) async fn get_for<T: QueueItem>(ledger: &Ledger, actor: &Actor, id: &str) -> Result<T> {
    let item = ledger.fetch::<T>(id).await?;
    if !actor.is_admin() && item.owner() != actor.user_id() {
        // Other users' entries are indistinguishable from missing ones
        return Err(LedgerError::not_found(T::NAME, id));
    }
    Ok(item)
}

pub(crate) async fn require_active(ledger: &Ledger, actor: &Actor) -> Result<User> {
    let user = ledger.fetch::<User>(actor.user_id()).await?;
    if user.is_banned() {
        return Err(LedgerError::PermissionDenied(format!(
            "account {} is banned",
            user.user_id
        )));
    }
    Ok(user)
}

/// Client-supplied request id, or a fresh one.
pub(crate) fn request_id(supplied: Option<String>) -> String {
    supplied
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

pub(crate) fn require_text(value: &str, what: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::InvalidInput(format!("{} is required", what)));
    }
    Ok(trimmed.to_string())
}
