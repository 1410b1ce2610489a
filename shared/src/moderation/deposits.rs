use super::{get_for, list_for, request_id, require_active, require_text, transition};
use crate::auth::Actor;
use crate::balance::{Applied, BalanceEngine, BalanceField};
use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::types::{Deposit, DepositDecision, DepositRequest, DepositStatus};

pub fn deposit_key(deposit_id: &str) -> String {
    format!("deposit:{}", deposit_id)
}

#[derive(Clone)]
pub struct DepositQueue {
    ledger: Ledger,
    balances: BalanceEngine,
}

impl DepositQueue {
    pub fn new(ledger: Ledger, balances: BalanceEngine) -> Self {
        Self { ledger, balances }
    }

    pub async fn request(&self, actor: &Actor, request: DepositRequest) -> Result<Deposit> {
        let user = require_active(&self.ledger, actor).await?;
        if request.amount.is_zero() {
            return Err(LedgerError::InvalidInput("amount must be greater than zero".into()));
        }
        let method = require_text(&request.method, "payment method")?;

        let deposit = Deposit {
            deposit_id: request_id(request.request_id),
            user_id: user.user_id,
            amount: request.amount,
            method,
            account_details: request
                .account_details
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            status: DepositStatus::Pending,
            requested_at: chrono::Utc::now().to_rfc3339(),
            decided_at: None,
        };
        let (deposit, _) = self.ledger.create(&deposit).await?;
        if deposit.user_id != actor.user_id() {
            return Err(LedgerError::InvalidInput(format!(
                "request id {} is already in use",
                deposit.deposit_id
            )));
        }

        tracing::info!(
            deposit_id = %deposit.deposit_id,
            user_id = %deposit.user_id,
            amount = %deposit.amount,
            "Deposit requested"
        );
        Ok(deposit)
    }

    /// `Completed` credits the deposit balance exactly once; `Failed` moves
    /// no money.
    pub async fn decide(&self, actor: &Actor, deposit_id: &str, decision: DepositDecision) -> Result<Deposit> {
        let target = match decision {
            DepositDecision::Completed => DepositStatus::Completed,
            DepositDecision::Failed => DepositStatus::Failed,
        };
        let deposit = transition::<Deposit>(&self.ledger, actor, deposit_id, target).await?;
        if deposit.status == DepositStatus::Completed {
            self.credit(&deposit).await?;
        }
        Ok(deposit)
    }

    pub async fn recover(&self, actor: &Actor, deposit_id: &str) -> Result<Deposit> {
        actor.require_admin("recover deposit requests")?;
        let deposit = self.ledger.fetch::<Deposit>(deposit_id).await?;
        if deposit.status == DepositStatus::Completed {
            self.credit(&deposit).await?;
        }
        Ok(deposit)
    }

    async fn credit(&self, deposit: &Deposit) -> Result<Applied> {
        let (_, applied) = self
            .balances
            .credit_once(
                &deposit.user_id,
                BalanceField::Deposit,
                deposit.amount,
                &deposit_key(&deposit.deposit_id),
            )
            .await?;
        Ok(applied)
    }

    pub async fn list(&self, actor: &Actor) -> Result<Vec<Deposit>> {
        list_for::<Deposit>(&self.ledger, actor).await
    }

    pub async fn get(&self, actor: &Actor, deposit_id: &str) -> Result<Deposit> {
        get_for::<Deposit>(&self.ledger, actor, deposit_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::config::LedgerConfig;
    use crate::money::Money;
    use crate::store::MemoryStore;
    use crate::types::User;
    use crate::users::UserDirectory;
    use std::sync::Arc;

    async fn setup() -> (Ledger, DepositQueue, Actor, Actor) {
        let config = LedgerConfig::default().with_admin_email("admin@example.com");
        let ledger = Ledger::new(Arc::new(MemoryStore::new()), config);
        let users = UserDirectory::new(ledger.clone());
        let (worker, _) = users
            .ensure_user(Identity {
                user_id: "u1".into(),
                email: "u1@example.com".into(),
                name: None,
            })
            .await
            .unwrap();
        let (admin, _) = users
            .ensure_user(Identity {
                user_id: "a1".into(),
                email: "admin@example.com".into(),
                name: None,
            })
            .await
            .unwrap();
        let queue = DepositQueue::new(ledger.clone(), BalanceEngine::new(ledger.clone()));
        (ledger, queue, worker, admin)
    }

    fn request(amount: &str) -> DepositRequest {
        DepositRequest {
            amount: amount.parse().unwrap(),
            method: "Nagad".into(),
            account_details: Some("TX-991".into()),
            request_id: None,
        }
    }

    #[tokio::test]
    async fn test_completed_credits_deposit_once() {
        let (ledger, queue, worker, admin) = setup().await;
        let d = queue.request(&worker, request("10.000")).await.unwrap();
        assert_eq!(d.status, DepositStatus::Pending);
        assert_eq!(ledger.fetch::<User>("u1").await.unwrap().deposit, Money::ZERO);

        queue.decide(&admin, &d.deposit_id, DepositDecision::Completed).await.unwrap();
        let err = queue
            .decide(&admin, &d.deposit_id, DepositDecision::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyProcessed { queue: "deposit", .. }));

        queue.recover(&admin, &d.deposit_id).await.unwrap();
        assert_eq!(ledger.fetch::<User>("u1").await.unwrap().deposit, Money::from_dollars(10));
    }

    #[tokio::test]
    async fn test_failed_moves_no_money() {
        let (ledger, queue, worker, admin) = setup().await;
        let d = queue.request(&worker, request("4.250")).await.unwrap();
        let failed = queue.decide(&admin, &d.deposit_id, DepositDecision::Failed).await.unwrap();
        assert_eq!(failed.status, DepositStatus::Failed);
        assert!(failed.decided_at.is_some());
        assert_eq!(ledger.fetch::<User>("u1").await.unwrap().deposit, Money::ZERO);

        let err = queue
            .decide(&admin, &d.deposit_id, DepositDecision::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyProcessed { .. }));
    }

    #[tokio::test]
    async fn test_users_only_see_their_own() {
        let (_, queue, worker, admin) = setup().await;
        queue.request(&worker, request("1.000")).await.unwrap();
        queue.request(&admin, request("2.000")).await.unwrap();

        assert_eq!(queue.list(&worker).await.unwrap().len(), 1);
        assert_eq!(queue.list(&admin).await.unwrap().len(), 2);
    }
}
