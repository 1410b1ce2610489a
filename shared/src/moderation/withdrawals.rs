use super::{get_for, list_for, request_id, require_active, require_text, transition};
use crate::auth::Actor;
use crate::balance::{Applied, BalanceEngine, BalanceField};
use crate::error::{LedgerError, Result};
use crate::ledger::{Ledger, Mutation};
use crate::types::{User, Withdrawal, WithdrawalDecision, WithdrawalRequest, WithdrawalStatus};

pub fn reserve_key(withdrawal_id: &str) -> String {
    format!("withdrawal:{}", withdrawal_id)
}

pub fn refund_key(withdrawal_id: &str) -> String {
    format!("withdrawal-refund:{}", withdrawal_id)
}

/// Withdrawals reserve the amount when requested. Approval pays out what
/// is already reserved; rejection gives it back.
#[derive(Clone)]
pub struct WithdrawalQueue {
    ledger: Ledger,
    balances: BalanceEngine,
}

impl WithdrawalQueue {
    pub fn new(ledger: Ledger, balances: BalanceEngine) -> Self {
        Self { ledger, balances }
    }

    pub async fn request(&self, actor: &Actor, request: WithdrawalRequest) -> Result<Withdrawal> {
        let user = require_active(&self.ledger, actor).await?;
        if request.amount.is_zero() {
            return Err(LedgerError::InvalidInput("amount must be greater than zero".into()));
        }
        let minimum = self.ledger.config().min_withdrawal;
        if request.amount < minimum {
            return Err(LedgerError::InvalidInput(format!(
                "minimum withdrawal is ${}, requested ${}",
                minimum, request.amount
            )));
        }
        let method = require_text(&request.method, "payment method")?;
        let account_details = require_text(&request.account_details, "account details")?;
        let withdrawal_id = request_id(request.request_id);

        if let Some(existing) = self.ledger.find::<Withdrawal>(&withdrawal_id).await? {
            return self.resume(actor, existing.entity).await;
        }
        if user.earnings < request.amount {
            return Err(insufficient(&user, request.amount));
        }

        let withdrawal = Withdrawal {
            withdrawal_id: withdrawal_id.clone(),
            user_id: user.user_id.clone(),
            amount: request.amount,
            method,
            account_details,
            status: WithdrawalStatus::Pending,
            reserved: false,
            requested_at: chrono::Utc::now().to_rfc3339(),
            decided_at: None,
        };
        let (withdrawal, _) = self.ledger.create(&withdrawal).await?;
        self.resume(actor, withdrawal).await
    }

    /// Finish the reservation of a request that exists but may not have been
    /// debited yet. Requests that cannot be afforded are removed again so
    /// nothing suggests money was set aside.
    async fn resume(&self, actor: &Actor, withdrawal: Withdrawal) -> Result<Withdrawal> {
        if withdrawal.user_id != actor.user_id() {
            return Err(LedgerError::InvalidInput(format!(
                "request id {} is already in use",
                withdrawal.withdrawal_id
            )));
        }
        if withdrawal.reserved || withdrawal.status != WithdrawalStatus::Pending {
            return Ok(withdrawal);
        }

        match self.reserve(&withdrawal).await {
            Err(e @ LedgerError::InsufficientFunds { .. }) => {
                if withdrawal.status == WithdrawalStatus::Pending {
                    self.ledger.remove::<Withdrawal>(&withdrawal.withdrawal_id).await?;
                    tracing::info!(
                        withdrawal_id = %withdrawal.withdrawal_id,
                        user_id = %withdrawal.user_id,
                        amount = %withdrawal.amount,
                        "Withdrawal request dropped, earnings too low"
                    );
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Debit the amount and flag the request as reserved. If the request was
    /// decided while the debit was in flight, a rejection is refunded on the
    /// spot.
    async fn reserve(&self, withdrawal: &Withdrawal) -> Result<Withdrawal> {
        let id = &withdrawal.withdrawal_id;
        self.balances
            .debit_once(&withdrawal.user_id, BalanceField::Earnings, withdrawal.amount, &reserve_key(id))
            .await?;

        let marked = self
            .ledger
            .mutate::<Withdrawal, _, _>(id, |w| {
                if w.reserved {
                    return Ok(Mutation::Keep(()));
                }
                w.reserved = true;
                Ok(Mutation::Apply(()))
            })
            .await?;

        tracing::info!(
            withdrawal_id = %id,
            user_id = %withdrawal.user_id,
            amount = %withdrawal.amount,
            "Withdrawal amount reserved"
        );
        if marked.entity.status == WithdrawalStatus::Rejected {
            self.refund(&marked.entity).await?;
        }
        Ok(marked.entity)
    }

    /// Credit a rejected request back, but only if its reservation happened.
    async fn refund(&self, withdrawal: &Withdrawal) -> Result<Applied> {
        if !self
            .balances
            .is_applied(&withdrawal.user_id, &reserve_key(&withdrawal.withdrawal_id))
            .await?
        {
            return Ok(Applied::AlreadyApplied);
        }
        let (_, applied) = self
            .balances
            .credit_once(
                &withdrawal.user_id,
                BalanceField::Earnings,
                withdrawal.amount,
                &refund_key(&withdrawal.withdrawal_id),
            )
            .await?;
        if applied == Applied::Applied {
            tracing::info!(
                withdrawal_id = %withdrawal.withdrawal_id,
                user_id = %withdrawal.user_id,
                amount = %withdrawal.amount,
                "Rejected withdrawal refunded"
            );
        }
        Ok(applied)
    }

    pub async fn decide(&self, actor: &Actor, withdrawal_id: &str, decision: WithdrawalDecision) -> Result<Withdrawal> {
        actor.require_admin("decide withdrawal requests")?;
        let current = self.ledger.fetch::<Withdrawal>(withdrawal_id).await?;
        if current.status != WithdrawalStatus::Pending {
            return Err(super::already_processed(&current));
        }

        match decision {
            WithdrawalDecision::Approved => {
                if !current.reserved {
                    self.reserve(&current).await?;
                }
                transition::<Withdrawal>(&self.ledger, actor, withdrawal_id, WithdrawalStatus::Approved).await
            }
            WithdrawalDecision::Rejected => {
                let rejected =
                    transition::<Withdrawal>(&self.ledger, actor, withdrawal_id, WithdrawalStatus::Rejected).await?;
                self.refund(&rejected).await?;
                Ok(rejected)
            }
        }
    }

    /// Re-drive the side effect of a request after an interrupted call.
    pub async fn recover(&self, actor: &Actor, withdrawal_id: &str) -> Result<Withdrawal> {
        actor.require_admin("recover withdrawal requests")?;
        let withdrawal = self.ledger.fetch::<Withdrawal>(withdrawal_id).await?;
        match withdrawal.status {
            WithdrawalStatus::Rejected => {
                self.refund(&withdrawal).await?;
                Ok(withdrawal)
            }
            WithdrawalStatus::Pending if !withdrawal.reserved => self.reserve(&withdrawal).await,
            _ => Ok(withdrawal),
        }
    }

    pub async fn list(&self, actor: &Actor) -> Result<Vec<Withdrawal>> {
        list_for::<Withdrawal>(&self.ledger, actor).await
    }

    pub async fn get(&self, actor: &Actor, withdrawal_id: &str) -> Result<Withdrawal> {
        get_for::<Withdrawal>(&self.ledger, actor, withdrawal_id).await
    }
}

fn insufficient(user: &User, requested: crate::money::Money) -> LedgerError {
    LedgerError::InsufficientFunds {
        user_id: user.user_id.clone(),
        field: BalanceField::Earnings.as_str(),
        balance: user.earnings,
        requested,
    }
}
