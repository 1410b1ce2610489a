use crate::auth::Actor;
use crate::balance::{Applied, BalanceEngine, BalanceField};
use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::money::Money;
use crate::types::{BonusRequest, User};
use crate::users::UserDirectory;
use serde::Serialize;

pub const ALL_USERS: &str = "ALL";

pub fn bonus_key(broadcast_id: &str) -> String {
    format!("bonus:{}", broadcast_id)
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedCredit {
    pub user_id: String,
    pub error: String,
}

/// Per-user outcome of one broadcast. Re-running the same broadcast id
/// against `failed` finishes it without paying anyone twice.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastReport {
    pub broadcast_id: String,
    pub amount: Money,
    pub credited: Vec<String>,
    pub already_credited: Vec<String>,
    pub failed: Vec<FailedCredit>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.credited.len() + self.already_credited.len() + self.failed.len()
    }

    pub fn succeeded(&self) -> usize {
        self.credited.len() + self.already_credited.len()
    }

    pub fn failed_user_ids(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.user_id.clone()).collect()
    }
}

#[derive(Clone)]
pub struct BonusBroadcast {
    ledger: Ledger,
    users: UserDirectory,
    balances: BalanceEngine,
}

impl BonusBroadcast {
    pub fn new(ledger: Ledger, users: UserDirectory, balances: BalanceEngine) -> Self {
        Self {
            ledger,
            users,
            balances,
        }
    }

    /// Credit `amount` to one user (by id or email) or to everybody.
    ///
    /// A single target that matches nobody fails with `UserNotFound`. For
    /// `ALL`, each user is credited independently and failures are collected
    /// into the report instead of stopping the run.
    pub async fn send_bonus(&self, actor: &Actor, request: BonusRequest) -> Result<BroadcastReport> {
        actor.require_admin("send bonuses")?;
        if request.amount.is_zero() {
            return Err(LedgerError::InvalidInput("bonus amount must be greater than zero".into()));
        }
        let target = request.target.trim();
        if target.is_empty() {
            return Err(LedgerError::InvalidInput("bonus target is required".into()));
        }
        let broadcast_id = request
            .broadcast_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let everyone = target.eq_ignore_ascii_case(ALL_USERS);
        let recipients: Vec<String> = if everyone {
            let mut ids: Vec<String> = self
                .ledger
                .list::<User>()
                .await?
                .into_iter()
                .map(|u| u.user_id)
                .collect();
            if let Some(only) = &request.only_users {
                ids.retain(|id| only.contains(id));
            }
            ids
        } else {
            vec![self.users.find_user(target).await?.user_id]
        };

        let mut report = BroadcastReport {
            broadcast_id: broadcast_id.clone(),
            amount: request.amount,
            credited: Vec::new(),
            already_credited: Vec::new(),
            failed: Vec::new(),
        };
        let key = bonus_key(&broadcast_id);

        for user_id in recipients {
            match self
                .balances
                .credit_once(&user_id, BalanceField::Earnings, request.amount, &key)
                .await
            {
                Ok((_, Applied::Applied)) => report.credited.push(user_id),
                Ok((_, Applied::AlreadyApplied)) => report.already_credited.push(user_id),
                Err(e) if !everyone => return Err(e),
                Err(e) => {
                    tracing::warn!(broadcast_id = %broadcast_id, user_id = %user_id, error = %e, "Bonus credit failed");
                    report.failed.push(FailedCredit {
                        user_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.failed.is_empty() {
            tracing::info!(
                broadcast_id = %broadcast_id,
                amount = %request.amount,
                credited = report.credited.len(),
                already_credited = report.already_credited.len(),
                "Bonus broadcast finished"
            );
        } else {
            tracing::warn!(
                broadcast_id = %broadcast_id,
                succeeded = report.succeeded(),
                attempted = report.attempted(),
                "Bonus broadcast partially failed; retry with the same broadcast id"
            );
        }
        Ok(report)
    }
}
