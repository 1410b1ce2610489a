use crate::error::{LedgerError, Result};
use crate::ledger::{Entity, Ledger, Mutation};
use crate::money::Money;
use crate::store::Collection;
use crate::types::User;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceField {
    Earnings,
    Deposit,
}

impl BalanceField {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceField::Earnings => "earnings",
            BalanceField::Deposit => "deposit",
        }
    }

    pub fn read(self, user: &User) -> Money {
        match self {
            BalanceField::Earnings => user.earnings,
            BalanceField::Deposit => user.deposit,
        }
    }

    fn of(self, user: &mut User) -> &mut Money {
        match self {
            BalanceField::Earnings => &mut user.earnings,
            BalanceField::Deposit => &mut user.deposit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Applied {
    Applied,
    /// The award key was already recorded; balances did not move.
    AlreadyApplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

/// Record of one keyed balance change, stored beside the user document at
/// `awards/{user_id}#{award_key}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwardMarker {
    pub award_id: String,
    pub user_id: String,
    pub award_key: String,
    pub field: BalanceField,
    pub direction: Direction,
    pub amount: Money,
    pub applied_at: String,
}

impl AwardMarker {
    pub fn id_for(user_id: &str, award_key: &str) -> String {
        format!("{}#{}", user_id, award_key)
    }
}

impl Entity for AwardMarker {
    const COLLECTION: Collection = Collection::Awards;
    const NAME: &'static str = "award";

    fn id(&self) -> &str {
        &self.award_id
    }
}

/// The only path through which balances move. Every change is a
/// conditional write on the user document, so concurrent credits and debits
/// for one user are applied one at a time.
#[derive(Clone)]
pub struct BalanceEngine {
    ledger: Ledger,
}

impl BalanceEngine {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Unkeyed credit. Not idempotent: the caller must invoke it exactly once
    /// per award.
    pub async fn credit(&self, user_id: &str, field: BalanceField, amount: Money) -> Result<User> {
        self.apply(user_id, field, amount, Direction::Credit, None)
            .await
            .map(|(user, _)| user)
    }

    pub async fn debit(&self, user_id: &str, field: BalanceField, amount: Money) -> Result<User> {
        self.apply(user_id, field, amount, Direction::Debit, None)
            .await
            .map(|(user, _)| user)
    }

    /// Credit recorded under `award_key`; replays are no-ops.
    pub async fn credit_once(
        &self,
        user_id: &str,
        field: BalanceField,
        amount: Money,
        award_key: &str,
    ) -> Result<(User, Applied)> {
        self.apply(user_id, field, amount, Direction::Credit, Some(award_key))
            .await
    }

    pub async fn debit_once(
        &self,
        user_id: &str,
        field: BalanceField,
        amount: Money,
        award_key: &str,
    ) -> Result<(User, Applied)> {
        self.apply(user_id, field, amount, Direction::Debit, Some(award_key))
            .await
    }

    /// Whether a keyed change under `award_key` has landed for this user.
    pub async fn is_applied(&self, user_id: &str, award_key: &str) -> Result<bool> {
        Ok(self
            .ledger
            .find::<AwardMarker>(&AwardMarker::id_for(user_id, award_key))
            .await?
            .is_some())
    }

    async fn apply(
        &self,
        user_id: &str,
        field: BalanceField,
        amount: Money,
        direction: Direction,
        award_key: Option<&str>,
    ) -> Result<(User, Applied)> {
        if amount.is_zero() {
            return Err(LedgerError::InvalidInput("amount must be greater than zero".into()));
        }

        let (user, applied, before) = match award_key {
            None => {
                let result = self
                    .ledger
                    .mutate::<User, _, _>(user_id, |user| {
                        change(user, field, amount, direction).map(Mutation::Apply)
                    })
                    .await?;
                (result.entity, Applied::Applied, result.outcome)
            }
            Some(key) => {
                let marker = AwardMarker {
                    award_id: AwardMarker::id_for(user_id, key),
                    user_id: user_id.to_string(),
                    award_key: key.to_string(),
                    field,
                    direction,
                    amount,
                    applied_at: chrono::Utc::now().to_rfc3339(),
                };
                match self
                    .ledger
                    .mutate_once::<User, _, _, _>(user_id, &marker, |user| change(user, field, amount, direction))
                    .await?
                {
                    Some(result) => (result.entity, Applied::Applied, result.outcome),
                    None => {
                        let user = self.ledger.fetch::<User>(user_id).await?;
                        let balance = field.read(&user);
                        (user, Applied::AlreadyApplied, balance)
                    }
                }
            }
        };

        match applied {
            Applied::Applied => tracing::info!(
                user_id,
                field = field.as_str(),
                amount = %amount,
                balance_before = %before,
                balance_after = %field.read(&user),
                award_key = award_key.unwrap_or("-"),
                "{}",
                if direction == Direction::Credit { "Balance credited" } else { "Balance debited" }
            ),
            Applied::AlreadyApplied => tracing::info!(
                user_id,
                award_key = award_key.unwrap_or("-"),
                "Award already applied, balance unchanged"
            ),
        }

        Ok((user, applied))
    }
}

/// Move one balance; returns the amount before the change.
fn change(user: &mut User, field: BalanceField, amount: Money, direction: Direction) -> Result<Money> {
    let user_id = user.user_id.clone();
    let balance = field.of(user);
    let before = *balance;
    *balance = match direction {
        Direction::Credit => before
            .checked_add(amount)
            .ok_or_else(|| LedgerError::InvalidInput(format!("{} balance would overflow", field.as_str())))?,
        Direction::Debit => before.checked_sub(amount).ok_or(LedgerError::InsufficientFunds {
            user_id,
            field: field.as_str(),
            balance: before,
            requested: amount,
        })?,
    };
    Ok(before)
}
