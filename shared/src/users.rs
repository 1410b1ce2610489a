use crate::auth::{Actor, AdminPolicy, Identity};
use crate::error::{LedgerError, Result};
use crate::ledger::{Created, Ledger};
use crate::money::Money;
use crate::types::{MembershipLevel, User, UserStatus, VerificationStatus};

#[derive(Clone)]
pub struct UserDirectory {
    ledger: Ledger,
    policy: AdminPolicy,
}

impl UserDirectory {
    pub fn new(ledger: Ledger) -> Self {
        let policy = AdminPolicy::new(ledger.config().admin_email.clone());
        Self { ledger, policy }
    }

    pub fn policy(&self) -> &AdminPolicy {
        &self.policy
    }

    /// Resolve a signed-in identity to its user record, creating it on first
    /// authentication. The stored `is_admin` mirror is refreshed from the
    /// policy whenever it has drifted.
    pub async fn ensure_user(&self, identity: Identity) -> Result<(Actor, User)> {
        let is_admin = self.policy.is_admin(&identity);
        let name = identity
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| identity.email.split('@').next().map(str::to_string))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "New User".to_string());

        let fresh = User {
            user_id: identity.user_id.clone(),
            name,
            email: identity.email.clone(),
            avatar: None,
            country: None,
            earnings: Money::ZERO,
            deposit: Money::ZERO,
            membership_level: MembershipLevel::Free,
            status: UserStatus::Active,
            is_admin,
            verification_status: VerificationStatus::Unverified,
            active_verification: None,
            joined_at: chrono::Utc::now().format("%Y-%m-%d").to_string(),
        };

        let (mut user, created) = self.ledger.create(&fresh).await?;
        match created {
            Created::New => tracing::info!(user_id = %user.user_id, is_admin, "User created on first sign-in"),
            Created::AlreadyExisted if user.is_admin != is_admin => {
                let mut fields = serde_json::Map::new();
                fields.insert("is_admin".into(), serde_json::Value::Bool(is_admin));
                user = self.ledger.update_fields::<User>(&user.user_id, fields).await?;
                tracing::info!(user_id = %user.user_id, is_admin, "Admin flag refreshed");
            }
            Created::AlreadyExisted => {}
        }

        Ok((self.policy.actor(identity), user))
    }

    pub async fn get_user(&self, user_id: &str) -> Result<User> {
        self.ledger.fetch::<User>(user_id).await
    }

    pub async fn list_users(&self, actor: &Actor) -> Result<Vec<User>> {
        actor.require_admin("list users")?;
        self.ledger.list::<User>().await
    }

    /// Look a user up by id first, then by email.
    pub async fn find_user(&self, id_or_email: &str) -> Result<User> {
        if let Some(found) = self.ledger.find::<User>(id_or_email).await? {
            return Ok(found.entity);
        }
        self.ledger
            .list::<User>()
            .await?
            .into_iter()
            .find(|u| u.email == id_or_email)
            .ok_or_else(|| LedgerError::UserNotFound(id_or_email.to_string()))
    }

    pub async fn set_user_status(&self, actor: &Actor, user_id: &str, status: UserStatus) -> Result<User> {
        actor.require_admin("change account status")?;
        let mut fields = serde_json::Map::new();
        fields.insert("status".into(), serde_json::to_value(status).map_err(|e| LedgerError::InvalidInput(e.to_string()))?);
        let user = self.ledger.update_fields::<User>(user_id, fields).await?;
        tracing::info!(user_id, status = %status, "Account status changed");
        Ok(user)
    }

    pub async fn set_membership(&self, actor: &Actor, user_id: &str, level: MembershipLevel) -> Result<User> {
        actor.require_admin("change membership")?;
        let mut fields = serde_json::Map::new();
        fields.insert(
            "membership_level".into(),
            serde_json::to_value(level).map_err(|e| LedgerError::InvalidInput(e.to_string()))?,
        );
        let user = self.ledger.update_fields::<User>(user_id, fields).await?;
        tracing::info!(user_id, level = %level, "Membership changed");
        Ok(user)
    }
}
