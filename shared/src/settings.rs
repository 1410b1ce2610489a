use crate::auth::Actor;
use crate::error::{LedgerError, Result};
use crate::ledger::{Entity, Ledger};
use crate::store::Collection;
use serde::{Deserialize, Serialize};

/// A singleton document under `settings/`, edited by the administrator.
pub trait Setting: Entity + Default {
    const ID: &'static str;

    /// Trim and check a submitted value before it replaces the stored one.
    fn normalize(self) -> Result<Self>;
}

/// Where members send money for a deposit, shown on the deposit form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositSettings {
    #[serde(default)]
    pub paypal: String,
    #[serde(default)]
    pub zelle: String,
    #[serde(default)]
    pub bank: String,
    #[serde(default)]
    pub visa: String,
    #[serde(default)]
    pub bikash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdSettings {
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub banner_image_url: String,
    #[serde(default)]
    pub banner_target_url: String,
    #[serde(default)]
    pub direct_link_url: String,
    #[serde(default)]
    pub direct_link_text: String,
}

macro_rules! impl_setting {
    ($ty:ty, $id:literal) => {
        impl Entity for $ty {
            const COLLECTION: Collection = Collection::Settings;
            const NAME: &'static str = "settings";

            fn id(&self) -> &str {
                $id
            }
        }
    };
}

impl_setting!(DepositSettings, "deposit");
impl_setting!(AdSettings, "ads");

impl Setting for DepositSettings {
    const ID: &'static str = "deposit";

    fn normalize(self) -> Result<Self> {
        Ok(Self {
            paypal: self.paypal.trim().to_string(),
            zelle: self.zelle.trim().to_string(),
            bank: self.bank.trim().to_string(),
            visa: self.visa.trim().to_string(),
            bikash: self.bikash.trim().to_string(),
        })
    }
}

impl Setting for AdSettings {
    const ID: &'static str = "ads";

    fn normalize(self) -> Result<Self> {
        let settings = Self {
            is_enabled: self.is_enabled,
            banner_image_url: self.banner_image_url.trim().to_string(),
            banner_target_url: self.banner_target_url.trim().to_string(),
            direct_link_url: self.direct_link_url.trim().to_string(),
            direct_link_text: self.direct_link_text.trim().to_string(),
        };
        if settings.is_enabled && settings.banner_image_url.is_empty() && settings.direct_link_url.is_empty() {
            return Err(LedgerError::InvalidInput(
                "enabled ads need a banner image or a direct link".into(),
            ));
        }
        Ok(settings)
    }
}

#[derive(Clone)]
pub struct SettingsService {
    ledger: Ledger,
}

impl SettingsService {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Stored value, or the empty default when nothing was saved yet.
    pub async fn get<S: Setting>(&self) -> Result<S> {
        Ok(self
            .ledger
            .find::<S>(S::ID)
            .await?
            .map(|v| v.entity)
            .unwrap_or_default())
    }

    pub async fn put<S: Setting>(&self, actor: &Actor, value: S) -> Result<S> {
        actor.require_admin("change settings")?;
        let value = value.normalize()?;
        let version = self.ledger.save(&value).await?;
        tracing::info!(setting = S::ID, version, "Settings saved");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AdminPolicy, Identity};
    use crate::config::LedgerConfig;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn service() -> SettingsService {
        SettingsService::new(Ledger::new(Arc::new(MemoryStore::new()), LedgerConfig::default()))
    }

    fn actor(email: &str) -> Actor {
        AdminPolicy::new(Some("admin@example.com".into())).actor(Identity {
            user_id: email.split('@').next().unwrap_or_default().into(),
            email: email.into(),
            name: None,
        })
    }

    #[tokio::test]
    async fn test_admin_sets_deposit_handles() {
        let settings = service();
        assert_eq!(settings.get::<DepositSettings>().await.unwrap(), DepositSettings::default());

        let update = DepositSettings {
            paypal: " pay@example.com ".into(),
            bikash: "01700000000".into(),
            ..Default::default()
        };
        let err = settings.put(&actor("u1@example.com"), update.clone()).await.unwrap_err();
        assert!(matches!(err, LedgerError::PermissionDenied(_)));

        settings.put(&actor("admin@example.com"), update).await.unwrap();
        let stored = settings.get::<DepositSettings>().await.unwrap();
        assert_eq!(stored.paypal, "pay@example.com");
        assert_eq!(stored.bikash, "01700000000");
        assert!(stored.zelle.is_empty());
    }

    #[tokio::test]
    async fn test_enabled_ads_need_something_to_show() {
        let settings = service();
        let admin = actor("admin@example.com");
        let empty = AdSettings {
            is_enabled: true,
            ..Default::default()
        };
        assert!(matches!(
            settings.put(&admin, empty).await,
            Err(LedgerError::InvalidInput(_))
        ));

        let banner = AdSettings {
            is_enabled: true,
            banner_image_url: "https://cdn.example.com/banner.png".into(),
            banner_target_url: "https://example.com".into(),
            ..Default::default()
        };
        settings.put(&admin, banner.clone()).await.unwrap();
        assert_eq!(settings.get::<AdSettings>().await.unwrap(), banner);
        assert_eq!(settings.get::<DepositSettings>().await.unwrap(), DepositSettings::default());
    }
}
