use crate::money::Money;
use crate::retry::RetryPolicy;
use std::env;
use std::time::Duration;

pub const DEFAULT_TABLE_NAME: &str = "taskhub-ledger";

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub table_name: String,
    /// The one identity with elevated rights. `None` means nobody is admin.
    pub admin_email: Option<String>,
    pub min_withdrawal: Money,
    /// Conditional-update attempts before giving up on a hot document
    pub max_cas_attempts: u32,
    pub retry: RetryPolicy,
    /// Accept `X-User-Id` from requests that carry no authorizer context.
    /// Local development only.
    pub allow_dev_headers: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            admin_email: None,
            min_withdrawal: Money::from_dollars(2),
            max_cas_attempts: 16,
            retry: RetryPolicy::default(),
            allow_dev_headers: false,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let table_name = env::var("TABLE_NAME").unwrap_or_else(|_| DEFAULT_TABLE_NAME.to_string());
        let admin_email = env::var("ADMIN_EMAIL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if admin_email.is_none() {
            tracing::warn!("ADMIN_EMAIL not set; no identity will have admin rights");
        }

        let min_withdrawal = env::var("MIN_WITHDRAWAL")
            .ok()
            .and_then(|v| match v.parse::<Money>() {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::warn!("Ignoring MIN_WITHDRAWAL: {}", e);
                    None
                }
            })
            .unwrap_or(defaults.min_withdrawal);

        let max_cas_attempts = parse_env("MAX_CAS_ATTEMPTS").unwrap_or(defaults.max_cas_attempts);
        let retry = RetryPolicy {
            max_attempts: parse_env("RETRY_MAX_ATTEMPTS").unwrap_or(defaults.retry.max_attempts),
            base_delay: parse_env("RETRY_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            ..defaults.retry
        };

        let allow_dev_headers = env::var("ALLOW_DEV_HEADERS")
            .map(|v| matches!(v.trim(), "1" | "true"))
            .unwrap_or(false);
        if allow_dev_headers {
            tracing::warn!("ALLOW_DEV_HEADERS is set; unauthenticated X-User-Id headers are trusted");
        }

        Self {
            table_name,
            admin_email,
            min_withdrawal,
            max_cas_attempts,
            retry,
            allow_dev_headers,
        }
    }

    pub fn with_admin_email(mut self, email: impl Into<String>) -> Self {
        self.admin_email = Some(email.into());
        self
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.table_name, "taskhub-ledger");
        assert_eq!(config.min_withdrawal.to_string(), "2.000");
        assert!(config.admin_email.is_none());
        assert!(!config.allow_dev_headers);

        let config = config.with_admin_email("boss@example.com");
        assert_eq!(config.admin_email.as_deref(), Some("boss@example.com"));
    }
}
