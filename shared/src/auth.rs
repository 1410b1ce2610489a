use crate::error::{LedgerError, Result};
use lambda_http::{Request, RequestExt};
use serde::{Deserialize, Serialize};

/// Authenticated identity as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
}

impl Identity {
    /// Read the caller from the verified authorizer context: JWT claims
    /// (`sub`, `email`, `name`), or the context map of a Lambda authorizer.
    ///
    /// With no authorizer context at all and `allow_dev_headers` set,
    /// `X-User-Id` names the caller for local development. Such an identity
    /// carries no email and so never holds admin rights.
    pub fn from_request(event: &Request, allow_dev_headers: bool) -> Option<Identity> {
        let authorizer = event.request_context_ref().and_then(|ctx| ctx.authorizer());
        if let Some(auth) = authorizer {
            let claim = |name: &str| {
                auth.jwt
                    .as_ref()
                    .and_then(|jwt| jwt.claims.get(name).cloned())
                    .or_else(|| auth.fields.get(name).and_then(|v| v.as_str()).map(|s| s.to_string()))
                    .filter(|s| !s.is_empty())
            };
            if let Some(user_id) = claim("sub") {
                return Some(Identity {
                    user_id,
                    email: claim("email").unwrap_or_default(),
                    name: claim("name"),
                });
            }
        }

        if authorizer.is_some() || !allow_dev_headers {
            return None;
        }
        let user_id = event
            .headers()
            .get("X-User-Id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())?;
        tracing::debug!(user_id = %user_id, "Identity taken from development header");
        Some(Identity {
            user_id,
            email: String::new(),
            name: None,
        })
    }
}

/// Decides who holds elevated rights: exactly the identity whose verified
/// email equals the configured administrator address.
#[derive(Debug, Clone, Default)]
pub struct AdminPolicy {
    admin_email: Option<String>,
}

impl AdminPolicy {
    pub fn new(admin_email: Option<String>) -> Self {
        Self { admin_email }
    }

    pub fn is_admin(&self, identity: &Identity) -> bool {
        match &self.admin_email {
            Some(admin) => !identity.email.is_empty() && identity.email == *admin,
            None => false,
        }
    }

    pub fn actor(&self, identity: Identity) -> Actor {
        let is_admin = self.is_admin(&identity);
        Actor { identity, is_admin }
    }
}

/// Caller of a core operation. Only [`AdminPolicy::actor`] builds one, so
/// admin rights cannot come from a stored or client-controlled field.
#[derive(Debug, Clone)]
pub struct Actor {
    identity: Identity,
    is_admin: bool,
}

impl Actor {
    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    pub fn require_admin(&self, action: &str) -> Result<()> {
        if self.is_admin {
            Ok(())
        } else {
            tracing::warn!(user_id = %self.identity.user_id, action, "Admin action refused");
            Err(LedgerError::PermissionDenied(format!(
                "only the administrator may {}",
                action
            )))
        }
    }
}
