use super::connections::{Connection, ANONYMOUS};
use crate::store::Collection;

/// Which websocket connections may receive a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    /// The owning user and the administrator
    Owner(String),
    AdminOnly,
    Nobody,
}

impl Audience {
    /// Audience of a change to `collection/id`, read from the document body
    /// (the old image for deletions). A private document whose owner cannot
    /// be read goes to the administrator only.
    pub fn for_document(collection: Collection, id: &str, data: Option<&serde_json::Value>) -> Self {
        let owner = |field: &str| {
            data.and_then(|d| d.get(field))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| Audience::Owner(s.to_string()))
                .unwrap_or(Audience::AdminOnly)
        };

        match collection {
            Collection::Jobs | Collection::Settings => Audience::Everyone,
            Collection::Users => Audience::Owner(id.to_string()),
            Collection::Submissions => owner("worker_id"),
            Collection::Withdrawals | Collection::Deposits | Collection::Verifications => owner("user_id"),
            Collection::Awards => Audience::Nobody,
        }
    }

    pub fn admits(&self, connection: &Connection) -> bool {
        match self {
            Audience::Everyone => true,
            Audience::Owner(user_id) => {
                connection.is_admin || (connection.user_id != ANONYMOUS && connection.user_id == *user_id)
            }
            Audience::AdminOnly => connection.is_admin,
            Audience::Nobody => false,
        }
    }
}
