use crate::store::ChangeEvent;
use serde::{Deserialize, Serialize};

/// Incoming WebSocket message from client
#[derive(Debug, Deserialize)]
pub struct WebSocketMessage {
    pub action: String,
    #[serde(flatten)]
    pub data: serde_json::Value,
}

/// WebSocket action types
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WebSocketAction {
    /// Current documents of one collection, as the caller may see them
    Snapshot,
    Ping,
}

/// Broadcast message sent to all clients
#[derive(Debug, Serialize)]
pub struct BroadcastMessage {
    pub r#type: String,
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl BroadcastMessage {
    pub fn new(message_type: &str, data: serde_json::Value) -> Self {
        Self {
            r#type: message_type.to_string(),
            data,
        }
    }

    /// `job_updated`, `withdrawal_created`, ... carrying the path, version and
    /// the new document (absent for deletions).
    pub fn from_change(event: &ChangeEvent) -> Self {
        Self::new(
            &event.message_type(),
            serde_json::json!({
                "collection": event.path.collection,
                "id": event.path.id,
                "version": event.version,
                "data": event.value,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChangeKind, Collection, StorePath};

    #[test]
    fn test_change_message_shape() {
        let event = ChangeEvent {
            path: StorePath::new(Collection::Withdrawals, "w1"),
            kind: ChangeKind::Created,
            version: 7,
            value: Some(serde_json::json!({"withdrawal_id": "w1"})),
        };
        let json = serde_json::to_value(BroadcastMessage::from_change(&event)).unwrap();
        assert_eq!(json["type"], "withdrawal_created");
        assert_eq!(json["collection"], "withdrawals");
        assert_eq!(json["version"], 7);
        assert_eq!(json["data"]["withdrawal_id"], "w1");
    }

    #[test]
    fn test_parse_snapshot_action() {
        let msg: WebSocketMessage =
            serde_json::from_str(r#"{"action":"snapshot","collection":"jobs"}"#).unwrap();
        let action: WebSocketAction = serde_json::from_value(serde_json::Value::String(msg.action)).unwrap();
        assert_eq!(action, WebSocketAction::Snapshot);
        assert_eq!(msg.data["collection"], "jobs");
    }
}
