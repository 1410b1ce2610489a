use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client as DynamoClient;
use lambda_http::Error;
use serde::{Deserialize, Serialize};

pub const CONNECTION_PREFIX: &str = "CONNECTION#";

/// Stored user id of a connection opened without an identity.
pub const ANONYMOUS: &str = "anonymous";

/// WebSocket connection stored in DynamoDB
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: String,
    pub user_id: String,
    /// Fixed when the connection opens
    #[serde(default)]
    pub is_admin: bool,
    pub connected_at: String,
}

/// Save a WebSocket connection to DynamoDB
pub async fn save_connection(
    client: &DynamoClient,
    table_name: &str,
    connection_id: &str,
    user_id: &str,
    is_admin: bool,
) -> Result<(), Error> {
    let now = chrono::Utc::now().to_rfc3339();
    let pk = format!("{}{}", CONNECTION_PREFIX, connection_id);

    client
        .put_item()
        .table_name(table_name)
        .item("PK", AttributeValue::S(pk.clone()))
        .item("SK", AttributeValue::S(pk))
        .item("connection_id", AttributeValue::S(connection_id.to_string()))
        .item("user_id", AttributeValue::S(user_id.to_string()))
        .item("is_admin", AttributeValue::Bool(is_admin))
        .item("connected_at", AttributeValue::S(now))
        .item("entity_type", AttributeValue::S("connection".to_string()))
        .send()
        .await?;

    tracing::info!(connection_id, user_id, is_admin, "Connection saved");
    Ok(())
}

/// Remove a WebSocket connection from DynamoDB
pub async fn remove_connection(
    client: &DynamoClient,
    table_name: &str,
    connection_id: &str,
) -> Result<(), Error> {
    let pk = format!("{}{}", CONNECTION_PREFIX, connection_id);

    client
        .delete_item()
        .table_name(table_name)
        .key("PK", AttributeValue::S(pk.clone()))
        .key("SK", AttributeValue::S(pk))
        .send()
        .await?;

    tracing::info!(connection_id, "Connection removed");
    Ok(())
}

/// Get all active WebSocket connections
pub async fn get_all_connections(
    client: &DynamoClient,
    table_name: &str,
) -> Result<Vec<Connection>, Error> {
    let mut connections = Vec::new();
    let mut start_key = None;

    loop {
        let result = client
            .scan()
            .table_name(table_name)
            .filter_expression("entity_type = :type")
            .expression_attribute_values(":type", AttributeValue::S("connection".to_string()))
            .set_exclusive_start_key(start_key)
            .send()
            .await?;

        for item in result.items() {
            if let (Some(conn_id), Some(user_id), Some(connected_at)) = (
                item.get("connection_id").and_then(|v| v.as_s().ok()),
                item.get("user_id").and_then(|v| v.as_s().ok()),
                item.get("connected_at").and_then(|v| v.as_s().ok()),
            ) {
                connections.push(Connection {
                    connection_id: conn_id.clone(),
                    user_id: user_id.clone(),
                    is_admin: item
                        .get("is_admin")
                        .and_then(|v| v.as_bool().ok())
                        .copied()
                        .unwrap_or(false),
                    connected_at: connected_at.clone(),
                });
            }
        }

        match result.last_evaluated_key {
            Some(key) if !key.is_empty() => start_key = Some(key),
            _ => break,
        }
    }

    Ok(connections)
}
