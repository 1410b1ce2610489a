use super::audience::Audience;
use super::connections::{get_all_connections, remove_connection};
use super::messages::BroadcastMessage;
use aws_sdk_apigatewaymanagement::Client as ApiGatewayManagementClient;
use aws_sdk_dynamodb::Client as DynamoClient;
use lambda_http::Error;

/// Send a message to every connection the audience admits. Connections the
/// gateway reports as gone are deleted; other delivery failures are logged
/// and skipped.
pub async fn broadcast_to_audience(
    dynamo_client: &DynamoClient,
    api_gateway_client: &ApiGatewayManagementClient,
    table_name: &str,
    audience: &Audience,
    message: &BroadcastMessage,
) -> Result<usize, Error> {
    if *audience == Audience::Nobody {
        return Ok(0);
    }
    let mut connections = get_all_connections(dynamo_client, table_name).await?;
    let total = connections.len();
    connections.retain(|conn| audience.admits(conn));
    let message_json = serde_json::to_string(message)?;

    tracing::info!(
        message_type = %message.r#type,
        connections = connections.len(),
        skipped = total - connections.len(),
        "Broadcasting change"
    );

    let mut delivered = 0;
    for conn in connections {
        let result = api_gateway_client
            .post_to_connection()
            .connection_id(&conn.connection_id)
            .data(message_json.as_bytes().to_vec().into())
            .send()
            .await;

        match result {
            Ok(_) => delivered += 1,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_gone_exception()) => {
                tracing::info!(connection_id = %conn.connection_id, "Removing stale connection");
                if let Err(e) = remove_connection(dynamo_client, table_name, &conn.connection_id).await {
                    tracing::warn!(connection_id = %conn.connection_id, "Failed to remove stale connection: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!(connection_id = %conn.connection_id, "Failed to send to connection: {}", e);
            }
        }
    }

    Ok(delivered)
}
