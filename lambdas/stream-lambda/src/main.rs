use aws_lambda_events::event::dynamodb::{Event, EventRecord};
use aws_sdk_apigatewaymanagement::Client as ApiGatewayManagementClient;
use aws_sdk_dynamodb::Client as DynamoClient;
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use taskhub_shared::config::LedgerConfig;
use taskhub_shared::sockets::connections::CONNECTION_PREFIX;
use taskhub_shared::sockets::{broadcast_to_audience, Audience, BroadcastMessage};
use taskhub_shared::store::{ChangeEvent, ChangeKind, Collection, StorePath};
use tracing_subscriber::EnvFilter;

struct Clients {
    dynamo: DynamoClient,
    api_gateway: ApiGatewayManagementClient,
    table_name: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .without_time()
        .init();

    let config = aws_config::load_from_env().await;
    let ws_endpoint = std::env::var("WS_API_ENDPOINT").map_err(|_| "WS_API_ENDPOINT must be set for stream handler")?;
    let api_config = aws_sdk_apigatewaymanagement::config::Builder::from(&config)
        .endpoint_url(ws_endpoint)
        .build();

    let clients = Clients {
        dynamo: DynamoClient::new(&config),
        api_gateway: ApiGatewayManagementClient::from_conf(api_config),
        table_name: LedgerConfig::from_env().table_name,
    };
    let clients = &clients;

    run(service_fn(move |event: LambdaEvent<Event>| async move { function_handler(event, clients).await })).await
}

async fn function_handler(event: LambdaEvent<Event>, clients: &Clients) -> Result<(), Error> {
    tracing::info!("DynamoDB Stream event received with {} records", event.payload.records.len());

    for record in &event.payload.records {
        if let Err(e) = process_record(record, clients).await {
            tracing::error!("Failed to process record: {}", e);
        }
    }

    Ok(())
}

async fn process_record(record: &EventRecord, clients: &Clients) -> Result<(), Error> {
    let Some((change, audience)) = change_from_record(record)? else {
        return Ok(());
    };

    let message = BroadcastMessage::from_change(&change);
    let delivered = broadcast_to_audience(
        &clients.dynamo,
        &clients.api_gateway,
        &clients.table_name,
        &audience,
        &message,
    )
    .await?;
    tracing::info!(message_type = %message.r#type, delivered, "Broadcast sent");
    Ok(())
}

/// Turn a stream record into a ledger change and the connections allowed to
/// see it. Connection items and unknown keys yield `None`.
fn change_from_record(record: &EventRecord) -> Result<Option<(ChangeEvent, Audience)>, Error> {
    let kind = match record.event_name.as_str() {
        "INSERT" => ChangeKind::Created,
        "MODIFY" => ChangeKind::Updated,
        "REMOVE" => ChangeKind::Deleted,
        other => {
            tracing::warn!("Skipping {} event", other);
            return Ok(None);
        }
    };

    // For REMOVE events, new_image is empty; use old_image instead
    let image = if record.change.new_image.is_empty() {
        &record.change.old_image
    } else {
        &record.change.new_image
    };
    let attr = |name: &str, tag: &str| {
        image.get(name).and_then(|attr| {
            let value = serde_json::to_value(attr).ok()?;
            value
                .get(tag)
                .and_then(|v| v.as_str())
                .or_else(|| value.as_str())
                .map(|s| s.to_string())
        })
    };

    let pk = attr("PK", "S").ok_or("Missing PK")?;
    if pk.starts_with(CONNECTION_PREFIX) {
        return Ok(None);
    }
    let Some((collection, id)) = Collection::from_key(&pk) else {
        return Ok(None);
    };

    let version = attr("version", "N").and_then(|v| v.parse().ok()).unwrap_or(0);
    let data: Option<serde_json::Value> = attr("data", "S").map(|data| serde_json::from_str(&data)).transpose()?;
    let audience = Audience::for_document(collection, id, data.as_ref());
    let value = match kind {
        ChangeKind::Deleted => None,
        _ => data,
    };

    Ok(Some((
        ChangeEvent {
            path: StorePath::new(collection, id),
            kind,
            version,
            value,
        },
        audience,
    )))
}
