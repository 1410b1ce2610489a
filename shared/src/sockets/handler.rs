use super::connections::{remove_connection, save_connection, ANONYMOUS};
use super::messages::{WebSocketAction, WebSocketMessage};
use crate::auth::Identity;
use crate::error::LedgerError;
use crate::settings::{AdSettings, DepositSettings};
use crate::http::{error_response, json_response, message_response};
use crate::store::Collection;
use crate::AppState;
use lambda_http::{http::StatusCode, Body, Error, Request, Response};
use std::sync::Arc;

/// Handle WebSocket events ($connect, $disconnect, $default)
pub async fn handle_websocket_event(
    event: Request,
    state: Arc<AppState>,
) -> Result<Response<Body>, Error> {
    // API Gateway puts the connection id and route key in headers for WebSocket
    let connection_id = header(&event, &["connectionid", "connectionId"]).unwrap_or_else(|| "unknown".to_string());
    let route_key = header(&event, &["routekey", "routeKey"]).unwrap_or_else(|| event.uri().path().to_string());

    tracing::info!(route_key = %route_key, connection_id = %connection_id, "WebSocket event");

    match route_key.as_str() {
        "$connect" => handle_connect(event, state, &connection_id).await,
        "$disconnect" => handle_disconnect(state, &connection_id).await,
        "$default" => handle_message(event, state).await,
        _ => {
            tracing::warn!("Unknown WebSocket route: {}", route_key);
            message_response(StatusCode::BAD_REQUEST, "Unknown route")
        }
    }
}

fn header(event: &Request, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| event.headers().get(*name))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

async fn handle_connect(
    event: Request,
    state: Arc<AppState>,
    connection_id: &str,
) -> Result<Response<Body>, Error> {
    let services = &state.services;
    let (user_id, is_admin) = match Identity::from_request(&event, services.config().allow_dev_headers) {
        Some(identity) => {
            let actor = services.users.policy().actor(identity);
            (actor.user_id().to_string(), actor.is_admin())
        }
        None => (ANONYMOUS.to_string(), false),
    };

    save_connection(&state.dynamo_client, state.table_name(), connection_id, &user_id, is_admin).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(Body::Empty)
        .map_err(Box::new)?)
}

async fn handle_disconnect(state: Arc<AppState>, connection_id: &str) -> Result<Response<Body>, Error> {
    remove_connection(&state.dynamo_client, state.table_name(), connection_id).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(Body::Empty)
        .map_err(Box::new)?)
}

/// Handle $default event (incoming messages)
async fn handle_message(event: Request, state: Arc<AppState>) -> Result<Response<Body>, Error> {
    let message: WebSocketMessage = match serde_json::from_slice(event.body()) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::error!("Failed to parse WebSocket message: {}", e);
            return message_response(StatusCode::BAD_REQUEST, &format!("Invalid message format: {}", e));
        }
    };

    let action: WebSocketAction = match serde_json::from_value(serde_json::Value::String(message.action.clone())) {
        Ok(action) => action,
        Err(_) => {
            tracing::warn!("Unknown action: {}", message.action);
            return message_response(StatusCode::BAD_REQUEST, &format!("Unknown action: {}", message.action));
        }
    };

    match action {
        WebSocketAction::Ping => json_response(StatusCode::OK, &serde_json::json!({ "type": "pong" })),
        WebSocketAction::Snapshot => {
            let Some(identity) = Identity::from_request(&event, state.services.config().allow_dev_headers) else {
                return message_response(StatusCode::UNAUTHORIZED, "Unauthorized");
            };
            let collection = message
                .data
                .get("collection")
                .and_then(|v| v.as_str())
                .and_then(Collection::parse);
            let Some(collection) = collection else {
                return message_response(StatusCode::BAD_REQUEST, "Missing or unknown collection");
            };

            match snapshot(&state, identity, collection).await {
                Ok(documents) => json_response(
                    StatusCode::OK,
                    &serde_json::json!({
                        "type": "snapshot",
                        "collection": collection,
                        "documents": documents,
                    }),
                ),
                Err(e) => error_response(&e),
            }
        }
    }
}

/// Current documents of `collection` filtered to what the caller may see.
async fn snapshot(
    state: &AppState,
    identity: Identity,
    collection: Collection,
) -> Result<serde_json::Value, LedgerError> {
    let services = &state.services;
    let (actor, me) = services.users.ensure_user(identity).await?;
    let to_json = |value: serde_json::Result<serde_json::Value>| {
        value.map_err(|e| LedgerError::Serialization {
            path: collection.to_string(),
            message: e.to_string(),
        })
    };

    match collection {
        Collection::Users if actor.is_admin() => to_json(serde_json::to_value(services.users.list_users(&actor).await?)),
        Collection::Users => to_json(serde_json::to_value(vec![me])),
        Collection::Jobs => to_json(serde_json::to_value(services.jobs.list_jobs(None).await?)),
        Collection::Submissions => to_json(serde_json::to_value(services.reviews.list_submissions(&actor).await?)),
        Collection::Withdrawals => to_json(serde_json::to_value(services.withdrawals.list(&actor).await?)),
        Collection::Deposits => to_json(serde_json::to_value(services.deposits.list(&actor).await?)),
        Collection::Verifications => to_json(serde_json::to_value(services.verifications.list(&actor).await?)),
        Collection::Settings => to_json(Ok(serde_json::json!({
            "deposit": services.settings.get::<DepositSettings>().await?,
            "ads": services.settings.get::<AdSettings>().await?,
        }))),
        Collection::Awards => Err(LedgerError::PermissionDenied("award markers are not published".into())),
    }
}
