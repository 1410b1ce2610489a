use aws_sdk_apigatewaymanagement::Client as ApiGatewayManagementClient;
use aws_sdk_dynamodb::Client as DynamoClient;
use lambda_http::{run, service_fn, tracing, Error, Request};
use std::sync::Arc;
use taskhub_shared::config::LedgerConfig;
use taskhub_shared::AppState;

mod http_handler;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing::init_default_subscriber();

    // Initialize AWS clients once at startup
    let config = aws_config::load_from_env().await;
    let ledger_config = LedgerConfig::from_env();

    // API Gateway Management client for WebSocket (optional endpoint)
    let api_gateway_client = std::env::var("WS_API_ENDPOINT").ok().map(|endpoint| {
        let api_config = aws_sdk_apigatewaymanagement::config::Builder::from(&config)
            .endpoint_url(endpoint)
            .build();
        ApiGatewayManagementClient::from_conf(api_config)
    });

    let state = AppState::new(DynamoClient::new(&config), api_gateway_client, ledger_config);

    run(service_fn(move |event: Request| {
        let state = Arc::clone(&state);
        async move {
            // WebSocket routes arrive through the same function with a route key header
            if event.headers().contains_key("routekey") || event.headers().contains_key("routeKey") {
                taskhub_shared::sockets::handle_websocket_event(event, state).await
            } else {
                http_handler::function_handler(event, state).await
            }
        }
    }))
    .await
}
