use crate::error::{ErrorKind, LedgerError};
use lambda_http::{http::StatusCode, Body, Error, Response};
use serde::Serialize;

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidState => StatusCode::CONFLICT,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::VerificationInProgress => StatusCode::CONFLICT,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(serde_json::to_string(body)?.into())
        .map_err(Box::new)?)
}

/// Body names the error kind and the invariant that blocked the action.
pub fn error_response(err: &LedgerError) -> Result<Response<Body>, Error> {
    let kind = err.kind();
    if kind == ErrorKind::StorageUnavailable {
        tracing::error!("Request failed on storage: {}", err);
    } else {
        tracing::info!(error_kind = ?kind, "Request refused: {}", err);
    }
    json_response(
        status_for(kind),
        &serde_json::json!({ "error": kind, "message": err.to_string() }),
    )
}

pub fn message_response(status: StatusCode, message: &str) -> Result<Response<Body>, Error> {
    json_response(status, &serde_json::json!({ "error": message }))
}

pub fn not_found() -> Result<Response<Body>, Error> {
    message_response(StatusCode::NOT_FOUND, "Not found")
}
