pub mod api;
pub mod ws;

use axum::{
    Json, Router,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use courier_core::{Envelope, Gateway, GatewayError};

/// Response codes carried in the envelope. Every response is HTTP 200.
pub mod codes {
    pub const SUCCESS: i64 = 0;
    pub const UNKNOWN: i64 = 10001;
    pub const INVALID_PARAMS: i64 = 10002;
    pub const REQUEST_FAILED: i64 = 10006;
    pub const ENQUEUE_FAILED: i64 = 20001;
    pub const CONNECTION_ID_EMPTY: i64 = 20003;
    pub const CONNECTION_NOT_FOUND: i64 = 20005;
}

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
}

/// Management and connection routes, without CORS or tracing layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/ws/connection/add", get(ws::connect_handler))
        .route("/ws/connection/close", post(api::close_connection))
        .route("/ws/connection/close_all", post(api::close_all_connections))
        .route("/ws/msg/send", post(api::send_message))
        .route("/ws/msg/push", post(api::push_message))
        .route("/ws/status", get(api::status))
        .with_state(state)
}

pub(crate) fn reply(envelope: Envelope) -> Response {
    Json(envelope).into_response()
}

pub(crate) fn invalid_params(detail: impl std::fmt::Display) -> Response {
    reply(Envelope::failure(
        codes::INVALID_PARAMS,
        format!("invalid params: {}", detail),
    ))
}

/// Envelope for a failed gateway operation.
pub(crate) fn gateway_failure(err: &GatewayError) -> Response {
    let code = match err {
        GatewayError::ConnectionNotFound(_) => codes::CONNECTION_NOT_FOUND,
        GatewayError::InvalidUser(_) => codes::INVALID_PARAMS,
        GatewayError::Forward { .. } => codes::REQUEST_FAILED,
        _ => codes::UNKNOWN,
    };
    reply(Envelope::failure(code, err.to_string()))
}
