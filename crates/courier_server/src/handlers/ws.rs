use super::{AppState, invalid_params};
use crate::ws_connection::WsConnection;
use axum::{
    extract::{Query, State, ws::WebSocketUpgrade},
    http::HeaderValue,
    response::{IntoResponse, Response},
};
use courier_core::DuplexConnection;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Response header carrying the id assigned to the new connection.
pub const CONNECTION_ID_HEADER: &str = "x-connection-id";

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub uid: Option<String>,
}

/// `GET /ws/connection/add?uid=`: upgrade and register a client connection.
pub async fn connect_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let uid = match query.uid.as_deref().map(str::parse::<i64>) {
        Some(Ok(uid)) if uid != 0 => uid,
        _ => return invalid_params("uid"),
    };

    let conn_id = uuid::Uuid::new_v4().to_string();
    let gateway = state.gateway.clone();
    let write_timeout = gateway.config().transport_timeout;
    let id = conn_id.clone();

    let mut response = ws
        .on_upgrade(move |socket| async move {
            let duplex = Arc::new(WsConnection::new(id.clone(), socket, write_timeout));
            match gateway.connect(uid, duplex.clone()).await {
                Ok(_) => info!(user_id = uid, conn_id = %id, "WebSocket connected"),
                Err(e) => {
                    warn!(user_id = uid, conn_id = %id, "Failed to register connection: {}", e);
                    let _ = duplex.close().await;
                }
            }
        })
        .into_response();

    if let Ok(value) = HeaderValue::from_str(&conn_id) {
        response.headers_mut().insert(CONNECTION_ID_HEADER, value);
    }
    response
}
