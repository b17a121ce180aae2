use super::{AppState, codes, gateway_failure, invalid_params, reply};
use axum::{
    Form,
    extract::{State, rejection::FormRejection},
    response::Response,
};
use courier_core::{Envelope, Message};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Default, Deserialize)]
pub struct CloseForm {
    #[serde(default)]
    pub cid: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserForm {
    #[serde(default)]
    pub uid: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SendForm {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub retries: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PushForm {
    #[serde(default)]
    pub conn_id: String,
    #[serde(default)]
    pub content: String,
}

fn parse_uid(raw: &str) -> Option<i64> {
    raw.trim().parse().ok().filter(|uid| *uid != 0)
}

/// `POST /ws/connection/close`: close one connection, routed to its owner.
pub async fn close_connection(
    State(state): State<AppState>,
    form: Result<Form<CloseForm>, FormRejection>,
) -> Response {
    let Ok(Form(form)) = form else {
        return invalid_params("cid");
    };
    let cid = form.cid.trim();
    if cid.is_empty() {
        return reply(Envelope::failure(
            codes::CONNECTION_ID_EMPTY,
            "connection id is empty",
        ));
    }

    match state.gateway.close_connection(cid).await {
        Ok(()) => reply(Envelope::success()),
        Err(e) => {
            warn!(conn_id = %cid, "Close connection failed: {}", e);
            gateway_failure(&e)
        }
    }
}

/// `POST /ws/connection/close_all`: close every connection of a user.
pub async fn close_all_connections(
    State(state): State<AppState>,
    form: Result<Form<UserForm>, FormRejection>,
) -> Response {
    let Some(uid) = form.ok().and_then(|Form(form)| parse_uid(&form.uid)) else {
        return invalid_params("uid");
    };

    match state.gateway.close_all_connections(uid).await {
        Ok(summary) => {
            info!(user_id = uid, closed = summary.closed, failed = summary.failed, "Closed user connections");
            reply(Envelope::success().with_data(json!({
                "closed": summary.closed,
                "failed": summary.failed,
            })))
        }
        Err(e) => gateway_failure(&e),
    }
}

/// `POST /ws/msg/send`: queue a message for every connection of a user.
pub async fn send_message(
    State(state): State<AppState>,
    form: Result<Form<SendForm>, FormRejection>,
) -> Response {
    let Ok(Form(form)) = form else {
        return invalid_params("form");
    };
    let Some(uid) = parse_uid(&form.uid) else {
        return invalid_params("uid");
    };
    if form.content.is_empty() {
        return invalid_params("content");
    }
    let retries = match form.retries.as_deref().map(str::trim) {
        None | Some("") => 0,
        Some(raw) => match raw.parse::<u32>() {
            Ok(retries) => retries,
            Err(_) => return invalid_params("retries"),
        },
    };

    match state
        .gateway
        .enqueue_message(uid, json!(form.content), retries)
        .await
    {
        Ok(message) => reply(Envelope::success().with_data(json!({ "id": message.id }))),
        Err(e) => {
            warn!(user_id = uid, "Enqueue failed: {}", e);
            reply(Envelope::failure(codes::ENQUEUE_FAILED, e.to_string()))
        }
    }
}

/// `POST /ws/msg/push`: deliver a peer-forwarded message to a local connection.
pub async fn push_message(
    State(state): State<AppState>,
    form: Result<Form<PushForm>, FormRejection>,
) -> Response {
    let Ok(Form(form)) = form else {
        return invalid_params("form");
    };
    let conn_id = form.conn_id.trim();
    if conn_id.is_empty() {
        return reply(Envelope::failure(
            codes::CONNECTION_ID_EMPTY,
            "connection id is empty",
        ));
    }
    let message = match Message::from_json(&form.content) {
        Ok(message) => message,
        Err(e) => return invalid_params(format!("content: {}", e)),
    };

    match state.gateway.deliver_to_connection(conn_id, &message).await {
        Ok(()) => reply(Envelope::success()),
        Err(e) => {
            warn!(conn_id = %conn_id, msg_id = %message.id, "Push failed: {}", e);
            gateway_failure(&e)
        }
    }
}

/// `GET /ws/status`: local connection count and node address.
pub async fn status(State(state): State<AppState>) -> Response {
    match state.gateway.local_connection_count().await {
        Ok(connections) => reply(Envelope::success().with_data(json!({
            "node": state.gateway.node(),
            "connections": connections,
        }))),
        Err(e) => gateway_failure(&e),
    }
}
