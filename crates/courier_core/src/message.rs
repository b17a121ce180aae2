//! Message envelopes exchanged with clients and between nodes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A queued message for one user.
///
/// Field order is part of the wire format: clients and peer nodes receive
/// `{"id","uid","content","retries","conn_id"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub uid: i64,
    pub content: Value,
    /// Remaining redelivery attempts. Only ever decremented.
    #[serde(default)]
    pub retries: u32,
    /// Target connection; empty until the message is fanned out.
    #[serde(default)]
    pub conn_id: String,
}

impl Message {
    /// Build a fresh message with a `{unix_seconds}-{uuid}` id.
    pub fn new(uid: i64, content: Value, retries: u32) -> Self {
        Self {
            id: new_message_id(),
            uid,
            content,
            retries,
            conn_id: String::new(),
        }
    }

    /// Copy of this message addressed to a specific connection.
    pub fn for_connection(&self, conn_id: &str) -> Self {
        Self {
            conn_id: conn_id.to_string(),
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Time-ordered-ish message id.
pub fn new_message_id() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().timestamp(),
        uuid::Uuid::new_v4()
    )
}

/// Frame sent by a client. A non-empty `id` acknowledges a delivered message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub content: Value,
}

impl InboundFrame {
    pub fn parse(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    /// Id of the acknowledged message, if this frame carries one.
    pub fn ack_id(&self) -> Option<&str> {
        if self.id.is_empty() {
            None
        } else {
            Some(&self.id)
        }
    }
}
