//! Connection descriptors: who owns a connection and where it lives.

use crate::error::StoreError;
use std::collections::HashMap;

/// Per-connection metadata, mirrored into the shared store so other nodes
/// can route to the owning node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub id: String,
    pub uid: i64,
    /// Owning node, `host:port`.
    pub node: String,
    pub closed: bool,
    /// Unix seconds, 0 when unset.
    pub connect_time: i64,
    /// Unix seconds, 0 when unset.
    pub disconnect_time: i64,
}

impl ConnectionDescriptor {
    /// Descriptor for a connection accepted just now on `node`.
    pub fn open(id: impl Into<String>, uid: i64, node: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uid,
            node: node.into(),
            closed: false,
            connect_time: chrono::Utc::now().timestamp(),
            disconnect_time: 0,
        }
    }

    /// Mark closed and stamp the disconnect time. Returns `false` if the
    /// descriptor was already closed.
    pub fn mark_closed(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.disconnect_time = chrono::Utc::now().timestamp();
        true
    }

    pub fn is_owned_by(&self, node: &str) -> bool {
        self.node == node
    }

    /// Hash fields as written to the store.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("id".to_string(), self.id.clone()),
            ("uid".to_string(), self.uid.to_string()),
            ("node".to_string(), self.node.clone()),
            (
                "closed".to_string(),
                if self.closed { "1" } else { "0" }.to_string(),
            ),
            ("connect_time".to_string(), self.connect_time.to_string()),
            (
                "disconnect_time".to_string(),
                self.disconnect_time.to_string(),
            ),
        ]
    }

    /// Parse a stored hash. `key` is only used for error reporting.
    pub fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Self, StoreError> {
        let text = |name: &str| -> Result<String, StoreError> {
            fields.get(name).cloned().ok_or_else(|| StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("missing field {}", name),
            })
        };
        let number = |name: &str| -> Result<i64, StoreError> {
            match fields.get(name) {
                None => Ok(0),
                Some(raw) if raw.is_empty() => Ok(0),
                Some(raw) => raw.parse().map_err(|_| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: format!("field {} is not an integer: {}", name, raw),
                }),
            }
        };

        let closed = matches!(
            fields.get("closed").map(String::as_str),
            Some("1") | Some("true")
        );

        Ok(Self {
            id: text("id")?,
            uid: number("uid")?,
            node: text("node")?,
            closed,
            connect_time: number("connect_time")?,
            disconnect_time: number("disconnect_time")?,
        })
    }
}
