//! Cross-node forwarding port.
//!
//! When a connection lives on another node, close and push requests are
//! sent to that node. The forwarder reports failure but never retries; for
//! messages, retrying is the ack-retry loop's job.

use crate::error::{GatewayError, Result};
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Response envelope returned by every management endpoint. `code == 0` is
/// success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i64,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Envelope {
    pub fn success() -> Self {
        Self {
            code: 0,
            msg: "success".to_string(),
            data: None,
        }
    }

    pub fn failure(code: i64, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Turn a peer's reply into a forwarding result.
    pub fn into_result(self, node: &str) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(GatewayError::Forward {
                node: node.to_string(),
                code: self.code,
                message: self.msg,
            })
        }
    }
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Ask `node` to tear down one of its connections.
    async fn forward_close(&self, node: &str, conn_id: &str) -> Result<()>;

    /// Ask `node` to deliver `message` to one of its connections.
    async fn forward_push(&self, node: &str, conn_id: &str, message: &Message) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_zero_code_is_a_forward_failure() {
        let reply: Envelope =
            serde_json::from_str(r#"{"code":20005,"msg":"connection not found"}"#).unwrap();
        match reply.into_result("10.0.0.2:10186") {
            Err(GatewayError::Forward { node, code, .. }) => {
                assert_eq!(node, "10.0.0.2:10186");
                assert_eq!(code, 20005);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(Envelope::success().into_result("n").is_ok());
    }

    #[test]
    fn data_is_omitted_when_absent() {
        assert_eq!(
            serde_json::to_string(&Envelope::success()).unwrap(),
            r#"{"code":0,"msg":"success"}"#
        );
    }
}
