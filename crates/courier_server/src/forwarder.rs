//! HTTP forwarding to peer nodes.

use async_trait::async_trait;
use courier_core::{Envelope, Forwarder, GatewayError, Message, Result};
use std::time::Duration;
use tracing::debug;

/// Calls a peer node's management endpoints over plain HTTP.
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> std::result::Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn post_form(&self, node: &str, path: &str, form: &[(&str, &str)]) -> Result<()> {
        let url = format!("http://{}{}", node, path);
        let resp = self
            .client
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(|e| GatewayError::forward_transport(node, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(GatewayError::forward_transport(
                node,
                format!("unexpected status {}", status),
            ));
        }

        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| GatewayError::forward_transport(node, e))?;
        debug!(node = %node, path = %path, code = envelope.code, "peer replied");
        envelope.into_result(node)
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward_close(&self, node: &str, conn_id: &str) -> Result<()> {
        self.post_form(node, "/ws/connection/close", &[("cid", conn_id)])
            .await
    }

    async fn forward_push(&self, node: &str, conn_id: &str, message: &Message) -> Result<()> {
        let content = message.to_json()?;
        self.post_form(
            node,
            "/ws/msg/push",
            &[("conn_id", conn_id), ("content", content.as_str())],
        )
        .await
    }
}
