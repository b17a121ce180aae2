//! [`DuplexConnection`] over an upgraded axum WebSocket.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use courier_core::{DuplexConnection, TransportError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

pub struct WsConnection {
    id: String,
    /// One writer at a time: data frames, pings and the close frame.
    ws_tx: Mutex<SplitSink<WebSocket, Message>>,
    ws_rx: Mutex<SplitStream<WebSocket>>,
    connected: AtomicBool,
    closed: AtomicBool,
    /// Bound on acquiring the writer plus one write. A peer that stops
    /// reading fills the socket buffer; past this the connection counts as dead.
    write_timeout: Duration,
}

impl WsConnection {
    pub fn new(id: String, socket: WebSocket, write_timeout: Duration) -> Self {
        let (ws_tx, ws_rx) = socket.split();
        Self {
            id,
            ws_tx: Mutex::new(ws_tx),
            ws_rx: Mutex::new(ws_rx),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            write_timeout,
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Send one frame, failing the connection on error or timeout.
    async fn write(&self, frame: Message) -> Result<(), TransportError> {
        let result = timeout(self.write_timeout, async {
            let mut ws_tx = self.ws_tx.lock().await;
            ws_tx.send(frame).await
        })
        .await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.mark_disconnected();
                Err(TransportError::SendFailed(e.to_string()))
            }
            Err(_) => {
                self.mark_disconnected();
                Err(TransportError::SendFailed("write timed out".to_string()))
            }
        }
    }
}

#[async_trait]
impl DuplexConnection for WsConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let text = String::from_utf8(payload.to_vec())
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        self.write(Message::Text(text.into())).await
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let mut ws_rx = self.ws_rx.lock().await;
        loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().as_bytes().to_vec()),
                Some(Ok(Message::Binary(data))) => return Ok(data.to_vec()),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    self.mark_disconnected();
                    return Err(TransportError::Closed);
                }
                Some(Err(e)) => {
                    self.mark_disconnected();
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn is_connected(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.write(Message::Ping(Bytes::new())).await {
            debug!(conn_id = %self.id, "ping failed: {}", e);
            return false;
        }
        true
    }

    fn last_known_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.mark_disconnected();
        let result = timeout(self.write_timeout, async {
            let mut ws_tx = self.ws_tx.lock().await;
            ws_tx.close().await
        })
        .await;
        match result {
            Ok(closed) => closed.map_err(|e| TransportError::SendFailed(e.to_string())),
            Err(_) => Err(TransportError::SendFailed("close timed out".to_string())),
        }
    }
}
