//! Test utilities for courier_core
//!
//! A scripted duplex connection and a recording forwarder, shared by the
//! unit tests and by integration tests of dependent crates (feature
//! `test-utils`).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use crate::duplex::DuplexConnection;
use crate::error::{GatewayError, Result, TransportError};
use crate::forward::Forwarder;
use crate::message::Message;

/// In-process stand-in for a client socket.
///
/// Frames pushed with [`MockConnection::push_inbound`] are returned by
/// `receive`; everything the gateway sends is recorded.
pub struct MockConnection {
    id: String,
    sent: Mutex<Vec<Vec<u8>>>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    alive: AtomicBool,
    closes: AtomicUsize,
    closed: AtomicBool,
    close_signal: Notify,
}

impl MockConnection {
    pub fn new(id: &str) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            id: id.to_string(),
            sent: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            alive: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    /// Queue a frame for the gateway to receive.
    pub fn push_inbound(&self, frame: impl Into<Vec<u8>>) {
        let _ = self.inbound_tx.send(frame.into());
    }

    /// Acknowledge a delivered message the way a client would.
    pub fn ack(&self, msg_id: &str) {
        self.push_inbound(serde_json::json!({ "id": msg_id, "content": "ack" }).to_string());
    }

    /// Mark the socket dead; probes and the non-probing check both see it.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent frames parsed as messages.
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent_frames()
            .iter()
            .map(|raw| serde_json::from_slice(raw).unwrap())
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DuplexConnection for MockConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, payload: &[u8]) -> std::result::Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    async fn receive(&self) -> std::result::Result<Vec<u8>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            frame = inbound.recv() => frame.ok_or(TransportError::Closed),
            _ = self.close_signal.notified() => Err(TransportError::Closed),
        }
    }

    async fn is_connected(&self) -> bool {
        self.last_known_connected()
    }

    fn last_known_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.is_closed()
    }

    async fn close(&self) -> std::result::Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        // Stores a permit if the receiver is not parked yet.
        self.close_signal.notify_one();
        Ok(())
    }
}

/// Forwarder that records every request instead of calling a peer.
#[derive(Default)]
pub struct MockForwarder {
    closes: Mutex<Vec<(String, String)>>,
    pushes: Mutex<Vec<(String, String, Message)>>,
    failing: AtomicBool,
}

impl MockForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every forward fail with a non-zero peer code.
    pub fn failing() -> Self {
        let forwarder = Self::default();
        forwarder.failing.store(true, Ordering::SeqCst);
        forwarder
    }

    /// `(node, conn_id)` of each close request.
    pub fn close_calls(&self) -> Vec<(String, String)> {
        self.closes.lock().unwrap().clone()
    }

    /// `(node, conn_id, message)` of each push request.
    pub fn push_calls(&self) -> Vec<(String, String, Message)> {
        self.pushes.lock().unwrap().clone()
    }

    fn outcome(&self, node: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(GatewayError::Forward {
                node: node.to_string(),
                code: 10001,
                message: "mock failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Forwarder for MockForwarder {
    async fn forward_close(&self, node: &str, conn_id: &str) -> Result<()> {
        self.closes
            .lock()
            .unwrap()
            .push((node.to_string(), conn_id.to_string()));
        self.outcome(node)
    }

    async fn forward_push(&self, node: &str, conn_id: &str, message: &Message) -> Result<()> {
        self.pushes
            .lock()
            .unwrap()
            .push((node.to_string(), conn_id.to_string(), message.clone()));
        self.outcome(node)
    }
}
