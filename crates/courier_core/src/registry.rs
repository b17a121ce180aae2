//! Local connection registry.
//!
//! The registry is a plain owned map. Only the coordinator task holds it;
//! every other component asks the coordinator.

use crate::descriptor::ConnectionDescriptor;
use crate::duplex::DuplexConnection;
use crate::error::{Result, TransportError};
use crate::message::Message;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// A connection owned by this node: its descriptor plus the live socket.
pub struct LocalConnection {
    id: String,
    uid: i64,
    /// Guards the closed flag and disconnect time; the teardown sequence
    /// runs while holding it.
    descriptor: Mutex<ConnectionDescriptor>,
    duplex: Arc<dyn DuplexConnection>,
    /// Cleared on teardown; deliveries after that are refused.
    outbound_open: AtomicBool,
}

impl LocalConnection {
    pub fn new(descriptor: ConnectionDescriptor, duplex: Arc<dyn DuplexConnection>) -> Self {
        Self {
            id: descriptor.id.clone(),
            uid: descriptor.uid,
            descriptor: Mutex::new(descriptor),
            duplex,
            outbound_open: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn duplex(&self) -> &Arc<dyn DuplexConnection> {
        &self.duplex
    }

    /// Snapshot of the current descriptor.
    pub async fn descriptor(&self) -> ConnectionDescriptor {
        self.descriptor.lock().await.clone()
    }

    pub(crate) async fn lock_descriptor(&self) -> MutexGuard<'_, ConnectionDescriptor> {
        self.descriptor.lock().await
    }

    pub(crate) fn stop_outbound(&self) {
        self.outbound_open.store(false, Ordering::SeqCst);
    }

    /// `false` once the coordinator has torn this connection down.
    pub fn is_open(&self) -> bool {
        self.outbound_open.load(Ordering::SeqCst)
    }

    /// Open and the transport has not reported a failure. Gates the loops
    /// that pull work from the shared queues.
    pub fn is_live(&self) -> bool {
        self.is_open() && self.duplex.last_known_connected()
    }

    /// Write one message to the client.
    pub async fn deliver(&self, message: &Message) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::Closed.into());
        }
        let payload = message.to_json()?;
        self.duplex.send(payload.as_bytes()).await?;
        debug!(user_id = self.uid, conn_id = %self.id, msg_id = %message.id, retries = message.retries, "message delivered");
        Ok(())
    }
}

#[derive(Default)]
pub struct Registry {
    connections: HashMap<String, Arc<LocalConnection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: Arc<LocalConnection>) {
        self.connections.insert(conn.id().to_string(), conn);
    }

    pub fn remove(&mut self, conn_id: &str) -> Option<Arc<LocalConnection>> {
        self.connections.remove(conn_id)
    }

    pub fn get(&self, conn_id: &str) -> Option<Arc<LocalConnection>> {
        self.connections.get(conn_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
