//! Management operations: the surface the HTTP layer and peer nodes drive.

use crate::config::DeliveryConfig;
use crate::coordinator::{Coordinator, CoordinatorHandle};
use crate::descriptor::ConnectionDescriptor;
use crate::duplex::DuplexConnection;
use crate::error::{GatewayError, Result};
use crate::forward::Forwarder;
use crate::message::Message;
use crate::presence;
use crate::queue;
use crate::registry::LocalConnection;
use crate::store::CoordinationStore;
use crate::sweep::SweepReport;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of closing every connection of a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseAllSummary {
    pub closed: usize,
    pub failed: usize,
}

/// One gateway node. Cheap to clone; all clones share the same coordinator.
#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn CoordinationStore>,
    forwarder: Arc<dyn Forwarder>,
    coordinator: CoordinatorHandle,
    node: Arc<str>,
    config: Arc<DeliveryConfig>,
    startup_sweep: SweepReport,
}

impl Gateway {
    /// Run the stale sweep and start the coordinator for `node` (`host:port`
    /// as peers reach it).
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        forwarder: Arc<dyn Forwarder>,
        node: impl Into<String>,
        config: DeliveryConfig,
    ) -> Result<Self> {
        let node = node.into();
        let config = Arc::new(config);
        let (coordinator, startup_sweep) =
            Coordinator::start(store.clone(), forwarder.clone(), node.clone(), config.clone())
                .await?;

        Ok(Self {
            store,
            forwarder,
            coordinator,
            node: node.into(),
            config,
            startup_sweep,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn startup_sweep(&self) -> SweepReport {
        self.startup_sweep
    }

    /// Register an accepted connection for `uid` and start its loops.
    /// Returns the connection id.
    pub async fn connect(&self, uid: i64, duplex: Arc<dyn DuplexConnection>) -> Result<String> {
        if uid == 0 {
            return Err(GatewayError::InvalidUser(uid));
        }
        let descriptor = ConnectionDescriptor::open(duplex.id(), uid, &*self.node);
        let conn_id = descriptor.id.clone();
        self.coordinator
            .add(Arc::new(LocalConnection::new(descriptor, duplex)))
            .await?;
        Ok(conn_id)
    }

    /// Close a connection wherever it lives. Closing an already-closed
    /// connection succeeds.
    pub async fn close_connection(&self, conn_id: &str) -> Result<()> {
        let Some(mut descriptor) = presence::load_descriptor(self.store.as_ref(), conn_id).await?
        else {
            return Err(GatewayError::ConnectionNotFound(conn_id.to_string()));
        };
        if descriptor.closed {
            return Ok(());
        }

        if !descriptor.is_owned_by(&self.node) {
            info!(conn_id = %conn_id, node = %descriptor.node, "forwarding close to owning node");
            return self.forwarder.forward_close(&descriptor.node, conn_id).await;
        }

        if let Some(conn) = self.coordinator.lookup(conn_id).await? {
            self.coordinator.remove_and_wait(conn).await?;
            return Ok(());
        }

        // Owned here but not registered: the socket is already gone.
        descriptor.mark_closed();
        presence::save_descriptor(self.store.as_ref(), &descriptor).await?;
        presence::retire_descriptor(
            self.store.as_ref(),
            conn_id,
            self.config.descriptor_retention,
        )
        .await?;
        Ok(())
    }

    /// Close every open connection of `uid`, local or remote.
    pub async fn close_all_connections(&self, uid: i64) -> Result<CloseAllSummary> {
        let descriptors = presence::user_descriptors(self.store.as_ref(), uid).await?;
        let closes = descriptors
            .iter()
            .filter(|d| !d.closed)
            .map(|d| self.close_connection(&d.id));

        let mut summary = CloseAllSummary::default();
        for result in join_all(closes).await {
            match result {
                Ok(()) => summary.closed += 1,
                Err(e) => {
                    warn!(user_id = uid, "close connection failed: {}", e);
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Queue a new message for every connection of `uid`.
    pub async fn enqueue_message(
        &self,
        uid: i64,
        content: serde_json::Value,
        retries: u32,
    ) -> Result<Message> {
        let message = Message::new(uid, content, retries);
        self.enqueue(&message).await?;
        Ok(message)
    }

    /// Queue an already-built message.
    pub async fn enqueue(&self, message: &Message) -> Result<()> {
        if message.uid == 0 {
            return Err(GatewayError::InvalidUser(message.uid));
        }
        queue::enqueue(self.store.as_ref(), message).await
    }

    /// Deliver to a connection registered on this node. Used by peers that
    /// forward a push here.
    pub async fn deliver_to_connection(&self, conn_id: &str, message: &Message) -> Result<()> {
        let Some(conn) = self.coordinator.lookup(conn_id).await? else {
            return Err(GatewayError::ConnectionNotFound(conn_id.to_string()));
        };
        conn.deliver(&message.for_connection(conn_id)).await
    }

    pub async fn local_connection_count(&self) -> Result<usize> {
        self.coordinator.count().await
    }
}
