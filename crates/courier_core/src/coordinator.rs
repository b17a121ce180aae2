//! The coordinator: one task that owns the local registry and applies
//! add/remove events in order.
//!
//! Nothing else mutates the registry. Connection loops, HTTP handlers and
//! fan-out tasks talk to it through a [`CoordinatorHandle`], which wraps the
//! sending half of the event channel created once in [`Coordinator::start`].

use crate::config::DeliveryConfig;
use crate::delivery::DeliveryEngine;
use crate::error::{GatewayError, Result};
use crate::forward::Forwarder;
use crate::presence;
use crate::registry::{LocalConnection, Registry};
use crate::store::CoordinationStore;
use crate::sweep::{self, SweepReport};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

enum Event {
    Add {
        conn: Arc<LocalConnection>,
        done: oneshot::Sender<()>,
    },
    Remove {
        conn: Arc<LocalConnection>,
        /// Receives whether this event performed the teardown.
        done: Option<oneshot::Sender<bool>>,
    },
    Lookup {
        conn_id: String,
        reply: oneshot::Sender<Option<Arc<LocalConnection>>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

/// Cheap, clonable access to the coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::Sender<Event>,
}

impl CoordinatorHandle {
    async fn send(&self, event: Event) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| GatewayError::CoordinatorUnavailable)
    }

    /// Register a connection and start its loops. Resolves once registered.
    pub async fn add(&self, conn: Arc<LocalConnection>) -> Result<()> {
        let (done, registered) = oneshot::channel();
        self.send(Event::Add { conn, done }).await?;
        registered
            .await
            .map_err(|_| GatewayError::CoordinatorUnavailable)
    }

    /// Request teardown without waiting for it.
    pub async fn remove(&self, conn: Arc<LocalConnection>) -> Result<()> {
        self.send(Event::Remove { conn, done: None }).await
    }

    /// Tear a connection down and wait. Returns `false` if it was already closed.
    pub async fn remove_and_wait(&self, conn: Arc<LocalConnection>) -> Result<bool> {
        let (done, removed) = oneshot::channel();
        self.send(Event::Remove {
            conn,
            done: Some(done),
        })
        .await?;
        removed
            .await
            .map_err(|_| GatewayError::CoordinatorUnavailable)
    }

    pub async fn lookup(&self, conn_id: &str) -> Result<Option<Arc<LocalConnection>>> {
        let (reply, response) = oneshot::channel();
        self.send(Event::Lookup {
            conn_id: conn_id.to_string(),
            reply,
        })
        .await?;
        response
            .await
            .map_err(|_| GatewayError::CoordinatorUnavailable)
    }

    pub async fn count(&self) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.send(Event::Count { reply }).await?;
        response
            .await
            .map_err(|_| GatewayError::CoordinatorUnavailable)
    }
}

pub struct Coordinator {
    registry: Registry,
    events: mpsc::Receiver<Event>,
    store: Arc<dyn CoordinationStore>,
    engine: DeliveryEngine,
    config: Arc<DeliveryConfig>,
}

impl Coordinator {
    /// Sweep stale presence left by a previous run of this node, then spawn
    /// the coordinator task.
    ///
    /// Fails only if the store cannot be read at all.
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        forwarder: Arc<dyn Forwarder>,
        node: String,
        config: Arc<DeliveryConfig>,
    ) -> Result<(CoordinatorHandle, SweepReport)> {
        let report = sweep::sweep_stale(store.as_ref(), &node, &config).await?;

        let (tx, rx) = mpsc::channel(config.event_buffer.max(1));
        let handle = CoordinatorHandle { events: tx };
        let engine = DeliveryEngine::new(
            store.clone(),
            forwarder,
            handle.clone(),
            node.clone(),
            config.clone(),
        );
        let coordinator = Coordinator {
            registry: Registry::new(),
            events: rx,
            store,
            engine,
            config,
        };
        tokio::spawn(coordinator.run());
        info!(node = %node, "coordinator started");

        Ok((handle, report))
    }

    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                Event::Add { conn, done } => {
                    self.add(conn).await;
                    let _ = done.send(());
                }
                Event::Remove { conn, done } => {
                    let removed = self.remove(conn).await;
                    if let Some(done) = done {
                        let _ = done.send(removed);
                    }
                }
                Event::Lookup { conn_id, reply } => {
                    let _ = reply.send(self.registry.get(&conn_id));
                }
                Event::Count { reply } => {
                    let _ = reply.send(self.registry.len());
                }
            }
        }
        debug!("coordinator event channel closed");
    }

    async fn add(&mut self, conn: Arc<LocalConnection>) {
        self.registry.insert(conn.clone());

        let descriptor = conn.descriptor().await;
        let store = self.store.as_ref();
        // Failures are logged inside; the connection stays usable locally.
        let _ = presence::save_descriptor(store, &descriptor).await;
        let _ = presence::add_online_user(store, descriptor.uid).await;
        let _ = presence::add_user_connection(
            store,
            descriptor.uid,
            &descriptor.id,
            descriptor.connect_time,
        )
        .await;

        self.engine.spawn_loops(conn);
        info!(
            user_id = descriptor.uid,
            conn_id = %descriptor.id,
            node = %descriptor.node,
            connections = self.registry.len(),
            "connection registered"
        );
    }

    async fn remove(&mut self, conn: Arc<LocalConnection>) -> bool {
        let mut descriptor = conn.lock_descriptor().await;
        if !descriptor.mark_closed() {
            return false;
        }

        conn.stop_outbound();
        self.registry.remove(conn.id());
        self.spawn_transport_close(conn.clone());
        let _ = presence::save_descriptor(self.store.as_ref(), &descriptor).await;

        let store = self.store.clone();
        let conn_id = descriptor.id.clone();
        let retention = self.config.descriptor_retention;
        tokio::spawn(async move {
            let _ = presence::retire_descriptor(store.as_ref(), &conn_id, retention).await;
        });

        info!(
            user_id = descriptor.uid,
            conn_id = %descriptor.id,
            connections = self.registry.len(),
            "connection removed"
        );
        true
    }

    /// Close the socket off the event path. A peer that never finishes the
    /// close handshake is abandoned after `transport_timeout`.
    fn spawn_transport_close(&self, conn: Arc<LocalConnection>) {
        let limit = self.config.transport_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(limit, conn.duplex().close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(conn_id = %conn.id(), "transport close: {}", e),
                Err(_) => warn!(conn_id = %conn.id(), "transport close timed out"),
            }
        });
    }
}
