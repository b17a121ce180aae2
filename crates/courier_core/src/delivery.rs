//! Per-connection delivery loops.
//!
//! Every registered connection runs four tasks:
//!
//! - **heartbeat**: probes liveness and asks the coordinator to remove the
//!   connection once the probe fails.
//! - **receive**: reads client frames and clears ack records.
//! - **push**: drains the owning user's queue and fans each message out to
//!   all of that user's open connections, wherever they live.
//! - **ack-retry**: claims due entries from the user's delay queue and
//!   redelivers messages that were never acknowledged.
//!
//! The loops stop on their own once the connection is torn down. The push
//! and ack-retry loops also stop as soon as the transport reports a failure,
//! so they never claim work for a socket that is already gone.

use crate::config::DeliveryConfig;
use crate::coordinator::CoordinatorHandle;
use crate::descriptor::ConnectionDescriptor;
use crate::error::Result;
use crate::forward::Forwarder;
use crate::message::{InboundFrame, Message};
use crate::presence;
use crate::queue;
use crate::registry::LocalConnection;
use crate::store::CoordinationStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a delivery for one connection has to go.
enum Target {
    Local(Arc<LocalConnection>),
    Remote(String),
    Gone,
}

#[derive(Clone)]
pub struct DeliveryEngine {
    store: Arc<dyn CoordinationStore>,
    forwarder: Arc<dyn Forwarder>,
    coordinator: CoordinatorHandle,
    node: String,
    config: Arc<DeliveryConfig>,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        forwarder: Arc<dyn Forwarder>,
        coordinator: CoordinatorHandle,
        node: String,
        config: Arc<DeliveryConfig>,
    ) -> Self {
        Self {
            store,
            forwarder,
            coordinator,
            node,
            config,
        }
    }

    pub fn spawn_loops(&self, conn: Arc<LocalConnection>) {
        tokio::spawn(self.clone().heartbeat_loop(conn.clone()));
        tokio::spawn(self.clone().receive_loop(conn.clone()));
        tokio::spawn(self.clone().push_loop(conn.clone()));
        tokio::spawn(self.clone().ack_retry_loop(conn));
    }

    async fn heartbeat_loop(self, conn: Arc<LocalConnection>) {
        loop {
            tokio::time::sleep(self.config.heartbeat_interval).await;
            if !conn.is_open() {
                break;
            }
            if !conn.duplex().is_connected().await {
                info!(user_id = conn.uid(), conn_id = %conn.id(), "heartbeat failed, removing connection");
                if let Err(e) = self.coordinator.remove(conn.clone()).await {
                    warn!(conn_id = %conn.id(), "remove after heartbeat failure: {}", e);
                }
                break;
            }
        }
        debug!(conn_id = %conn.id(), "heartbeat loop stopped");
    }

    async fn receive_loop(self, conn: Arc<LocalConnection>) {
        loop {
            let raw = match conn.duplex().receive().await {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(conn_id = %conn.id(), "receive loop stopped: {}", e);
                    break;
                }
            };

            let frame = match InboundFrame::parse(&raw) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(user_id = conn.uid(), conn_id = %conn.id(), "ignoring malformed frame: {}", e);
                    continue;
                }
            };

            if let Some(msg_id) = frame.ack_id() {
                let store = self.store.clone();
                let uid = conn.uid();
                let conn_id = conn.id().to_string();
                let msg_id = msg_id.to_string();
                tokio::spawn(async move {
                    match queue::acknowledge(store.as_ref(), uid, &conn_id, &msg_id).await {
                        Ok(_) => debug!(user_id = uid, conn_id = %conn_id, msg_id = %msg_id, "message acknowledged"),
                        Err(e) => warn!(user_id = uid, conn_id = %conn_id, msg_id = %msg_id, "acknowledge failed: {}", e),
                    }
                });
            }
        }
    }

    async fn push_loop(self, conn: Arc<LocalConnection>) {
        while conn.is_live() {
            match queue::pop_message(self.store.as_ref(), conn.uid()).await {
                Ok(Some(message)) => {
                    tokio::spawn(self.clone().fan_out(message));
                }
                Ok(None) => tokio::time::sleep(self.config.queue_backoff).await,
                Err(e) => {
                    debug!(user_id = conn.uid(), "queue pop failed: {}", e);
                    tokio::time::sleep(self.config.queue_backoff).await;
                }
            }
        }
        debug!(conn_id = %conn.id(), "push loop stopped");
    }

    async fn ack_retry_loop(self, conn: Arc<LocalConnection>) {
        while conn.is_live() {
            match queue::pop_due_retry(self.store.as_ref(), conn.uid()).await {
                Ok(Some(message)) => {
                    tokio::spawn(self.clone().redeliver(message));
                }
                Ok(None) => tokio::time::sleep(self.config.queue_backoff).await,
                Err(e) => {
                    debug!(user_id = conn.uid(), "delay queue pop failed: {}", e);
                    tokio::time::sleep(self.config.queue_backoff).await;
                }
            }
        }
        debug!(conn_id = %conn.id(), "ack-retry loop stopped");
    }

    /// Deliver `message` to every open connection of its user.
    async fn fan_out(self, message: Message) {
        let descriptors = match presence::user_descriptors(self.store.as_ref(), message.uid).await {
            Ok(descriptors) => descriptors,
            Err(e) => {
                warn!(user_id = message.uid, msg_id = %message.id, "fan-out lookup failed: {}", e);
                return;
            }
        };

        for descriptor in descriptors.into_iter().filter(|d| !d.closed) {
            let engine = self.clone();
            let message = message.for_connection(&descriptor.id);
            tokio::spawn(async move {
                match engine.locate(&descriptor).await {
                    Ok(Target::Gone) => {
                        debug!(conn_id = %descriptor.id, node = %descriptor.node, "skipping stale connection");
                    }
                    Ok(target) => engine.deliver_tracked(target, message).await,
                    Err(e) => warn!(conn_id = %descriptor.id, "locate connection failed: {}", e),
                }
            });
        }
    }

    /// First delivery to one connection. Messages with retries left get an
    /// ack record and a delay-queue entry.
    async fn deliver_tracked(&self, target: Target, message: Message) {
        let store = self.store.as_ref();
        let tracked = message.retries > 0;
        if tracked {
            if let Err(e) = queue::mark_unacked(store, message.uid, &message.conn_id, &message.id).await {
                warn!(user_id = message.uid, conn_id = %message.conn_id, msg_id = %message.id, "mark unacked failed: {}", e);
            }
        }

        self.send(&target, &message).await;

        if tracked {
            let _ = queue::schedule_retry(store, &message, self.config.retry_delay).await;
        }
    }

    /// Handle one due delay-queue entry.
    async fn redeliver(self, message: Message) {
        let store = self.store.as_ref();
        let (uid, conn_id, msg_id) = (message.uid, message.conn_id.clone(), message.id.clone());

        match queue::is_unacked(store, uid, &conn_id, &msg_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(user_id = uid, conn_id = %conn_id, msg_id = %msg_id, "already acknowledged");
                return;
            }
            Err(e) => {
                warn!(user_id = uid, conn_id = %conn_id, msg_id = %msg_id, "ack lookup failed, rescheduling: {}", e);
                let _ = queue::schedule_retry(store, &message, self.config.retry_delay).await;
                return;
            }
        }

        if message.retries == 0 {
            debug!(user_id = uid, conn_id = %conn_id, msg_id = %msg_id, "retries exhausted, dropping message");
            self.clear_ack(uid, &conn_id, &msg_id).await;
            return;
        }

        let target = match self.locate_by_id(&conn_id).await {
            Ok(target) => target,
            Err(e) => {
                warn!(user_id = uid, conn_id = %conn_id, msg_id = %msg_id, "locate connection failed, rescheduling: {}", e);
                let _ = queue::schedule_retry(store, &message, self.config.retry_delay).await;
                return;
            }
        };
        if let Target::Gone = target {
            debug!(user_id = uid, conn_id = %conn_id, msg_id = %msg_id, "connection gone, dropping retry");
            self.clear_ack(uid, &conn_id, &msg_id).await;
            return;
        }

        let next = Message {
            retries: message.retries - 1,
            ..message
        };
        self.send(&target, &next).await;
        let _ = queue::schedule_retry(store, &next, self.config.retry_delay).await;
    }

    async fn clear_ack(&self, uid: i64, conn_id: &str, msg_id: &str) {
        if let Err(e) = queue::acknowledge(self.store.as_ref(), uid, conn_id, msg_id).await {
            warn!(user_id = uid, conn_id = %conn_id, msg_id = %msg_id, "clear ack record failed: {}", e);
        }
    }

    async fn send(&self, target: &Target, message: &Message) {
        match target {
            Target::Local(conn) => {
                if let Err(e) = conn.deliver(message).await {
                    warn!(user_id = message.uid, conn_id = %message.conn_id, msg_id = %message.id, "local delivery failed: {}", e);
                }
            }
            Target::Remote(node) => {
                match self.forwarder.forward_push(node, &message.conn_id, message).await {
                    Ok(()) => debug!(node = %node, conn_id = %message.conn_id, msg_id = %message.id, "message forwarded"),
                    Err(e) => warn!(node = %node, conn_id = %message.conn_id, msg_id = %message.id, "forward push failed: {}", e),
                }
            }
            Target::Gone => {}
        }
    }

    /// Route for a connection known from the user's connection list.
    async fn locate(&self, descriptor: &ConnectionDescriptor) -> Result<Target> {
        if let Some(conn) = self.coordinator.lookup(&descriptor.id).await? {
            return Ok(Target::Local(conn));
        }
        Ok(self.classify(Some(descriptor)))
    }

    /// Route for a connection known only by id.
    async fn locate_by_id(&self, conn_id: &str) -> Result<Target> {
        if let Some(conn) = self.coordinator.lookup(conn_id).await? {
            return Ok(Target::Local(conn));
        }
        let descriptor = presence::load_descriptor(self.store.as_ref(), conn_id).await?;
        Ok(self.classify(descriptor.as_ref()))
    }

    /// Classify a connection that is not in the local registry. One that
    /// claims this node is a leftover from a crashed or torn-down socket.
    fn classify(&self, descriptor: Option<&ConnectionDescriptor>) -> Target {
        match descriptor {
            Some(d) if !d.closed && !d.is_owned_by(&self.node) => Target::Remote(d.node.clone()),
            _ => Target::Gone,
        }
    }
}
