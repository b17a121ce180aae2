//! Startup sweep of presence records left behind by a previous run.
//!
//! A node that crashed never tore its connections down, so their
//! descriptors still read as open. Before the coordinator accepts events
//! the sweep closes those, and prunes user connection lists of ids whose
//! descriptor expired or was closed long ago.

use crate::config::DeliveryConfig;
use crate::error::Result;
use crate::presence;
use crate::store::CoordinationStore;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connection ids inspected.
    pub scanned: usize,
    /// Open descriptors owned by this node that were marked closed.
    pub closed: usize,
    /// Ids removed from user connection lists.
    pub dropped: usize,
    /// Lookups or writes that failed and were skipped.
    pub failed: usize,
}

enum Outcome {
    Kept,
    Closed,
    Dropped,
    Failed,
}

/// Sweep every online user's connection list.
///
/// Only failing to read the online-user set is an error; everything past
/// that is logged, counted and skipped.
pub async fn sweep_stale(
    store: &dyn CoordinationStore,
    node: &str,
    config: &DeliveryConfig,
) -> Result<SweepReport> {
    let users = presence::online_users(store).await?;
    let concurrency = config.sweep_concurrency.max(1);
    let mut report = SweepReport::default();

    let listings: Vec<_> = stream::iter(users)
        .map(|uid| async move { (uid, presence::user_connection_ids(store, uid).await) })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut pairs = Vec::new();
    for (uid, listing) in listings {
        match listing {
            Ok(ids) => pairs.extend(ids.into_iter().map(|id| (uid, id))),
            Err(e) => {
                warn!(user_id = uid, "sweep: list connections failed: {}", e);
                report.failed += 1;
            }
        }
    }
    report.scanned = pairs.len();

    let outcomes: Vec<Outcome> = stream::iter(pairs)
        .map(|(uid, conn_id)| sweep_connection(store, node, config, uid, conn_id))
        .buffer_unordered(concurrency)
        .collect()
        .await;

    for outcome in outcomes {
        match outcome {
            Outcome::Kept => {}
            Outcome::Closed => report.closed += 1,
            Outcome::Dropped => report.dropped += 1,
            Outcome::Failed => report.failed += 1,
        }
    }

    info!(
        node = %node,
        scanned = report.scanned,
        closed = report.closed,
        dropped = report.dropped,
        failed = report.failed,
        "stale sweep finished"
    );
    Ok(report)
}

async fn sweep_connection(
    store: &dyn CoordinationStore,
    node: &str,
    config: &DeliveryConfig,
    uid: i64,
    conn_id: String,
) -> Outcome {
    let descriptor = match presence::load_descriptor(store, &conn_id).await {
        Ok(descriptor) => descriptor,
        Err(e) => {
            warn!(user_id = uid, conn_id = %conn_id, "sweep: load descriptor failed: {}", e);
            return Outcome::Failed;
        }
    };

    let Some(mut descriptor) = descriptor else {
        debug!(user_id = uid, conn_id = %conn_id, "sweep: dropping id without descriptor");
        return drop_id(store, uid, &conn_id).await;
    };

    if !descriptor.closed {
        if !descriptor.is_owned_by(node) {
            return Outcome::Kept;
        }
        descriptor.mark_closed();
        if presence::save_descriptor(store, &descriptor).await.is_err() {
            return Outcome::Failed;
        }
        let _ = presence::retire_descriptor(store, &conn_id, config.descriptor_retention).await;
        debug!(user_id = uid, conn_id = %conn_id, "sweep: closed orphaned connection");
        return Outcome::Closed;
    }

    let age = chrono::Utc::now().timestamp() - descriptor.disconnect_time;
    if descriptor.disconnect_time > 0 && age > config.stale_after.as_secs() as i64 {
        debug!(user_id = uid, conn_id = %conn_id, "sweep: dropping long-closed connection");
        return drop_id(store, uid, &conn_id).await;
    }
    Outcome::Kept
}

async fn drop_id(store: &dyn CoordinationStore, uid: i64, conn_id: &str) -> Outcome {
    match presence::remove_user_connection(store, uid, conn_id).await {
        Ok(()) => Outcome::Dropped,
        Err(_) => Outcome::Failed,
    }
}
