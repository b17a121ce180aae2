//! Per-user message queue, delayed-retry queue and ack records.
//!
//! An ack record entry means "delivered, not yet acknowledged". It is
//! written when a message that still has retries left is handed to a
//! connection, and removed when the client acknowledges it.

use crate::error::Result;
use crate::message::Message;
use crate::store::{CoordinationStore, keys};
use std::time::Duration;
use tracing::{debug, info, warn};

pub async fn enqueue(store: &dyn CoordinationStore, message: &Message) -> Result<()> {
    let key = keys::message_queue(message.uid);
    let payload = message.to_json()?;
    store
        .list_push(&key, &payload)
        .await
        .inspect_err(|e| warn!(user_id = message.uid, msg_id = %message.id, "enqueue message failed: {}", e))?;
    info!(user_id = message.uid, msg_id = %message.id, "message queued");
    Ok(())
}

/// Pop the oldest queued message for a user, if any.
///
/// A payload that does not parse is consumed and reported as an error so the
/// caller backs off instead of spinning on it.
pub async fn pop_message(store: &dyn CoordinationStore, uid: i64) -> Result<Option<Message>> {
    let key = keys::message_queue(uid);
    let Some(raw) = store.list_pop(&key).await? else {
        return Ok(None);
    };
    let message = Message::from_json(&raw).inspect_err(|e| {
        warn!(user_id = uid, payload = %raw, "dropping malformed queued message: {}", e)
    })?;
    Ok(Some(message))
}

/// Schedule a redelivery check for `message` (which must carry its target
/// `conn_id`) `delay` from now.
pub async fn schedule_retry(
    store: &dyn CoordinationStore,
    message: &Message,
    delay: Duration,
) -> Result<()> {
    let key = keys::delay_queue(message.uid);
    let due = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
    store
        .sorted_add(&key, &message.to_json()?, due)
        .await
        .inspect_err(|e| {
            warn!(user_id = message.uid, conn_id = %message.conn_id, msg_id = %message.id, "schedule retry failed: {}", e)
        })?;
    debug!(user_id = message.uid, conn_id = %message.conn_id, msg_id = %message.id, retries = message.retries, "retry scheduled");
    Ok(())
}

/// Claim the earliest retry entry that is due now.
pub async fn pop_due_retry(store: &dyn CoordinationStore, uid: i64) -> Result<Option<Message>> {
    let key = keys::delay_queue(uid);
    let now = chrono::Utc::now().timestamp_millis();
    let Some(raw) = store.sorted_pop_due(&key, now).await? else {
        return Ok(None);
    };
    let message = Message::from_json(&raw).inspect_err(|e| {
        warn!(user_id = uid, payload = %raw, "dropping malformed retry entry: {}", e)
    })?;
    Ok(Some(message))
}

pub async fn mark_unacked(
    store: &dyn CoordinationStore,
    uid: i64,
    conn_id: &str,
    msg_id: &str,
) -> Result<()> {
    store
        .hash_set(&keys::ack_record(uid, conn_id), msg_id, "1")
        .await?;
    Ok(())
}

/// Record an acknowledgement. Acknowledging twice is the same as once.
/// Returns whether an outstanding record was cleared.
pub async fn acknowledge(
    store: &dyn CoordinationStore,
    uid: i64,
    conn_id: &str,
    msg_id: &str,
) -> Result<bool> {
    Ok(store
        .hash_delete(&keys::ack_record(uid, conn_id), msg_id)
        .await?)
}

pub async fn is_unacked(
    store: &dyn CoordinationStore,
    uid: i64,
    conn_id: &str,
    msg_id: &str,
) -> Result<bool> {
    Ok(store
        .hash_exists(&keys::ack_record(uid, conn_id), msg_id)
        .await?)
}
