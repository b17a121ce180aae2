//! Shared coordination store port.
//!
//! The store is the cluster's single source of truth for presence, queues
//! and ack state. Every node talks to the same store; apart from
//! [`CoordinationStore::sorted_pop_due`], no operation is assumed to be
//! atomic across calls.
//!
//! Key layout:
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `ws_user_info:{conn_id}` | hash | connection descriptor |
//! | `ws_user_online_list` | set | user ids that have connected |
//! | `ws_user_connection_list:{uid}` | sorted set | conn ids scored by connect time |
//! | `ws_user_msg_queue:{uid}` | list | pending messages (FIFO) |
//! | `ws_user_msg_delay_queue:{uid}` | sorted set | retry entries scored by due time (ms) |
//! | `ws_user_msg_send_ack_list:{uid}:{conn_id}` | hash | msg id → 1 while unacknowledged |

mod memory;

pub use memory::MemoryStore;

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Write every field of a hash, creating it if needed.
    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;

    /// All fields of a hash; empty when the key does not exist.
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn hash_exists(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// Remove a field. Returns whether it was present.
    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// Append to the tail of a list.
    async fn list_push(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Pop from the head of a list without blocking.
    async fn list_pop(&self, key: &str) -> StoreResult<Option<String>>;

    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> StoreResult<()>;

    async fn sorted_remove(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Up to `limit` members, highest score first.
    async fn sorted_range_by_recency(&self, key: &str, limit: usize) -> StoreResult<Vec<String>>;

    /// Atomically remove and return the lowest-scored member whose score is
    /// `<= max_score`. Two callers never receive the same member.
    async fn sorted_pop_due(&self, key: &str, max_score: i64) -> StoreResult<Option<String>>;

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Let the store delete `key` after `ttl`.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;
}

pub mod keys {
    //! Key builders for the layout documented on the parent module.

    pub const ONLINE_USERS: &str = "ws_user_online_list";

    pub fn descriptor(conn_id: &str) -> String {
        format!("ws_user_info:{}", conn_id)
    }

    pub fn user_connections(uid: i64) -> String {
        format!("ws_user_connection_list:{}", uid)
    }

    pub fn message_queue(uid: i64) -> String {
        format!("ws_user_msg_queue:{}", uid)
    }

    pub fn delay_queue(uid: i64) -> String {
        format!("ws_user_msg_delay_queue:{}", uid)
    }

    pub fn ack_record(uid: i64, conn_id: &str) -> String {
        format!("ws_user_msg_send_ack_list:{}:{}", uid, conn_id)
    }
}
