//! Presence records: descriptors, the online-user set and per-user
//! connection lists.

use crate::descriptor::ConnectionDescriptor;
use crate::error::Result;
use crate::store::{CoordinationStore, keys};
use futures::future::join_all;
use std::time::Duration;
use tracing::warn;

/// Most recent connections considered per user; older ids are ignored.
pub const MAX_LISTED_CONNECTIONS: usize = 30;

pub async fn save_descriptor(
    store: &dyn CoordinationStore,
    descriptor: &ConnectionDescriptor,
) -> Result<()> {
    store
        .hash_set_all(&keys::descriptor(&descriptor.id), &descriptor.to_fields())
        .await
        .inspect_err(|e| {
            warn!(conn_id = %descriptor.id, user_id = descriptor.uid, "save descriptor failed: {}", e)
        })?;
    Ok(())
}

/// Fetch a descriptor. `Ok(None)` when the record does not exist (never
/// written, or expired).
pub async fn load_descriptor(
    store: &dyn CoordinationStore,
    conn_id: &str,
) -> Result<Option<ConnectionDescriptor>> {
    let key = keys::descriptor(conn_id);
    let fields = store.hash_get_all(&key).await?;
    if fields.is_empty() {
        return Ok(None);
    }
    Ok(Some(ConnectionDescriptor::from_fields(&key, &fields)?))
}

/// Let the store drop a closed descriptor after `retention`.
pub async fn retire_descriptor(
    store: &dyn CoordinationStore,
    conn_id: &str,
    retention: Duration,
) -> Result<()> {
    store
        .expire(&keys::descriptor(conn_id), retention)
        .await
        .inspect_err(|e| warn!(conn_id = %conn_id, "retire descriptor failed: {}", e))?;
    Ok(())
}

pub async fn add_online_user(store: &dyn CoordinationStore, uid: i64) -> Result<()> {
    store
        .set_add(keys::ONLINE_USERS, &uid.to_string())
        .await
        .inspect_err(|e| warn!(user_id = uid, "add online user failed: {}", e))?;
    Ok(())
}

/// Users that have ever connected. Unparseable members are skipped.
pub async fn online_users(store: &dyn CoordinationStore) -> Result<Vec<i64>> {
    let members = store.set_members(keys::ONLINE_USERS).await?;
    Ok(members
        .into_iter()
        .filter_map(|raw| match raw.parse() {
            Ok(uid) => Some(uid),
            Err(_) => {
                warn!("ignoring malformed online user id: {}", raw);
                None
            }
        })
        .collect())
}

pub async fn add_user_connection(
    store: &dyn CoordinationStore,
    uid: i64,
    conn_id: &str,
    connect_time: i64,
) -> Result<()> {
    store
        .sorted_add(&keys::user_connections(uid), conn_id, connect_time)
        .await
        .inspect_err(|e| warn!(user_id = uid, conn_id = %conn_id, "add user connection failed: {}", e))?;
    Ok(())
}

pub async fn remove_user_connection(
    store: &dyn CoordinationStore,
    uid: i64,
    conn_id: &str,
) -> Result<()> {
    store
        .sorted_remove(&keys::user_connections(uid), conn_id)
        .await
        .inspect_err(|e| warn!(user_id = uid, conn_id = %conn_id, "remove user connection failed: {}", e))?;
    Ok(())
}

/// The user's most recent connection ids, newest first.
pub async fn user_connection_ids(store: &dyn CoordinationStore, uid: i64) -> Result<Vec<String>> {
    Ok(store
        .sorted_range_by_recency(&keys::user_connections(uid), MAX_LISTED_CONNECTIONS)
        .await?)
}

/// Descriptors for the user's listed connections, fetched concurrently.
/// Ids whose descriptor is missing or unreadable are left out.
pub async fn user_descriptors(
    store: &dyn CoordinationStore,
    uid: i64,
) -> Result<Vec<ConnectionDescriptor>> {
    let ids = user_connection_ids(store, uid).await?;
    let lookups = ids.iter().map(|id| load_descriptor(store, id));
    let mut descriptors = Vec::with_capacity(ids.len());
    for (id, result) in ids.iter().zip(join_all(lookups).await) {
        match result {
            Ok(Some(descriptor)) => descriptors.push(descriptor),
            Ok(None) => {}
            Err(e) => warn!(user_id = uid, conn_id = %id, "load descriptor failed: {}", e),
        }
    }
    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn descriptor_round_trips_through_store() {
        let store = MemoryStore::new();
        let desc = ConnectionDescriptor::open("c1", 42, "127.0.0.1:10186");
        save_descriptor(&store, &desc).await.unwrap();

        assert_eq!(load_descriptor(&store, "c1").await.unwrap(), Some(desc));
        assert_eq!(load_descriptor(&store, "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn user_descriptors_skip_dangling_ids() {
        let store = MemoryStore::new();
        let desc = ConnectionDescriptor::open("c1", 42, "127.0.0.1:10186");
        save_descriptor(&store, &desc).await.unwrap();
        add_user_connection(&store, 42, "c1", 10).await.unwrap();
        add_user_connection(&store, 42, "gone", 20).await.unwrap();

        let found = user_descriptors(&store, 42).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "c1");
    }

    #[tokio::test]
    async fn online_users_ignore_garbage() {
        let store = MemoryStore::new();
        add_online_user(&store, 7).await.unwrap();
        store.set_add(keys::ONLINE_USERS, "not-a-number").await.unwrap();
        assert_eq!(online_users(&store).await.unwrap(), vec![7]);
    }
}
