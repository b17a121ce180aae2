//! Redis-backed coordination store shared by every node in the cluster.

use crate::config::Config;
use async_trait::async_trait;
use courier_core::store::{CoordinationStore, StoreResult};
use courier_core::{MemoryStore, StoreError};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Claims the lowest-scored member with score <= ARGV[1] in one step, so two
/// nodes polling the same delay queue never get the same entry.
const POP_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #due > 0 then
  redis.call('ZREM', KEYS[1], due[1])
  return due[1]
end
return false
"#;

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Redis when `REDIS_URL` is set, otherwise a process-local store.
pub async fn build_store(config: &Config) -> StoreResult<Arc<dyn CoordinationStore>> {
    match config.redis_url.as_deref() {
        Some(url) => Ok(Arc::new(RedisStore::connect(url).await?)),
        None => {
            warn!("REDIS_URL not set: using in-memory store, cross-node delivery is disabled");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub struct RedisStore {
    conn: ConnectionManager,
    pop_due: redis::Script,
}

impl RedisStore {
    /// Connect to `url` and verify the server answers.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(backend)?;
        let mut conn = client.get_connection_manager().await.map_err(backend)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        info!("Connected to Redis coordination store");
        Ok(Self {
            conn,
            pop_due: redis::Script::new(POP_DUE_SCRIPT),
        })
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields)
            .await
            .map_err(backend)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(backend)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(backend)
    }

    async fn hash_exists(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        conn.hexists(key, field).await.map_err(backend)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(key, field).await.map_err(backend)?;
        Ok(removed > 0)
    }

    async fn list_push(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(key, value).await.map_err(backend)
    }

    async fn list_pop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.lpop(key, None::<NonZeroUsize>).await.map_err(backend)
    }

    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(backend)
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(key, member).await.map_err(backend)
    }

    async fn sorted_range_by_recency(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(limit - 1).unwrap_or(isize::MAX);
        let mut conn = self.conn.clone();
        conn.zrevrange(key, 0, stop).await.map_err(backend)
    }

    async fn sorted_pop_due(&self, key: &str, max_score: i64) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.pop_due
            .key(key)
            .arg(max_score)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await.map_err(backend)
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await.map_err(backend)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(backend)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let mut conn = self.conn.clone();
        conn.pexpire::<_, ()>(key, millis).await.map_err(backend)
    }
}
