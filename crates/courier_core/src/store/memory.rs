use super::{CoordinationStore, StoreResult};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Minimum gap between full scans for expired keys.
const PURGE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Inner {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    sorted: HashMap<String, HashMap<String, i64>>,
    sets: HashMap<String, HashSet<String>>,
    expiries: HashMap<String, Instant>,
    next_purge: Option<Instant>,
}

impl Inner {
    fn remove_key(&mut self, key: &str) {
        self.expiries.remove(key);
        self.hashes.remove(key);
        self.lists.remove(key);
        self.sorted.remove(key);
        self.sets.remove(key);
    }

    /// Drop `key` if its TTL has elapsed.
    fn purge_if_expired(&mut self, key: &str, now: Instant) {
        if self.expiries.get(key).is_some_and(|deadline| now >= *deadline) {
            self.remove_key(key);
        }
    }

    /// Drop every key whose TTL has elapsed, at most once per `PURGE_INTERVAL`.
    /// Keys that are never read again still get reclaimed.
    fn purge_expired(&mut self, now: Instant) {
        if self.next_purge.is_some_and(|next| now < next) {
            return;
        }
        self.next_purge = Some(now + PURGE_INTERVAL);

        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove_key(&key);
        }
    }

    fn key_count(&self) -> usize {
        self.hashes.len() + self.lists.len() + self.sorted.len() + self.sets.len()
    }

    fn exists(&self, key: &str) -> bool {
        self.hashes.contains_key(key)
            || self.lists.contains_key(key)
            || self.sorted.contains_key(key)
            || self.sets.contains_key(key)
    }
}

/// Process-local store with the same semantics as the Redis backend.
///
/// Used by tests and by single-node deployments that run without Redis.
/// Cloning is not supported; share it behind an `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, key: &str) -> StoreResult<MutexGuard<'_, Inner>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Backend("Failed to lock in-memory store".to_string()))?;
        let now = Instant::now();
        inner.purge_if_expired(key, now);
        inner.purge_expired(now);
        Ok(inner)
    }

    /// Number of keys currently held, expired or not. Test helper.
    pub fn key_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.key_count()).unwrap_or(0)
    }

    /// Remaining time to live of a key, if one is set. Test helper.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let inner = self.lock(key).ok()?;
        inner
            .expiries
            .get(key)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Number of entries in a list. Test helper.
    pub fn list_len(&self, key: &str) -> usize {
        self.lock(key)
            .map(|inner| inner.lists.get(key).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// All `(member, score)` pairs of a sorted set, lowest score first. Test helper.
    pub fn sorted_entries(&self, key: &str) -> Vec<(String, i64)> {
        let Ok(inner) = self.lock(key) else {
            return Vec::new();
        };
        let mut entries: Vec<(String, i64)> = inner
            .sorted
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        let mut inner = self.lock(key)?;
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let inner = self.lock(key)?;
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.lock(key)?;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_exists(&self, key: &str, field: &str) -> StoreResult<bool> {
        let inner = self.lock(key)?;
        Ok(inner
            .hashes
            .get(key)
            .is_some_and(|hash| hash.contains_key(field)))
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut inner = self.lock(key)?;
        let Some(hash) = inner.hashes.get_mut(key) else {
            return Ok(false);
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            inner.hashes.remove(key);
            inner.expiries.remove(key);
        }
        Ok(removed)
    }

    async fn list_push(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.lock(key)?;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.lock(key)?;
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(None);
        };
        let value = list.pop_front();
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(value)
    }

    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> StoreResult<()> {
        let mut inner = self.lock(key)?;
        inner
            .sorted
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut inner = self.lock(key)?;
        if let Some(set) = inner.sorted.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                inner.sorted.remove(key);
            }
        }
        Ok(())
    }

    async fn sorted_range_by_recency(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        let inner = self.lock(key)?;
        let Some(set) = inner.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(&String, &i64)> = set.iter().collect();
        members.sort_by(|a, b| b.1.cmp(a.1).then_with(|| b.0.cmp(a.0)));
        Ok(members
            .into_iter()
            .take(limit)
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn sorted_pop_due(&self, key: &str, max_score: i64) -> StoreResult<Option<String>> {
        // The whole find-and-remove runs under one lock, which is what makes
        // it atomic for concurrent callers.
        let mut inner = self.lock(key)?;
        let Some(set) = inner.sorted.get_mut(key) else {
            return Ok(None);
        };
        let due = set
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(member, _)| member.clone());
        if let Some(member) = &due {
            set.remove(member);
            if set.is_empty() {
                inner.sorted.remove(key);
            }
        }
        Ok(due)
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut inner = self.lock(key)?;
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut inner = self.lock(key)?;
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                inner.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let inner = self.lock(key)?;
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut inner = self.lock(key)?;
        if inner.exists(key) {
            inner
                .expiries
                .insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn list_is_fifo() {
        let store = MemoryStore::new();
        store.list_push("q", "a").await.unwrap();
        store.list_push("q", "b").await.unwrap();
        assert_eq!(store.list_pop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.list_pop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.list_pop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn recency_range_is_capped_and_newest_first() {
        let store = MemoryStore::new();
        for i in 0..40 {
            store
                .sorted_add("conns", &format!("c{:02}", i), 1_000 + i)
                .await
                .unwrap();
        }
        let recent = store.sorted_range_by_recency("conns", 30).await.unwrap();
        assert_eq!(recent.len(), 30);
        assert_eq!(recent[0], "c39");
        assert_eq!(recent[29], "c10");
    }

    #[tokio::test]
    async fn pop_due_only_returns_due_entries_in_score_order() {
        let store = MemoryStore::new();
        store.sorted_add("delay", "late", 300).await.unwrap();
        store.sorted_add("delay", "early", 100).await.unwrap();
        store.sorted_add("delay", "mid", 200).await.unwrap();

        assert_eq!(store.sorted_pop_due("delay", 50).await.unwrap(), None);
        assert_eq!(
            store.sorted_pop_due("delay", 250).await.unwrap().as_deref(),
            Some("early")
        );
        assert_eq!(
            store.sorted_pop_due("delay", 250).await.unwrap().as_deref(),
            Some("mid")
        );
        assert_eq!(store.sorted_pop_due("delay", 250).await.unwrap(), None);
        assert_eq!(store.sorted_entries("delay"), vec![("late".to_string(), 300)]);
    }

    #[tokio::test]
    async fn concurrent_pop_due_never_double_claims() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..50 {
            store
                .sorted_add("delay", &format!("m{}", i), i)
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(member) = store.sorted_pop_due("delay", i64::MAX).await.unwrap() {
                    claimed.push(member);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 50);
    }

    #[tokio::test]
    async fn expired_keys_disappear() {
        let store = MemoryStore::new();
        store
            .hash_set_all("h", &[("id".to_string(), "c1".to_string())])
            .await
            .unwrap();
        store.expire("h", Duration::from_millis(10)).await.unwrap();
        assert!(store.ttl("h").is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.hash_get_all("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_keys_are_reclaimed_without_being_read() {
        let store = MemoryStore::new();
        for i in 0..1000 {
            let key = format!("ws_user_info:c{}", i);
            store
                .hash_set_all(&key, &[("id".to_string(), format!("c{}", i))])
                .await
                .unwrap();
            store.expire(&key, Duration::from_millis(1)).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        store.set_add("ws_user_online_list", "1").await.unwrap();

        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn hash_delete_reports_presence() {
        let store = MemoryStore::new();
        store.hash_set("ack", "m1", "1").await.unwrap();
        assert!(store.hash_exists("ack", "m1").await.unwrap());
        assert!(store.hash_delete("ack", "m1").await.unwrap());
        assert!(!store.hash_delete("ack", "m1").await.unwrap());
        assert!(!store.hash_exists("ack", "m1").await.unwrap());
    }
}
