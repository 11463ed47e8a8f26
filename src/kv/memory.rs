//! In-process key-value provider
//!
//! Keeps everything in maps behind a single mutex. State is not shared between
//! processes, so this provider only suits single-instance runs and tests.
//! Expirations are not enforced.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use super::KeyValueStore;
use crate::error::{MailroomError, MailroomResult};

#[derive(Debug, Default)]
struct State {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn ping(&self) -> MailroomResult<()> {
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> MailroomResult<()> {
        self.state
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> MailroomResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> MailroomResult<()> {
        let mut state = self.state.lock();
        if let Some(hash) = state.hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                state.hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn hexists(&self, key: &str, field: &str) -> MailroomResult<bool> {
        Ok(self
            .state
            .lock()
            .hashes
            .get(key)
            .is_some_and(|h| h.contains_key(field)))
    }

    async fn hgetall(&self, key: &str) -> MailroomResult<HashMap<String, String>> {
        Ok(self
            .state
            .lock()
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> MailroomResult<i64> {
        let mut state = self.state.lock();
        let slot = state
            .hashes
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert_with(|| "0".to_string());
        let current: i64 = slot.parse().map_err(|_| {
            MailroomError::KeyValueError(format!("hash value is not an integer: {slot}"))
        })?;
        let updated = current + delta;
        *slot = updated.to_string();
        Ok(updated)
    }

    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> MailroomResult<f64> {
        let mut state = self.state.lock();
        let slot = state
            .hashes
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert_with(|| "0".to_string());
        let current: f64 = slot.parse().map_err(|_| {
            MailroomError::KeyValueError(format!("hash value is not a float: {slot}"))
        })?;
        let updated = current + delta;
        *slot = updated.to_string();
        Ok(updated)
    }

    async fn sadd(&self, key: &str, member: &str) -> MailroomResult<()> {
        self.state
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> MailroomResult<()> {
        let mut state = self.state.lock();
        if let Some(set) = state.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                state.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> MailroomResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn capped_zadd(
        &self,
        key: &str,
        member: &str,
        score: f64,
        cap: usize,
        _expire: Duration,
    ) -> MailroomResult<()> {
        let mut state = self.state.lock();
        let zset = state.zsets.entry(key.to_string()).or_default();
        zset.insert(member.to_string(), score);

        if zset.len() > cap {
            let mut ranked: Vec<(String, f64)> =
                zset.iter().map(|(m, s)| (m.clone(), *s)).collect();
            ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            let excess = ranked.len() - cap;
            for (member, _) in ranked.into_iter().take(excess) {
                zset.remove(&member);
            }
        }
        Ok(())
    }

    async fn zrange_with_scores(&self, key: &str) -> MailroomResult<Vec<(String, f64)>> {
        let mut members: Vec<(String, f64)> = self
            .state
            .lock()
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_counters() {
        let store = MemoryStore::new();
        assert_eq!(store.hincr_by("stats", "calls", 1).await.unwrap(), 1);
        assert_eq!(store.hincr_by("stats", "calls", 2).await.unwrap(), 3);
        let total = store.hincr_by_float("stats", "time", 0.5).await.unwrap();
        assert!((total - 0.5).abs() < f64::EPSILON);
        assert_eq!(
            store.hget("stats", "calls").await.unwrap().as_deref(),
            Some("3")
        );
    }

    #[tokio::test]
    async fn test_hdel_and_exists() {
        let store = MemoryStore::new();
        store.hset("nodes", "mailroom:a", "now").await.unwrap();
        assert!(store.hexists("nodes", "mailroom:a").await.unwrap());
        store.hdel("nodes", "mailroom:a").await.unwrap();
        assert!(!store.hexists("nodes", "mailroom:a").await.unwrap());
        assert!(store.hgetall("nodes").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capped_zadd_keeps_highest_scores() {
        let store = MemoryStore::new();
        for i in 0..15 {
            store
                .capped_zadd("recent", &format!("m{i}"), i as f64, 10, Duration::from_secs(60))
                .await
                .unwrap();
        }
        let members = store.zrange_with_scores("recent").await.unwrap();
        assert_eq!(members.len(), 10);
        assert_eq!(members[0].0, "m5");
        assert_eq!(members[9].0, "m14");
    }

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryStore::new();
        store.sadd("orgs", "2").await.unwrap();
        store.sadd("orgs", "1").await.unwrap();
        store.sadd("orgs", "2").await.unwrap();
        assert_eq!(store.smembers("orgs").await.unwrap(), vec!["1", "2"]);
        store.srem("orgs", "1").await.unwrap();
        assert_eq!(store.smembers("orgs").await.unwrap(), vec!["2"]);
    }
}
