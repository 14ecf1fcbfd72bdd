//! In-process key/value store with per-key TTL.

use std::collections::HashMap as StdHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }
}

/// In-memory KV store with per-key TTL.
///
/// Every mutation happens under one write lock, so `take` is an atomic
/// check-and-remove: when several callers race on the same key exactly one
/// of them receives the value.
#[derive(Clone)]
pub struct KvStore<V> {
    map: Arc<parking_lot::RwLock<StdHashMap<String, Entry<V>>>>,
}

impl<V> Default for KvStore<V> {
    fn default() -> Self { Self { map: Arc::new(parking_lot::RwLock::new(StdHashMap::new())) } }
}

impl<V> KvStore<V> {
    /// Insert only if the key is absent (or present but expired). Returns false when a live key exists.
    pub fn set_if_absent(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) -> bool {
        let key = key.into();
        let now = Instant::now();
        let mut w = self.map.write();
        if let Some(ent) = w.get(&key) {
            if !ent.expired(now) { return false; }
        }
        w.insert(key, Entry { value, expires_at: ttl.map(|d| now + d) });
        true
    }

    /// Remove and return a live key in one step. Expired keys are dropped and reported as absent.
    pub fn take(&self, key: &str) -> Option<V> {
        let ent = self.map.write().remove(key)?;
        if ent.expired(Instant::now()) { return None; }
        Some(ent.value)
    }

    /// Number of stored keys, including expired ones not yet swept.
    pub fn len(&self) -> usize { self.map.read().len() }
    pub fn is_empty(&self) -> bool { self.map.read().is_empty() }

    /// Remove expired keys. Returns number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut w = self.map.write();
        let before = w.len();
        w.retain(|_, v| !v.expired(now));
        before - w.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_is_single_use() {
        let kv: KvStore<String> = KvStore::default();
        assert!(kv.set_if_absent("k", "v".to_string(), Some(Duration::from_secs(60))));
        assert_eq!(kv.take("k").as_deref(), Some("v"));
        assert_eq!(kv.take("k"), None);
        assert!(kv.is_empty());
    }

    #[test]
    fn expired_keys_are_invisible_and_swept() {
        let kv: KvStore<u32> = KvStore::default();
        kv.set_if_absent("short", 1, Some(Duration::from_millis(20)));
        kv.set_if_absent("long", 2, Some(Duration::from_secs(60)));
        kv.set_if_absent("forever", 3, None);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(kv.len(), 3);
        assert_eq!(kv.sweep(), 1);
        assert_eq!(kv.take("long"), Some(2));
        assert_eq!(kv.take("forever"), Some(3));

        kv.set_if_absent("gone", 4, Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(kv.take("gone"), None);
        assert!(kv.is_empty());
    }

    #[test]
    fn set_if_absent_respects_live_keys() {
        let kv: KvStore<u32> = KvStore::default();
        assert!(kv.set_if_absent("k", 1, Some(Duration::from_secs(5))));
        assert!(!kv.set_if_absent("k", 2, Some(Duration::from_secs(5))));
        assert_eq!(kv.take("k"), Some(1));
    }

    #[test]
    fn expired_key_can_be_replaced() {
        let kv: KvStore<u32> = KvStore::default();
        kv.set_if_absent("k", 1, Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(25));
        assert!(kv.set_if_absent("k", 2, Some(Duration::from_secs(5))));
        assert_eq!(kv.take("k"), Some(2));
    }

    #[test]
    fn concurrent_take_has_one_winner() {
        let kv: KvStore<u32> = KvStore::default();
        kv.set_if_absent("race", 7, Some(Duration::from_secs(60)));
        let winners: usize = (0..16)
            .map(|_| {
                let kv = kv.clone();
                std::thread::spawn(move || kv.take("race").is_some())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap_or(false) as usize)
            .sum();
        assert_eq!(winners, 1);
    }
}
