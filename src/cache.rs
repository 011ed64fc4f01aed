//! Size- and time-bounded memoization cache.
//!
//! `ExpiringCache` backs the client's "select object by id" path so that
//! repeated lookups of the same identifier within the expiration window do
//! not cost a round trip. Entries expire individually; when the live entry
//! count exceeds `max_size`, the least-recently-accessed entries are evicted.
//!
//! Every `get`/`set` runs a cleanup pass. A background sweeper task can be
//! attached with [`ExpiringCache::spawn_sweeper`]; it sleeps until the
//! earliest remaining deadline, so idle caches shed expired entries too.
//!
//! Time is measured with `tokio::time::Instant`, which lets tests drive
//! expiry with `tokio::time::pause()`/`advance()`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Sweeper wake interval when the cache holds no entries.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    accessed_at: Instant,
    expires_at: Instant,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
}

/// A mapping whose entries vanish after a deadline or when capacity is exceeded.
///
/// All operations take `&self`; a single mutex serializes them, so the cache
/// can be shared between tasks behind an `Arc`.
pub struct ExpiringCache<K, V> {
    max_size: usize,
    default_timeout: Duration,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a cache holding at most `max_size` entries, each living for
    /// `default_timeout` unless set with an explicit timeout.
    pub fn new(max_size: usize, default_timeout: Duration) -> Self {
        ExpiringCache {
            max_size,
            default_timeout,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        // A panic while holding the lock cannot leave an entry half-written,
        // so a poisoned guard is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the cached value, or `None` if the key is absent or expired.
    /// A hit bumps the entry's access time.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();
        let value = match inner.entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.accessed_at = now;
                Some(entry.value.clone())
            }
            _ => None,
        };
        self.cleanup_locked(&mut inner, now);
        value
    }

    /// Stores `value` under `key` with the default timeout, replacing any
    /// existing entry.
    pub fn set(&self, key: K, value: V) {
        self.set_with_timeout(key, value, self.default_timeout);
    }

    /// Stores `value` under `key`, expiring after `timeout`.
    pub fn set_with_timeout(&self, key: K, value: V, timeout: Duration) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                accessed_at: now,
                expires_at: now + timeout,
            },
        );
        self.cleanup_locked(&mut inner, now);
    }

    /// Removes `key`, returning its value if it was live.
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner
            .entries
            .remove(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value)
    }

    /// Returns how long ago the live entry for `key` was inserted.
    pub fn age(&self, key: &K) -> Option<Duration> {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| now.duration_since(e.inserted_at))
    }

    /// Number of entries currently stored (expired entries not yet swept
    /// are counted until the next cleanup pass).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Evicts expired entries, then trims to `max_size` by access time.
    ///
    /// Returns the earliest remaining expiry deadline, if any.
    pub fn cleanup(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut inner = self.lock();
        self.cleanup_locked(&mut inner, now)
    }

    fn cleanup_locked(&self, inner: &mut Inner<K, V>, now: Instant) -> Option<Instant> {
        inner.entries.retain(|_, e| e.expires_at > now);

        let overflow = inner.entries.len().saturating_sub(self.max_size);
        if overflow > 0 {
            let mut by_access: Vec<(Instant, K)> = inner
                .entries
                .iter()
                .map(|(k, e)| (e.accessed_at, k.clone()))
                .collect();
            by_access.sort_by_key(|(accessed, _)| *accessed);
            for (_, key) in by_access.into_iter().take(overflow) {
                inner.entries.remove(&key);
            }
        }

        inner.entries.values().map(|e| e.expires_at).min()
    }

    /// Memoizes `fetch` under `key`: returns the cached value on a hit, or
    /// awaits `fetch`, stores its successful result, and returns it.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let value = fetch().await?;
        self.set(key, value.clone());
        Ok(value)
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Starts a background task that sweeps expired entries as their
    /// deadlines pass. The task holds only a weak reference and exits once
    /// the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let next = match weak.upgrade() {
                    Some(cache) => cache.cleanup(),
                    None => return,
                };
                match next {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => tokio::time::sleep(IDLE_SWEEP_INTERVAL).await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn hit_returns_value_before_expiry() {
        let cache = ExpiringCache::new(10, Duration::from_secs(5));
        cache.set("a", 1);
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.get(&"a"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_absent_after_expiration() {
        let cache = ExpiringCache::new(10, Duration::from_secs(5));
        cache.set("a", 1);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty(), "expired entry should be swept on lookup");
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_evicts_least_recently_accessed() {
        let cache = ExpiringCache::new(3, Duration::from_secs(60));
        cache.set("a", 1);
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("b", 2);
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("c", 3);
        tokio::time::advance(Duration::from_millis(10)).await;
        // Touch "a" so "b" becomes the least recently accessed.
        assert_eq!(cache.get(&"a"), Some(1));
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("d", 4);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.get(&"d"), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn inserting_n_plus_one_keys_evicts_exactly_one() {
        let cache = ExpiringCache::new(4, Duration::from_secs(60));
        for i in 0..5 {
            cache.set(i, i * 10);
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.get(&0), None, "oldest entry should be evicted");
    }

    #[tokio::test(start_paused = true)]
    async fn set_overwrites_and_restamps() {
        let cache = ExpiringCache::new(10, Duration::from_secs(5));
        cache.set("a", 1);
        tokio::time::advance(Duration::from_secs(4)).await;
        cache.set("a", 2);
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.get(&"a"), Some(2));
        assert_eq!(cache.age(&"a"), Some(Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_reports_earliest_deadline() {
        let cache = ExpiringCache::new(10, Duration::from_secs(30));
        assert!(cache.cleanup().is_none());
        let start = Instant::now();
        cache.set_with_timeout("short", 1, Duration::from_secs(2));
        cache.set("long", 2);
        assert_eq!(cache.cleanup(), Some(start + Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn get_or_try_insert_with_fetches_once() {
        let cache = ExpiringCache::new(10, Duration::from_secs(30));
        let mut calls = 0;
        for _ in 0..3 {
            let v: Result<i32, ()> = cache
                .get_or_try_insert_with("k", || {
                    calls += 1;
                    async { Ok(7) }
                })
                .await;
            assert_eq!(v, Ok(7));
        }
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_is_not_cached() {
        let cache: ExpiringCache<&str, i32> = ExpiringCache::new(10, Duration::from_secs(30));
        let r: Result<i32, &str> = cache
            .get_or_try_insert_with("k", || async { Err("boom") })
            .await;
        assert_eq!(r, Err("boom"));
        assert!(cache.get(&"k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_expired_entries_without_lookups() {
        let cache = Arc::new(ExpiringCache::new(10, Duration::from_secs(2)));
        cache.set("a", 1);
        let handle = cache.spawn_sweeper();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(cache.len(), 0);
        drop(cache);
        tokio::time::sleep(IDLE_SWEEP_INTERVAL * 2).await;
        assert!(handle.is_finished(), "sweeper should exit once the cache is dropped");
    }
}
