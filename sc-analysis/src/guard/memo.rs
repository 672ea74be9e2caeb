use crate::params::MemoConfig;
use anyhow::Error;
use log::debug;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoKey {
    pub dataset: String,
    pub function: String,
    pub args: String,
}

impl MemoKey {
    pub fn new(dataset: impl Into<String>, function: impl Into<String>, args: impl Into<String>) -> MemoKey {
        MemoKey {
            dataset: dataset.into(),
            function: function.into(),
            args: args.into(),
        }
    }
}

struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    inserted: Instant,
    last_access: Instant,
}

/// Memoized results keyed by `(dataset, function, arguments)`, with least-recently-used
/// eviction and a time-to-live. Shared between request handlers through `Arc`.
pub struct MemoCache {
    config: MemoConfig,
    entries: Mutex<HashMap<MemoKey, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoCache {
    pub fn new(config: MemoConfig) -> MemoCache {
        MemoCache {
            config,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<MemoKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &MemoKey) -> Option<Arc<T>> {
        let mut entries = self.entries();
        let now = Instant::now();
        let expired = match entries.get_mut(key) {
            Some(e) if now.duration_since(e.inserted) < self.config.ttl => {
                e.last_access = now;
                if let Ok(v) = e.value.clone().downcast::<T>() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(v);
                }
                false
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert<T: Any + Send + Sync>(&self, key: MemoKey, value: T) -> Arc<T> {
        let v = Arc::new(value);
        let now = Instant::now();
        let mut entries = self.entries();
        entries.insert(
            key,
            Entry {
                value: v.clone(),
                inserted: now,
                last_access: now,
            },
        );
        while entries.len() > self.config.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    debug!("evicting memo entry {}/{}", k.dataset, k.function);
                    entries.remove(&k);
                }
                None => break,
            }
        }
        v
    }

    /// Cached value, or compute and cache it. The computation runs without holding the
    /// cache lock; failures are not cached.
    pub fn get_or_try_insert<T, F>(&self, key: MemoKey, compute: F) -> Result<Arc<T>, Error>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, Error>,
    {
        if let Some(v) = self.get(&key) {
            return Ok(v);
        }
        let value = compute()?;
        Ok(self.insert(key, value))
    }

    /// Drop every entry of a dataset. Returns the number dropped.
    pub fn invalidate_dataset(&self, dataset: &str) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|k, _| k.dataset != dataset);
        let n = before - entries.len();
        debug!("invalidated {} memo entries of {}", n, dataset);
        n
    }

    /// Drop the entries of a dataset produced by the named functions.
    pub fn invalidate_functions(&self, dataset: &str, functions: &[&str]) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|k, _| k.dataset != dataset || !functions.contains(&k.function.as_str()));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since creation
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}

impl Default for MemoCache {
    fn default() -> Self {
        MemoCache::new(MemoConfig::default())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn key(ds: &str, f: &str, a: &str) -> MemoKey {
        MemoKey::new(ds, f, a)
    }

    #[test]
    fn test_get_or_insert() {
        let cache = MemoCache::default();
        let mut calls = 0;
        for _ in 0..3 {
            let v = cache
                .get_or_try_insert(key("d1", "top_genes", "0"), || {
                    calls += 1;
                    Ok(vec![1, 2, 3])
                })
                .unwrap();
            assert_eq!(*v, vec![1, 2, 3]);
        }
        assert_eq!(calls, 1);
        assert_eq!(cache.stats(), (2, 1));
        let failed: Result<Arc<u8>, Error> = cache.get_or_try_insert(key("d1", "boom", ""), || anyhow::bail!("no"));
        assert!(failed.is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lru_and_ttl() {
        let cache = MemoCache::new(MemoConfig {
            capacity: 2,
            ttl: Duration::from_secs(3600),
        });
        cache.insert(key("d", "f", "a"), 1u32);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(key("d", "f", "b"), 2u32);
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get::<u32>(&key("d", "f", "a")).is_some());
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(key("d", "f", "c"), 3u32);
        assert!(cache.get::<u32>(&key("d", "f", "b")).is_none());
        assert!(cache.get::<u32>(&key("d", "f", "a")).is_some());

        let short = MemoCache::new(MemoConfig {
            capacity: 10,
            ttl: Duration::ZERO,
        });
        short.insert(key("d", "f", "a"), 1u32);
        assert!(short.get::<u32>(&key("d", "f", "a")).is_none());
        assert!(short.is_empty());
    }

    #[test]
    fn test_invalidation() {
        let cache = MemoCache::default();
        cache.insert(key("d1", "calculate_diffexp", "sel"), 1u8);
        cache.insert(key("d1", "top_genes", "0"), 1u8);
        cache.insert(key("d2", "top_genes", "0"), 1u8);
        assert_eq!(cache.invalidate_functions("d1", &["calculate_diffexp"]), 1);
        assert_eq!(cache.invalidate_dataset("d1"), 1);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
