//! Bounded TTL cache shared by permission checks and plan-limit lookups.
//!
//! Capacity eviction removes the entry with the oldest creation time, not the
//! least recently read one. A poisoned lock degrades every read to a miss.
//!
//! Every `delete` and `clear` advances a generation counter. A caller that
//! loads a value from the source of truth takes [`PermissionCache::generation`]
//! first and stores the result with [`PermissionCache::set_if_unchanged`], so
//! an answer fetched before an invalidation never lands after it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Longest lifetime an entry can get. Larger TTLs are clamped to it.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        let created_at = Instant::now();
        Self {
            value,
            created_at,
            expires_at: created_at
                .checked_add(ttl)
                .or_else(|| created_at.checked_add(MAX_TTL))
                .unwrap_or(created_at),
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
    pub last_cleanup: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct PermissionCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    max_size: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    generation: AtomicU64,
    last_cleanup: RwLock<Option<DateTime<Utc>>>,
    shutdown: CancellationToken,
}

impl<V: Clone + Send + Sync + 'static> PermissionCache<V> {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_size: max_size.max(1),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            last_cleanup: RwLock::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(config: &CacheConfig) -> Self {
        Self::new(config.max_size, config.ttl)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let lookup = match self.entries.read() {
            Ok(entries) => entries
                .get(key)
                .map(|entry| (entry.is_expired_at(now), entry.value.clone())),
            Err(_) => {
                tracing::warn!("permission cache lock poisoned, treating as miss");
                None
            }
        };

        match lookup {
            Some((false, value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some((true, _)) => {
                if let Ok(mut entries) = self.entries.write()
                    && entries.get(key).is_some_and(|e| e.is_expired_at(Instant::now()))
                {
                    entries.remove(key);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let Ok(mut entries) = self.entries.write() else {
            tracing::warn!("permission cache lock poisoned, dropping write");
            return;
        };
        self.insert(&mut entries, key.into(), value, ttl);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Stores `value` only if no `delete` or `clear` ran since `generation`
    /// was read. Returns whether the entry was written.
    pub fn set_if_unchanged(&self, key: impl Into<String>, value: V, generation: u64) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            tracing::warn!("permission cache lock poisoned, dropping write");
            return false;
        };
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        self.insert(&mut entries, key.into(), value, self.default_ttl);
        true
    }

    fn insert(
        &self,
        entries: &mut HashMap<String, CacheEntry<V>>,
        key: String,
        value: V,
        ttl: Duration,
    ) {
        if entries.len() >= self.max_size && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        entries.insert(key, CacheEntry::new(value, ttl));
    }

    pub fn delete(&self, key: &str) -> bool {
        match self.entries.write() {
            Ok(mut entries) => {
                self.generation.fetch_add(1, Ordering::AcqRel);
                entries.remove(key).is_some()
            }
            Err(_) => false,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            self.generation.fetch_add(1, Ordering::AcqRel);
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let removed = match self.entries.write() {
            Ok(mut entries) => {
                let now = Instant::now();
                let before = entries.len();
                entries.retain(|_, entry| !entry.is_expired_at(now));
                before - entries.len()
            }
            Err(_) => return 0,
        };

        *self
            .last_cleanup
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        if removed > 0 {
            tracing::debug!(removed, "expired cache entries removed");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };

        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.len(),
            max_size: self.max_size,
            hit_rate,
            last_cleanup: *self
                .last_cleanup
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Starts the periodic sweep. It stops on [`Self::close`] or once the
    /// cache itself is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        cache.cleanup_expired();
                    }
                }
            }
            tracing::debug!("cache cleanup task stopped");
        })
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}
