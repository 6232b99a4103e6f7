//! Read-side query result cache.
//!
//! LRU bounded by entry count, per-entry TTL, and single-flight loading so
//! that concurrent misses on one fingerprint execute the statement once.
//! Entries are immutable after insertion and shared as `Arc`, so readers
//! hold the map lock only for the lookup itself. Statistics are monotonic
//! and reset only on process restart.
//!
//! When the cache is disabled every lookup is a miss and stores are no-ops.

mod fingerprint;

pub use fingerprint::{fingerprint, normalize_sql};

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{watch, OnceCell};

use crate::config::Cache as CacheConfig;
use crate::errors::Error;
use crate::utils::clock;
use crate::utils::dashmap::new_dashmap;

/// One cached result set. Immutable after insert.
#[derive(Debug)]
pub struct CacheEntry {
    pub fingerprint: u64,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub created_at: quanta::Instant,
    pub expires_at: quanta::Instant,
    pub size_estimate: usize,
}

impl CacheEntry {
    pub fn new(fingerprint: u64, columns: Vec<String>, rows: Vec<Vec<Value>>, ttl: Duration) -> CacheEntry {
        let now = clock::now();
        let size_estimate = estimate_size(&columns, &rows);
        CacheEntry {
            fingerprint,
            columns,
            rows,
            created_at: now,
            expires_at: now + ttl,
            size_estimate,
        }
    }

    fn is_expired(&self) -> bool {
        clock::now() >= self.expires_at
    }
}

fn estimate_size(columns: &[String], rows: &[Vec<Value>]) -> usize {
    fn value_size(v: &Value) -> usize {
        match v {
            Value::Null => 4,
            Value::Bool(_) => 5,
            Value::Number(_) => 8,
            Value::String(s) => s.len() + 2,
            other => other.to_string().len(),
        }
    }
    columns.iter().map(|c| c.len()).sum::<usize>()
        + rows.iter().flatten().map(value_size).sum::<usize>()
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    total_requests: AtomicU64,
    /// Unix seconds of the last janitor pass; 0 = never.
    last_cleanup: AtomicI64,
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub total_requests: u64,
    pub current_size: u64,
    pub last_cleanup_unix: i64,
}

impl CacheStats {
    pub fn last_cleanup(&self) -> Option<DateTime<Utc>> {
        if self.last_cleanup_unix == 0 {
            None
        } else {
            DateTime::<Utc>::from_timestamp(self.last_cleanup_unix, 0)
        }
    }
}

type FlightResult = Result<Arc<CacheEntry>, Arc<Error>>;
type Flight = Arc<OnceCell<FlightResult>>;

pub struct QueryCache {
    enabled: bool,
    ttl: Duration,
    cleanup_interval: Duration,
    entries: Mutex<LruCache<u64, Arc<CacheEntry>>>,
    inflight: DashMap<u64, Flight>,
    counters: Counters,
}

impl QueryCache {
    pub fn new(config: &CacheConfig, workers: usize) -> QueryCache {
        let capacity = NonZeroUsize::new(config.size.max(1)).unwrap();
        QueryCache {
            enabled: config.enabled,
            ttl: config.ttl.as_std(),
            cleanup_interval: config.cleanup_interval.as_std(),
            entries: Mutex::new(LruCache::new(capacity)),
            inflight: new_dashmap(workers),
            counters: Counters::default(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Builds an entry carrying this cache's TTL.
    pub fn make_entry(
        &self,
        fingerprint: u64,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    ) -> CacheEntry {
        CacheEntry::new(fingerprint, columns, rows, self.ttl)
    }

    /// Returns a live entry, promoting it in the LRU. Expired entries are
    /// removed and reported as misses.
    pub fn lookup(&self, fingerprint: u64) -> Option<Arc<CacheEntry>> {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        if !self.enabled {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut entries = self.entries.lock();
        match entries.get(&fingerprint) {
            Some(entry) if entry.is_expired() => {
                entries.pop(&fingerprint);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts an entry, evicting the least recently used one at capacity.
    pub fn store(&self, entry: Arc<CacheEntry>) {
        if !self.enabled {
            return;
        }
        let key = entry.fingerprint;
        let evicted = self.entries.lock().push(key, entry);
        if let Some((old_key, _)) = evicted {
            // push returns the displaced pair; same-key replacement is not
            // an eviction
            if old_key != key {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Cache-or-execute with single-flight coalescing: concurrent callers
    /// with one fingerprint share a single `load` execution and its result,
    /// success or failure. Failures are never cached.
    pub async fn get_or_load<F, Fut>(&self, fingerprint: u64, load: F) -> FlightResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry, Error>>,
    {
        if let Some(entry) = self.lookup(fingerprint) {
            return Ok(entry);
        }

        let flight: Flight = self.inflight.entry(fingerprint).or_default().clone();

        let result = flight
            .get_or_init(|| async {
                match load().await {
                    Ok(entry) => {
                        let entry = Arc::new(entry);
                        self.store(entry.clone());
                        Ok(entry)
                    }
                    Err(err) => Err(Arc::new(err)),
                }
            })
            .await
            .clone();

        // Retire the flight once settled. The pointer check keeps a newer
        // flight for the same fingerprint alive.
        self.inflight
            .remove_if(&fingerprint, |_, f| Arc::ptr_eq(f, &flight) && f.initialized());

        result
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            current_size: self.entries.lock().len() as u64,
            last_cleanup_unix: self.counters.last_cleanup.load(Ordering::Relaxed),
        }
    }

    fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let expired: Vec<u64> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        drop(entries);

        self.counters
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        self.counters
            .last_cleanup
            .store(Utc::now().timestamp(), Ordering::Relaxed);
        expired.len()
    }

    /// Background task evicting expired entries every cleanup interval.
    pub async fn run_janitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.enabled {
            return;
        }
        let mut ticker = tokio::time::interval(self.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sweep_expired();
                    if removed > 0 {
                        debug!("cache janitor removed {removed} expired entries");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
