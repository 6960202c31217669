//! Query-result cache: keyed LRU with TTL and collection-scoped
//! invalidation.
//!
//! Keys are `collection + ":" + lowercase(trim(query))`; whitespace
//! collapsing happened upstream in sanitization. A `get` hit moves the entry
//! to the MRU end; inserts evict from the LRU end past `max_size`. Expired
//! entries count as misses and are evicted on contact.
//!
//! With a [`KvStore`] attached, entries mirror to durable storage on a
//! best-effort basis: writes go through `tokio::spawn` so `put` never blocks
//! on persistence, `load_persisted` skips expired entries at startup, and
//! corrupt stored values are treated as misses and deleted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sift_core::{CacheConfig, KvStore, PipelineContext};

/// One cached retrieval result.
#[derive(Debug, Clone)]
struct CacheEntry {
    context: PipelineContext,
    collection: String,
    inserted_at: Instant,
    expires_at: Instant,
    hit_count: u64,
}

/// Wire form for the durable mirror; instants become unix millis.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    context: PipelineContext,
    collection: String,
    expires_at_unix_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// LRU order, least-recent first.
    order: Vec<String>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// LRU + TTL cache of pipeline results.
#[derive(Debug)]
pub struct QueryCache {
    cfg: CacheConfig,
    ttl: Duration,
    state: Mutex<CacheState>,
    persist: Option<Arc<dyn KvStore>>,
}

fn cache_key(query: &str, collection: &str) -> String {
    format!("{}:{}", collection, query.trim().to_lowercase())
}

fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl QueryCache {
    pub fn new(cfg: CacheConfig) -> Self {
        let ttl = Duration::from_millis(cfg.ttl_ms);
        Self {
            cfg,
            ttl,
            state: Mutex::new(CacheState::default()),
            persist: None,
        }
    }

    pub fn with_persistence(mut self, store: Arc<dyn KvStore>) -> Self {
        self.persist = Some(store);
        self
    }

    /// Restore entries from the durable mirror, skipping anything expired or
    /// unreadable. Called once at pipeline startup.
    pub async fn load_persisted(&self) {
        let Some(store) = &self.persist else { return };
        let keys = match store.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "cache mirror unavailable at load");
                return;
            }
        };
        let now_ms = unix_ms_now();
        let mut restored = 0usize;
        for key in keys {
            let Ok(Some(raw)) = store.get(&key).await else {
                continue;
            };
            match serde_json::from_str::<PersistedEntry>(&raw) {
                Ok(persisted) if persisted.expires_at_unix_ms > now_ms => {
                    let remaining =
                        Duration::from_millis(persisted.expires_at_unix_ms - now_ms);
                    let now = Instant::now();
                    let mut state = self.state.lock().expect("cache poisoned");
                    Self::insert_locked(
                        &mut state,
                        self.cfg.max_size,
                        key,
                        CacheEntry {
                            context: persisted.context,
                            collection: persisted.collection,
                            inserted_at: now,
                            expires_at: now + remaining.min(self.ttl),
                            hit_count: 0,
                        },
                    );
                    restored += 1;
                }
                Ok(_) => {
                    // Expired on disk; clean it up opportunistically.
                    let _ = store.delete(&key).await;
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "corrupt cache mirror entry; deleting");
                    let _ = store.delete(&key).await;
                }
            }
        }
        if restored > 0 {
            debug!(restored, "query cache warmed from mirror");
        }
    }

    pub fn get(&self, query: &str, collection: &str) -> Option<PipelineContext> {
        if !self.cfg.enabled {
            return None;
        }
        let key = cache_key(query, collection);
        let mut state = self.state.lock().expect("cache poisoned");
        let now = Instant::now();

        let expired = match state.entries.get(&key) {
            Some(entry) => now > entry.expires_at,
            None => {
                state.misses += 1;
                return None;
            }
        };
        if expired {
            state.entries.remove(&key);
            state.order.retain(|k| k != &key);
            state.misses += 1;
            state.evictions += 1;
            return None;
        }

        state.hits += 1;
        // Move to the MRU end.
        if let Some(pos) = state.order.iter().position(|k| k == &key) {
            let k = state.order.remove(pos);
            state.order.push(k);
        }
        let entry = state.entries.get_mut(&key).expect("entry checked above");
        entry.hit_count += 1;
        Some(entry.context.clone())
    }

    pub fn put(&self, query: &str, collection: &str, context: PipelineContext) {
        if !self.cfg.enabled {
            return;
        }
        let key = cache_key(query, collection);
        let now = Instant::now();
        let entry = CacheEntry {
            context: context.clone(),
            collection: collection.to_string(),
            inserted_at: now,
            expires_at: now + self.ttl,
            hit_count: 0,
        };

        {
            let mut state = self.state.lock().expect("cache poisoned");
            Self::insert_locked(&mut state, self.cfg.max_size, key.clone(), entry);
        }

        if let Some(store) = &self.persist {
            let store = Arc::clone(store);
            let persisted = PersistedEntry {
                context,
                collection: collection.to_string(),
                expires_at_unix_ms: unix_ms_now() + self.cfg.ttl_ms,
            };
            // Best-effort mirror write; never blocks the caller.
            tokio::spawn(async move {
                match serde_json::to_string(&persisted) {
                    Ok(raw) => {
                        if let Err(e) = store.put(&key, raw).await {
                            debug!(error = %e, "cache mirror write failed");
                        }
                    }
                    Err(e) => debug!(error = %e, "cache entry not serializable"),
                }
            });
        }
    }

    fn insert_locked(
        state: &mut CacheState,
        max_size: usize,
        key: String,
        entry: CacheEntry,
    ) {
        if state.entries.insert(key.clone(), entry).is_some() {
            state.order.retain(|k| k != &key);
        }
        state.order.push(key);
        while state.entries.len() > max_size && !state.order.is_empty() {
            let lru = state.order.remove(0);
            state.entries.remove(&lru);
            state.evictions += 1;
        }
    }

    /// Drop every entry cached for `collection`; returns the count dropped.
    /// Invoked on any mutation of the collection.
    pub fn invalidate_collection(&self, collection: &str) -> usize {
        let removed: Vec<String> = {
            let mut state = self.state.lock().expect("cache poisoned");
            let doomed: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.collection == collection)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &doomed {
                state.entries.remove(key);
            }
            state.order.retain(|k| !doomed.contains(k));
            state.evictions += doomed.len() as u64;
            doomed
        };

        if let Some(store) = &self.persist {
            let store = Arc::clone(store);
            let keys = removed.clone();
            tokio::spawn(async move {
                for key in keys {
                    let _ = store.delete(&key).await;
                }
            });
        }
        removed.len()
    }

    /// Drop one cached query; returns whether it was present.
    pub fn invalidate_query(&self, query: &str, collection: &str) -> bool {
        let key = cache_key(query, collection);
        let mut state = self.state.lock().expect("cache poisoned");
        let present = state.entries.remove(&key).is_some();
        if present {
            state.order.retain(|k| k != &key);
            state.evictions += 1;
        }
        present
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().expect("cache poisoned");
        let count = state.entries.len() as u64;
        state.entries.clear();
        state.order.clear();
        state.evictions += count;
    }

    /// Sweep expired entries out; returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().expect("cache poisoned");
        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| now > e.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            state.entries.remove(key);
        }
        state.order.retain(|k| !doomed.contains(k));
        state.evictions += doomed.len() as u64;
        doomed.len()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().expect("cache poisoned");
        let total = state.hits + state.misses;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            size: state.entries.len(),
            max_size: self.cfg.max_size,
            hit_rate: if total == 0 {
                0.0
            } else {
                state.hits as f64 / total as f64
            },
        }
    }
}
