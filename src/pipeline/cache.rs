//! Content-addressed extraction cache with single-flight deduplication.
//!
//! ```text
//! ExtractionCache
//!     ├── entries: HashMap<CacheKey, CacheEntry>   // write-once, LRU + TTL
//!     └── pending: HashMap<CacheKey, watch::Receiver<Slot>>
//! ```
//!
//! The first caller for a missing key becomes the leader and runs the
//! extraction; later callers for the same key subscribe to the leader's
//! channel. Only successes are stored. A leader that is dropped before
//! finishing (cancelled task) releases its pending slot so waiters retry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use super::extraction::{ExtractionError, ExtractionResult};
use crate::config::CacheConfig;
use crate::models::EngineKind;

type Shared = Result<Arc<ExtractionResult>, ExtractionError>;
type Slot = Option<Shared>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub content_hash: String,
    /// Present only when the cache is scoped per engine.
    pub engine: Option<EngineKind>,
}

impl CacheKey {
    pub fn new(content_hash: &str, engine: Option<EngineKind>) -> Self {
        Self {
            content_hash: content_hash.to_string(),
            engine,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

struct CacheEntry {
    value: Arc<ExtractionResult>,
    inserted_at: Instant,
    last_access: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    pending: HashMap<CacheKey, watch::Receiver<Slot>>,
    tick: u64,
}

enum Role {
    Hit(Arc<ExtractionResult>),
    Leader(watch::Sender<Slot>),
    Waiter(watch::Receiver<Slot>),
}

pub struct ExtractionCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ExtractionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Key for a document, scoped to `engine` when the cache is configured so.
    pub fn key_for(&self, content_hash: &str, engine: EngineKind) -> CacheKey {
        let scope = self.config.scope_by_engine.then_some(engine);
        CacheKey::new(content_hash, scope)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // No code path panics while holding the lock; recover the state anyway.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the cached result for `key`, or run `compute` exactly once
    /// across all concurrent callers and share its outcome.
    pub async fn get_or_extract<F, Fut>(&self, key: CacheKey, compute: F) -> Shared
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ExtractionResult, ExtractionError>>,
    {
        let mut compute = Some(compute);
        loop {
            match self.claim(&key) {
                Role::Hit(value) => return Ok(value),
                Role::Waiter(mut rx) => {
                    tracing::debug!(hash = %key.content_hash, "Awaiting in-flight extraction");
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(slot) => slot.clone(),
                        Err(_) => None,
                    };
                    match outcome {
                        Some(shared) => {
                            self.hits.fetch_add(1, Ordering::Relaxed);
                            return shared;
                        }
                        // Leader abandoned the key; claim again.
                        None => continue,
                    }
                }
                Role::Leader(tx) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let mut flight = Flight {
                        cache: self,
                        key: &key,
                        tx: Some(tx),
                    };
                    let run = match compute.take() {
                        Some(run) => run,
                        None => return Err(ExtractionError::Cancelled),
                    };
                    let shared = run().await.map(Arc::new);
                    flight.finish(shared.clone());
                    return shared;
                }
            }
        }
    }

    fn claim(&self, key: &CacheKey) -> Role {
        let mut state = self.lock();
        state.tick += 1;
        let tick = state.tick;

        let expired = match state.entries.get_mut(key) {
            Some(entry) if self.is_expired(entry) => true,
            Some(entry) => {
                entry.last_access = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(hash = %key.content_hash, "Extraction cache hit");
                return Role::Hit(entry.value.clone());
            }
            None => false,
        };
        if expired {
            state.entries.remove(key);
            tracing::debug!(hash = %key.content_hash, "Extraction cache entry expired");
        }

        if let Some(rx) = state.pending.get(key) {
            return Role::Waiter(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        state.pending.insert(key.clone(), rx);
        Role::Leader(tx)
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.config
            .ttl
            .is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl)
    }

    fn store(&self, state: &mut CacheState, key: &CacheKey, value: Arc<ExtractionResult>) {
        if self.config.capacity == 0 || state.entries.contains_key(key) {
            return;
        }
        while state.entries.len() >= self.config.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    state.entries.remove(&k);
                    tracing::debug!(hash = %k.content_hash, "Evicted least recently used entry");
                }
                None => break,
            }
        }
        state.tick += 1;
        let last_access = state.tick;
        state.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                last_access,
            },
        );
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        let state = self.lock();
        state
            .entries
            .get(key)
            .is_some_and(|entry| !self.is_expired(entry))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            entries: self.len(),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }

    /// Drop stored results. In-flight extractions are left to finish.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Drop stored results and zero the counters.
    pub fn reset(&self) {
        self.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Leader-side ownership of a pending key.
struct Flight<'a> {
    cache: &'a ExtractionCache,
    key: &'a CacheKey,
    tx: Option<watch::Sender<Slot>>,
}

impl Flight<'_> {
    fn finish(&mut self, shared: Shared) {
        if matches!(shared, Err(ExtractionError::Cancelled)) {
            // A cancelled leader releases the key; waiters claim it again.
            self.cache.lock().pending.remove(self.key);
            self.tx = None;
            return;
        }
        {
            let mut state = self.cache.lock();
            state.pending.remove(self.key);
            if let Ok(value) = &shared {
                self.cache.store(&mut state, self.key, value.clone());
            }
        }
        if let Some(tx) = self.tx.take() {
            // Waiters may all be gone; nothing to deliver then.
            let _ = tx.send(Some(shared));
        }
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::debug!(hash = %self.key.content_hash, "Releasing abandoned in-flight extraction");
            self.cache.lock().pending.remove(self.key);
        }
    }
}
