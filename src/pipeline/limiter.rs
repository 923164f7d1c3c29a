//! Per-engine admission control: a concurrency cap with a bounded wait queue,
//! plus a token bucket enforcing a requests-per-minute ceiling.
//!
//! State is process-wide and only changes through `acquire` / permit drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

use crate::config::{EngineLimits, PipelineConfig};
use crate::models::EngineKind;
use crate::pipeline::extraction::ExtractionError;

// ═══════════════════════════════════════════════════════════
// Token bucket
// ═══════════════════════════════════════════════════════════

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn per_minute(rpm: u32) -> Self {
        let capacity = rpm.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec))
        }
    }

    fn reset(&mut self) {
        self.tokens = self.capacity;
        self.last_refill = Instant::now();
    }
}

// ═══════════════════════════════════════════════════════════
// EngineLimiter
// ═══════════════════════════════════════════════════════════

/// Held for the duration of one engine call; releases the slot on drop.
#[derive(Debug)]
pub struct EnginePermit {
    _slot: OwnedSemaphorePermit,
}

/// Decrements the waiting count however the wait ends (including cancellation).
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct EngineLimiter {
    kind: EngineKind,
    slots: Arc<Semaphore>,
    waiting: AtomicUsize,
    queue_depth: usize,
    bucket: Mutex<TokenBucket>,
    max_wait: Duration,
}

impl EngineLimiter {
    pub fn new(kind: EngineKind, limits: &EngineLimits) -> Self {
        Self {
            kind,
            slots: Arc::new(Semaphore::new(limits.max_concurrent.max(1))),
            waiting: AtomicUsize::new(0),
            queue_depth: limits.queue_depth,
            bucket: Mutex::new(TokenBucket::per_minute(limits.requests_per_minute)),
            max_wait: limits.max_wait,
        }
    }

    /// Wait for a concurrency slot (FIFO) and a rate token.
    ///
    /// Fails fast with `Backpressure` when the wait queue is full, and after
    /// `max_wait` when no token becomes available.
    pub async fn acquire(&self) -> Result<EnginePermit, ExtractionError> {
        let slot = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => self.wait_for_slot().await?,
            Err(TryAcquireError::Closed) => return Err(self.backpressure("limiter closed")),
        };

        self.take_token().await?;
        Ok(EnginePermit { _slot: slot })
    }

    async fn wait_for_slot(&self) -> Result<OwnedSemaphorePermit, ExtractionError> {
        let ahead = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _queued = QueueSlot(&self.waiting);
        if ahead >= self.queue_depth {
            tracing::warn!(
                engine = %self.kind,
                queue_depth = self.queue_depth,
                "Engine queue full, rejecting call"
            );
            return Err(self.backpressure(&format!("queue full ({} waiting)", self.queue_depth)));
        }

        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| self.backpressure("limiter closed"))
    }

    async fn take_token(&self) -> Result<(), ExtractionError> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            let now = Instant::now();
            let wait = match self.bucket.lock().await.try_take(now) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            if now + wait > deadline {
                tracing::warn!(
                    engine = %self.kind,
                    wait_ms = wait.as_millis() as u64,
                    "Rate limit token unavailable within max wait"
                );
                return Err(self.backpressure("rate limit exceeded"));
            }
            tokio::time::sleep(wait).await;
        }
    }

    fn backpressure(&self, reason: &str) -> ExtractionError {
        ExtractionError::Backpressure {
            engine: self.kind,
            reason: reason.to_string(),
        }
    }

    /// Calls currently holding a slot.
    pub fn in_flight(&self, max_concurrent: usize) -> usize {
        max_concurrent.saturating_sub(self.slots.available_permits())
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Refill the token bucket. Slots are released only by their permits.
    pub async fn reset(&self) {
        self.bucket.lock().await.reset();
    }
}

// ═══════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════

/// One limiter per engine, shared across sessions.
pub struct LimiterRegistry {
    limiters: HashMap<EngineKind, Arc<EngineLimiter>>,
}

impl LimiterRegistry {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let limiters = EngineKind::ALL
            .iter()
            .map(|kind| {
                let limits = config.limits_for(*kind);
                (*kind, Arc::new(EngineLimiter::new(*kind, &limits)))
            })
            .collect();
        Self { limiters }
    }

    pub fn get(&self, kind: EngineKind) -> Option<Arc<EngineLimiter>> {
        self.limiters.get(&kind).cloned()
    }

    pub async fn reset(&self) {
        for limiter in self.limiters.values() {
            limiter.reset().await;
        }
    }
}
