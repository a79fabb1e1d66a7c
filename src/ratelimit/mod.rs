//! Distributed counting semaphore for a rate-limited shared resource.
//!
//! Slots are counted in a [`SharedStore`] so that independent processes pointed
//! at the same store share one budget. If the store becomes unreachable the
//! limiter switches, once and for good, to a local semaphore of the same size.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use convoy::ratelimit::{MemoryStore, RateLimiter, RateLimiterConfig};
//!
//! let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), RateLimiterConfig::default());
//! let lease = limiter.acquire("T-001").await?;
//! // call the rate-limited resource
//! limiter.release(lease).await;
//! ```

mod store;

pub use store::{MemoryStore, SharedStore, SqliteStore, StoreError, StoreResult};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// Settings for a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Key of the counter in the shared store.
    pub key: String,
    /// Number of slots shared by every process using `key`.
    pub max_concurrent: u32,
    /// Maximum wait before `acquire` fails.
    pub queue_timeout: Duration,
    /// Time after which an unreleased lease is reclaimed by the store.
    pub lease_ttl: Duration,
    /// First backoff delay.
    pub initial_backoff: Duration,
    /// Upper bound for the backoff delay.
    pub max_backoff: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            key: "convoy:llm".to_string(),
            max_concurrent: 5,
            queue_timeout: Duration::from_secs(120),
            lease_ttl: Duration::from_secs(300),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RateLimiterConfig {
    /// Build limiter settings from the engine config.
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            key: config.limiter_key.clone(),
            max_concurrent: config.max_concurrent,
            queue_timeout: config.queue_timeout(),
            lease_ttl: config.lease_ttl(),
            ..Self::default()
        }
    }

    /// Set the slot count.
    pub fn with_max_concurrent(mut self, slots: u32) -> Self {
        self.max_concurrent = slots;
        self
    }

    /// Set the acquire timeout.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Set the lease TTL.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }
}

#[derive(Debug)]
enum LeaseSlot {
    Distributed,
    Local(OwnedSemaphorePermit),
}

/// A granted slot. Hand it back with [`RateLimiter::release`].
#[derive(Debug)]
pub struct SemaphoreLease {
    holder_id: String,
    label: String,
    acquired_at: Instant,
    ttl: Duration,
    slot: LeaseSlot,
}

impl SemaphoreLease {
    /// Opaque holder id registered in the store.
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Caller label the lease was granted to.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the lease came from the local fallback semaphore.
    pub fn is_local(&self) -> bool {
        matches!(self.slot, LeaseSlot::Local(_))
    }

    /// Whether the store may already have reclaimed this lease.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }
}

/// Counting semaphore backed by a shared store with a local fallback.
pub struct RateLimiter {
    config: RateLimiterConfig,
    store: Arc<dyn SharedStore>,
    local: Arc<Semaphore>,
    degraded: AtomicBool,
    degradation_events: AtomicUsize,
}

impl RateLimiter {
    /// Create a limiter over `store`.
    pub fn new(store: Arc<dyn SharedStore>, config: RateLimiterConfig) -> Self {
        let local = Arc::new(Semaphore::new(config.max_concurrent as usize));
        Self {
            config,
            store,
            local,
            degraded: AtomicBool::new(false),
            degradation_events: AtomicUsize::new(0),
        }
    }

    /// Create a limiter that only ever uses the local semaphore.
    pub fn local_only(config: RateLimiterConfig) -> Self {
        let limiter = Self::new(Arc::new(MemoryStore::new()), config);
        limiter.degraded.store(true, Ordering::SeqCst);
        limiter
    }

    /// Create a limiter for a store that could not be opened. Counts as the
    /// one degradation event.
    pub fn degraded(config: RateLimiterConfig, err: &StoreError) -> Self {
        let limiter = Self::new(Arc::new(MemoryStore::new()), config);
        limiter.degrade(err);
        limiter
    }

    /// Limiter settings.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Whether the limiter has fallen back to local-only mode.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Number of times the degradation warning was emitted (zero or one).
    pub fn degradation_count(&self) -> usize {
        self.degradation_events.load(Ordering::SeqCst)
    }

    /// Slots currently held according to the shared store, or locally when degraded.
    pub async fn in_use(&self) -> u32 {
        if self.is_degraded() {
            return self.config.max_concurrent - self.local.available_permits() as u32;
        }
        let store = Arc::clone(&self.store);
        let key = self.config.key.clone();
        match tokio::task::spawn_blocking(move || store.count(&key)).await {
            Ok(Ok(count)) => count,
            _ => 0,
        }
    }

    /// Wait for a slot, backing off with jitter, until `queue_timeout` elapses.
    pub async fn acquire(&self, label: &str) -> Result<SemaphoreLease> {
        let started = Instant::now();
        let deadline = started + self.config.queue_timeout;
        let holder_id = format!("{}:{}", label, Uuid::new_v4());
        let mut attempt: u32 = 0;

        loop {
            if self.is_degraded() {
                return self.acquire_local(label, holder_id, deadline, started).await;
            }

            match self.try_acquire_distributed(&holder_id).await {
                Ok(true) => {
                    tracing::debug!(label, holder = %holder_id, "rate limiter slot acquired");
                    return Ok(SemaphoreLease {
                        holder_id,
                        label: label.to_string(),
                        acquired_at: Instant::now(),
                        ttl: self.config.lease_ttl,
                        slot: LeaseSlot::Distributed,
                    });
                }
                Ok(false) => {}
                Err(err) if err.is_unavailable() => {
                    self.degrade(&err);
                    continue;
                }
                Err(err) => {
                    tracing::debug!(label, error = %err, "store error treated as no slot this attempt");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::AcquireTimeout {
                    label: label.to_string(),
                    waited: started.elapsed(),
                });
            }
            let delay = self.backoff(attempt).min(deadline - now);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
        }
    }

    /// Return a slot. Releasing an expired or already reclaimed lease is harmless.
    pub async fn release(&self, lease: SemaphoreLease) {
        match lease.slot {
            LeaseSlot::Local(permit) => drop(permit),
            LeaseSlot::Distributed => {
                let store = Arc::clone(&self.store);
                let key = self.config.key.clone();
                let holder = lease.holder_id.clone();
                match tokio::task::spawn_blocking(move || store.release(&key, &holder)).await {
                    Ok(Ok(true)) => {
                        tracing::debug!(label = %lease.label, holder = %lease.holder_id, "rate limiter slot released");
                    }
                    Ok(Ok(false)) => {
                        tracing::debug!(
                            label = %lease.label,
                            holder = %lease.holder_id,
                            "lease already reclaimed; counter left unchanged"
                        );
                    }
                    Ok(Err(err)) => {
                        // the TTL reclaims the slot if the release never lands
                        tracing::warn!(label = %lease.label, error = %err, "failed to release lease");
                    }
                    Err(err) => {
                        tracing::warn!(label = %lease.label, error = %err, "release task failed");
                    }
                }
            }
        }
    }

    async fn try_acquire_distributed(&self, holder_id: &str) -> StoreResult<bool> {
        let store = Arc::clone(&self.store);
        let key = self.config.key.clone();
        let holder = holder_id.to_string();
        let limit = self.config.max_concurrent;
        let ttl = self.config.lease_ttl;
        tokio::task::spawn_blocking(move || store.try_acquire(&key, &holder, limit, ttl))
            .await
            .map_err(|e| StoreError::Busy(e.to_string()))?
    }

    async fn acquire_local(
        &self,
        label: &str,
        holder_id: String,
        deadline: Instant,
        started: Instant,
    ) -> Result<SemaphoreLease> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let permit = tokio::time::timeout(remaining, Arc::clone(&self.local).acquire_owned())
            .await
            .map_err(|_| EngineError::AcquireTimeout {
                label: label.to_string(),
                waited: started.elapsed(),
            })?
            .map_err(|_| EngineError::SharedStoreUnavailable("local semaphore closed".to_string()))?;
        Ok(SemaphoreLease {
            holder_id,
            label: label.to_string(),
            acquired_at: Instant::now(),
            ttl: Duration::MAX,
            slot: LeaseSlot::Local(permit),
        })
    }

    fn degrade(&self, err: &StoreError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            self.degradation_events.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                error = %err,
                slots = self.config.max_concurrent,
                "shared store unreachable; rate limiting falls back to this process only"
            );
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff.as_millis() as u64;
        let cap = self.config.max_backoff.as_millis().max(1) as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(16)).min(cap);
        let jitter = rand::thread_rng().gen_range(0..=exp / 2);
        Duration::from_millis((exp / 2 + jitter).max(1))
    }
}

/// A task's handle on the rate-limited resource.
///
/// The batch semaphore gives a task its local slot; every call into the
/// shared resource must additionally go through [`ResourceSlot::call`].
#[derive(Clone)]
pub struct ResourceSlot {
    limiter: Arc<RateLimiter>,
    label: String,
}

impl ResourceSlot {
    pub fn new(limiter: Arc<RateLimiter>, label: impl Into<String>) -> Self {
        Self {
            limiter,
            label: label.into(),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run `call` while holding a lease. The lease is released even when
    /// `call` fails.
    pub async fn call<F, T>(&self, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let lease = self.limiter.acquire(&self.label).await?;
        let outcome = call.await;
        self.limiter.release(lease).await;
        outcome
    }
}

impl std::fmt::Debug for ResourceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSlot")
            .field("label", &self.label)
            .field("key", &self.limiter.config().key)
            .finish()
    }
}
