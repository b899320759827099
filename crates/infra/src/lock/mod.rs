//! Distributed mutual exclusion over a shared key-value store.
//!
//! A lock that cannot be taken is a normal outcome ("someone else is on it"),
//! so every operation reports `bool` and backend faults are logged, never
//! returned.

pub mod backend;
#[cfg(feature = "redis")]
pub mod redis;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, warn};
use uuid::Uuid;

pub use backend::{InMemoryLockBackend, LockBackend, LockError};
#[cfg(feature = "redis")]
pub use self::redis::RedisLockBackend;

/// Serializes target distribution across schedulers.
pub const DISTRIBUTE_LOCK: &str = "fleet:distribute";
/// Serializes worker health checks.
pub const HEALTH_CHECK_LOCK: &str = "fleet:health_check";
/// Serializes cross-swap and load rebalancing.
pub const REBALANCE_LOCK: &str = "fleet:rebalance";

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A named lock with a per-holder token.
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    name: String,
    key: String,
    token: String,
    ttl: Duration,
    retry_interval: Duration,
    max_retries: u32,
    held: AtomicBool,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("held", &self.is_held())
            .finish()
    }
}

impl DistributedLock {
    /// A single-attempt lock stored under `lock:<name>`.
    pub fn new(backend: Arc<dyn LockBackend>, name: impl Into<String>, ttl: Duration) -> Self {
        let name = name.into();
        Self {
            backend,
            key: format!("lock:{name}"),
            name,
            token: Uuid::now_v7().to_string(),
            ttl,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_retries: 0,
            held: AtomicBool::new(false),
        }
    }

    /// Retry a contended acquire `max_retries` more times, `interval` apart.
    pub fn with_retry(mut self, max_retries: u32, interval: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Returns `true` iff this call installed the key.
    pub async fn acquire(&self) -> bool {
        for attempt in 0..=self.max_retries {
            match self.backend.set_if_absent(&self.key, &self.token, self.ttl).await {
                Ok(true) => {
                    self.held.store(true, Ordering::Release);
                    debug!(lock = %self.name, "lock acquired");
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(lock = %self.name, error = %e, "lock acquire failed");
                    return false;
                }
            }
            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_interval).await;
            }
        }
        debug!(lock = %self.name, attempts = self.max_retries + 1, "lock held elsewhere");
        false
    }

    /// Returns `false` if the lock was not held, had expired or was taken over.
    pub async fn release(&self) -> bool {
        if !self.held.swap(false, Ordering::AcqRel) {
            return false;
        }
        match self.backend.compare_and_delete(&self.key, &self.token).await {
            Ok(true) => {
                debug!(lock = %self.name, "lock released");
                true
            }
            Ok(false) => {
                warn!(lock = %self.name, "lock expired or was taken over before release");
                false
            }
            Err(e) => {
                error!(lock = %self.name, error = %e, "lock release failed");
                false
            }
        }
    }

    /// Refresh the TTL to `ttl`, or to the original TTL when `None`.
    pub async fn extend(&self, ttl: Option<Duration>) -> bool {
        if !self.is_held() {
            return false;
        }
        let ttl = ttl.unwrap_or(self.ttl);
        match self.backend.compare_and_expire(&self.key, &self.token, ttl).await {
            Ok(true) => true,
            Ok(false) => {
                self.held.store(false, Ordering::Release);
                warn!(lock = %self.name, "lock lost before extend");
                false
            }
            Err(e) => {
                error!(lock = %self.name, error = %e, "lock extend failed");
                false
            }
        }
    }
}

/// Hands out locks over one shared backend.
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    issued: Mutex<Vec<Arc<DistributedLock>>>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLockBackend::new()))
    }

    pub fn backend(&self) -> Arc<dyn LockBackend> {
        self.backend.clone()
    }

    /// Create a tracked lock; [`LockManager::release_all`] releases it on shutdown.
    pub fn create_lock(&self, name: &str, ttl: Duration) -> Arc<DistributedLock> {
        let lock = Arc::new(DistributedLock::new(self.backend.clone(), name, ttl));
        let mut issued = self.issued.lock().unwrap();
        issued.retain(|l| l.is_held() || Arc::strong_count(l) > 1);
        issued.push(lock.clone());
        lock
    }

    /// Run `f` while holding `name`. Returns `None` without running `f` when
    /// the lock is held elsewhere.
    pub async fn with_lock<F, Fut, T>(&self, name: &str, ttl: Duration, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = DistributedLock::new(self.backend.clone(), name, ttl);
        if !lock.acquire().await {
            debug!(lock = name, "skipping cycle, lock held elsewhere");
            return None;
        }
        let out = f().await;
        lock.release().await;
        Some(out)
    }

    /// Release every tracked lock still held. Returns how many were released.
    pub async fn release_all(&self) -> usize {
        let locks: Vec<_> = self.issued.lock().unwrap().drain(..).collect();
        let mut released = 0;
        for lock in locks {
            if lock.release().await {
                released += 1;
            }
        }
        released
    }
}
