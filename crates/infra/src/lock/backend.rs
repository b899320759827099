//! Key-value primitives the distributed lock is built on.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Lock backend error.
///
/// Only raised for backend faults (connection loss, protocol errors); a held
/// lock is never an error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Backend(err.to_string())
    }
}

/// Shared store with atomic set-if-absent and token-checked mutations.
#[async_trait::async_trait]
pub trait LockBackend: Send + Sync {
    /// Install `key = token` with `ttl` unless the key already exists.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete `key` only if it still holds `token`.
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError>;

    /// Reset the TTL of `key` only if it still holds `token`.
    async fn compare_and_expire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Current holder token, if the key is set and unexpired.
    async fn holder(&self, key: &str) -> Result<Option<String>, LockError>;
}

/// In-memory lock backend for tests/dev.
///
/// Expiry is evaluated lazily against `tokio::time::Instant`, so tests running
/// with a paused clock can advance past a TTL.
#[derive(Debug, Default)]
pub struct InMemoryLockBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_token<'a>(
        entries: &'a mut HashMap<String, (String, Instant)>,
        key: &str,
    ) -> Option<&'a mut (String, Instant)> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|(_, expires)| *expires <= now) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

#[async_trait::async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().unwrap();
        if Self::live_token(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), (token.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().unwrap();
        let owned = Self::live_token(&mut entries, key).is_some_and(|(held, _)| held == token);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    async fn compare_and_expire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().unwrap();
        match Self::live_token(&mut entries, key) {
            Some((held, expires)) if held == token => {
                *expires = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let mut entries = self.entries.lock().unwrap();
        Ok(Self::live_token(&mut entries, key).map(|(token, _)| token.clone()))
    }
}
