//! Pending authentication handles.
//!
//! An interactive login spans several requests. The half-open handle is
//! parked here under an opaque ticket and expires after a TTL instead of
//! living in a process-global map forever.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use fleet_core::WorkerId;

/// Proof of a pending login; required to resume it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthTicket {
    pub worker: WorkerId,
    token: Uuid,
}

/// Result of presenting a ticket.
#[derive(Debug, PartialEq, Eq)]
pub enum Resumed<T> {
    Live(T),
    /// The login outlived its TTL. The handle is handed back so the caller
    /// can close it and fail the login.
    Lapsed(T),
    /// Never issued, already resumed, or replaced by a newer login.
    Unknown,
}

impl<T> Resumed<T> {
    pub fn live(self) -> Option<T> {
        match self {
            Resumed::Live(handle) => Some(handle),
            _ => None,
        }
    }
}

struct Pending<T> {
    token: Uuid,
    handle: T,
    expires_at: Instant,
}

pub struct PendingAuthStore<T> {
    entries: Mutex<HashMap<WorkerId, Pending<T>>>,
    ttl: Duration,
}

impl<T> PendingAuthStore<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Park `handle` for `worker`. An earlier pending login for the same
    /// worker is replaced and its handle returned for the caller to close.
    pub fn begin(&self, worker: WorkerId, handle: T) -> (AuthTicket, Option<T>) {
        let token = Uuid::now_v7();
        let replaced = self.entries.lock().unwrap().insert(
            worker,
            Pending {
                token,
                handle,
                expires_at: Instant::now() + self.ttl,
            },
        );
        (AuthTicket { worker, token }, replaced.map(|p| p.handle))
    }

    /// Take the handle back. The entry is removed whether it is live or
    /// lapsed; a foreign ticket leaves it untouched.
    pub fn resume(&self, ticket: &AuthTicket) -> Resumed<T> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(&ticket.worker).is_none_or(|p| p.token != ticket.token) {
            return Resumed::Unknown;
        }
        match entries.remove(&ticket.worker) {
            Some(p) if p.expires_at > Instant::now() => Resumed::Live(p.handle),
            Some(p) => Resumed::Lapsed(p.handle),
            None => Resumed::Unknown,
        }
    }

    /// Drop and return expired handles so the caller can close them.
    pub fn evict_expired(&self) -> Vec<(WorkerId, T)> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let expired: Vec<WorkerId> = entries
            .iter()
            .filter(|(_, p)| p.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id).map(|p| (id, p.handle)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
