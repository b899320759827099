//! Worker login hand-off.
//!
//! A login is started with a half-authorized client and finished later with
//! the session bytes it produced. Between the two steps the client is parked
//! in a [`PendingAuthStore`] and dropped once the TTL lapses.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use fleet_core::{DomainError, Worker, WorkerId, WorkerStatus};
use fleet_infra::auth_session::{AuthTicket, PendingAuthStore, Resumed};
use fleet_infra::cipher::{CipherError, SessionCipher};
use fleet_infra::store::{SessionFactory, Store, StoreError};
use fleet_infra::transport::ChatClient;

#[derive(Debug, thiserror::Error)]
pub enum OnboardingError {
    #[error("worker {0} not found")]
    WorkerNotFound(WorkerId),
    #[error("login expired or superseded")]
    Expired,
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Onboarding {
    sessions: Arc<dyn SessionFactory>,
    cipher: Arc<dyn SessionCipher>,
    pending: PendingAuthStore<Arc<dyn ChatClient>>,
}

impl Onboarding {
    pub fn new(sessions: Arc<dyn SessionFactory>, cipher: Arc<dyn SessionCipher>, ttl: Duration) -> Self {
        Self {
            sessions,
            cipher,
            pending: PendingAuthStore::new(ttl),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Move the worker to `authenticating` and park `client` until the login
    /// completes. Restarting a login closes the client of the earlier attempt.
    pub async fn begin(&self, worker_id: WorkerId, client: Arc<dyn ChatClient>) -> Result<AuthTicket, OnboardingError> {
        let store = self.sessions.open().await?;
        let mut worker = store
            .workers
            .get(worker_id)
            .await?
            .ok_or(OnboardingError::WorkerNotFound(worker_id))?;
        worker.begin_auth()?;
        store.workers.save(&worker).await?;
        let (ticket, replaced) = self.pending.begin(worker_id, client);
        if let Some(old) = replaced {
            old.disconnect().await;
            info!(worker_id = %worker_id, "login restarted");
        } else {
            info!(worker_id = %worker_id, "login started");
        }
        Ok(ticket)
    }

    /// Seal `session` onto the worker and activate it.
    pub async fn complete(&self, ticket: &AuthTicket, session: &[u8]) -> Result<Worker, OnboardingError> {
        let client = match self.pending.resume(ticket) {
            Resumed::Live(client) => client,
            Resumed::Lapsed(client) => {
                let store = self.sessions.open().await?;
                self.expire(&store, ticket.worker, client).await?;
                return Err(OnboardingError::Expired);
            }
            Resumed::Unknown => return Err(OnboardingError::Expired),
        };
        client.disconnect().await;

        let store = self.sessions.open().await?;
        let mut worker = store
            .workers
            .get(ticket.worker)
            .await?
            .ok_or(OnboardingError::WorkerNotFound(ticket.worker))?;
        worker.activate(self.cipher.encrypt(session)?)?;
        store.workers.save(&worker).await?;
        info!(worker_id = %worker.id, "login completed");
        Ok(worker)
    }

    /// Drop lapsed logins and flag their workers. Returns how many lapsed.
    pub async fn evict_expired(&self) -> Result<usize, OnboardingError> {
        let expired = self.pending.evict_expired();
        if expired.is_empty() {
            return Ok(0);
        }
        let store = self.sessions.open().await?;
        let lapsed = expired.len();
        for (worker_id, client) in expired {
            self.expire(&store, worker_id, client).await?;
        }
        Ok(lapsed)
    }

    async fn expire(&self, store: &Store, worker_id: WorkerId, client: Arc<dyn ChatClient>) -> Result<(), OnboardingError> {
        client.disconnect().await;
        if let Some(mut worker) = store.workers.get(worker_id).await? {
            if worker.status == WorkerStatus::Authenticating {
                worker.mark_error("login timed out");
                store.workers.save(&worker).await?;
            }
        }
        warn!(worker_id = %worker_id, "pending login expired");
        Ok(())
    }
}
