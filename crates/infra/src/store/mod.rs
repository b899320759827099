//! Repository contracts for workers, work items, assignments and campaigns.
//!
//! Components never hold a repository across work cycles: they open a fresh
//! [`Store`] from a [`SessionFactory`] per unit of work.

pub mod memory;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use fleet_core::{
    Assignment, AssignmentId, Campaign, CampaignId, OwnerId, WorkItem, WorkItemId, Worker,
    WorkerId, WorkerStatus,
};

pub use memory::{InMemorySessionFactory, InMemoryStore};

/// Repository error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    /// A uniqueness rule was violated (e.g. a second live assignment per item).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait::async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn get(&self, id: WorkerId) -> StoreResult<Option<Worker>>;

    /// Insert or replace.
    async fn save(&self, worker: &Worker) -> StoreResult<()>;

    /// Also deletes the worker's assignments. Returns `false` if absent.
    async fn delete(&self, id: WorkerId) -> StoreResult<bool>;

    async fn list_by_status(&self, status: WorkerStatus) -> StoreResult<Vec<Worker>>;

    /// Active workers of `owner` with remaining capacity, least used first.
    async fn list_available(&self, owner: OwnerId) -> StoreResult<Vec<Worker>>;

    /// Count one action against the worker's limits in place. Returns the
    /// updated worker, or `None` if absent.
    async fn record_action(&self, id: WorkerId) -> StoreResult<Option<Worker>>;

    /// Zero every hourly counter. Returns how many workers changed.
    async fn reset_hourly(&self) -> StoreResult<usize>;

    /// Give every worker without a daily reset hour a random one in 0..24.
    async fn initialize_daily_reset_hours(&self) -> StoreResult<usize>;

    /// Zero the daily counter of workers whose reset hour is `hour`.
    async fn reset_daily(&self, hour: u8) -> StoreResult<usize>;
}

#[async_trait::async_trait]
pub trait WorkItemRepository: Send + Sync {
    async fn get(&self, id: WorkItemId) -> StoreResult<Option<WorkItem>>;

    async fn save(&self, item: &WorkItem) -> StoreResult<()>;

    /// Also deletes the item's assignments. Returns `false` if absent.
    async fn delete(&self, id: WorkItemId) -> StoreResult<bool>;

    /// Creation order.
    async fn list_by_campaign(&self, campaign: CampaignId) -> StoreResult<Vec<WorkItem>>;

    /// Active items of `campaign` with no active or blocked assignment, in
    /// creation order.
    async fn list_unassigned(&self, campaign: CampaignId) -> StoreResult<Vec<WorkItem>>;
}

#[async_trait::async_trait]
pub trait AssignmentRepository: Send + Sync {
    async fn get(&self, id: AssignmentId) -> StoreResult<Option<Assignment>>;

    /// Rejects with [`StoreError::Conflict`] if the item already has an active
    /// or blocked assignment in the same campaign.
    async fn insert(&self, assignment: &Assignment) -> StoreResult<()>;

    /// Replace an existing assignment.
    async fn save(&self, assignment: &Assignment) -> StoreResult<()>;

    /// Replace `assignment` only while the stored row still equals `seen`.
    /// Returns `false` and writes nothing if another writer got there first.
    async fn save_if_unchanged(&self, assignment: &Assignment, seen: &Assignment) -> StoreResult<bool>;

    async fn delete(&self, id: AssignmentId) -> StoreResult<bool>;

    /// Oldest first.
    async fn list_by_campaign(&self, campaign: CampaignId) -> StoreResult<Vec<Assignment>>;

    /// Active assignments of `worker`, optionally within one campaign, oldest first.
    async fn list_active_by_worker(
        &self,
        worker: WorkerId,
        campaign: Option<CampaignId>,
    ) -> StoreResult<Vec<Assignment>>;

    async fn count_active_by_worker(&self, worker: WorkerId) -> StoreResult<usize>;

    /// Blocked, or `fail_count >= threshold`, oldest first.
    async fn list_needing_swap(
        &self,
        campaign: CampaignId,
        threshold: u32,
    ) -> StoreResult<Vec<Assignment>>;
}

#[async_trait::async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn get(&self, id: CampaignId) -> StoreResult<Option<Campaign>>;

    async fn save(&self, campaign: &Campaign) -> StoreResult<()>;

    async fn list_active(&self) -> StoreResult<Vec<Campaign>>;

    /// Bump the action counters in place. Returns `false` if absent.
    async fn record_result(&self, id: CampaignId, success: bool) -> StoreResult<bool>;

    /// Stamp the last batch time in place. Returns `false` if absent.
    async fn record_batch_sent(&self, id: CampaignId, at: DateTime<Utc>) -> StoreResult<bool>;
}

/// One unit-of-work view over all repositories.
#[derive(Clone)]
pub struct Store {
    pub workers: Arc<dyn WorkerRepository>,
    pub items: Arc<dyn WorkItemRepository>,
    pub assignments: Arc<dyn AssignmentRepository>,
    pub campaigns: Arc<dyn CampaignRepository>,
}

/// Opens short-lived store sessions.
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> StoreResult<Store>;
}
