//! Assignment entity: binds one work item to one worker within a campaign.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::id::{AssignmentId, CampaignId, OwnerId, WorkItemId, WorkerId};

/// Consecutive failures after which an assignment is handed to another worker.
pub const MAX_FAILS_BEFORE_SWAP: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    /// Failure threshold reached and no swap target was available.
    Blocked,
    /// Superseded by a later assignment for the same item.
    Swapped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub campaign_id: CampaignId,
    pub work_item_id: WorkItemId,
    pub worker_id: WorkerId,
    pub owner: OwnerId,
    pub status: AssignmentStatus,
    pub fail_count: u32,
    pub swap_count: u32,
    pub previous_worker: Option<WorkerId>,
    pub assigned_at: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Assignment {
    pub fn new(
        campaign_id: CampaignId,
        work_item_id: WorkItemId,
        worker_id: WorkerId,
        owner: OwnerId,
    ) -> Self {
        Self {
            id: AssignmentId::new(),
            campaign_id,
            work_item_id,
            worker_id,
            owner,
            status: AssignmentStatus::Active,
            fail_count: 0,
            swap_count: 0,
            previous_worker: None,
            assigned_at: Utc::now(),
            last_activity_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AssignmentStatus::Active
    }

    /// Active and blocked assignments both hold their item; no other
    /// assignment for the same item may exist alongside them.
    pub fn occupies_item(&self) -> bool {
        matches!(self.status, AssignmentStatus::Active | AssignmentStatus::Blocked)
    }

    /// Count one failure. Returns `true` once `threshold` is reached.
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        self.fail_count += 1;
        self.fail_count >= threshold
    }

    pub fn record_success(&mut self) {
        self.fail_count = 0;
        self.last_activity_at = Some(Utc::now());
    }

    pub fn needs_swap(&self, threshold: u32) -> bool {
        self.status == AssignmentStatus::Blocked || self.fail_count >= threshold
    }

    /// Hand the item to `new_worker`, remembering who held it before.
    pub fn swap_worker(&mut self, new_worker: WorkerId) {
        self.previous_worker = Some(self.worker_id);
        self.worker_id = new_worker;
        self.status = AssignmentStatus::Active;
        self.fail_count = 0;
        self.swap_count += 1;
        self.assigned_at = Utc::now();
    }

    pub fn mark_blocked(&mut self) {
        self.status = AssignmentStatus::Blocked;
    }

    pub fn mark_failed(&mut self) {
        self.status = AssignmentStatus::Failed;
    }
}

impl Entity for Assignment {
    type Id = AssignmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
