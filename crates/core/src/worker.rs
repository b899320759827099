//! Worker entity: one automated account and its rate counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::{OwnerId, WorkerId};

/// Lifecycle status of a worker account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Created, no session yet.
    Pending,
    /// An authentication flow is in progress.
    Authenticating,
    /// Has a session and may take work.
    Active,
    /// Temporarily excluded by an operator.
    Paused,
    /// Banned by the remote network. Terminal.
    Banned,
    /// Last operation left the account unusable.
    Error,
}

/// Per-worker rate and load limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLimits {
    pub hourly_actions: u32,
    pub daily_actions: u32,
    /// Cap on concurrently held assignments; `None` means unbounded.
    pub max_assignments: Option<u32>,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            hourly_actions: 30,
            daily_actions: 20,
            max_assignments: None,
        }
    }
}

/// A worker account.
///
/// The current load (number of active assignments) is deliberately not a
/// field: it is always counted from the assignment store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub owner: OwnerId,
    pub label: String,
    pub status: WorkerStatus,
    /// Encrypted transport session, opaque to the domain.
    pub session: Option<Vec<u8>>,
    pub limits: WorkerLimits,
    pub hourly_actions: u32,
    pub daily_actions: u32,
    /// UTC hour at which the daily counter is reset for this worker.
    pub daily_reset_hour: Option<u8>,
    pub last_action_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(owner: OwnerId, label: impl Into<String>) -> Self {
        Self {
            id: WorkerId::new(),
            owner,
            label: label.into(),
            status: WorkerStatus::Pending,
            session: None,
            limits: WorkerLimits::default(),
            hourly_actions: 0,
            daily_actions: 0,
            daily_reset_hour: None,
            last_action_at: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_limits(mut self, limits: WorkerLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkerStatus::Active
    }

    /// Whether the worker can take on more work given its current `load`.
    pub fn has_capacity(&self, load: usize) -> bool {
        self.is_active()
            && self.hourly_actions < self.limits.hourly_actions
            && self.daily_actions < self.limits.daily_actions
            && self
                .limits
                .max_assignments
                .is_none_or(|max| load < max as usize)
    }

    /// Whether one more assignment fits under `max_assignments`.
    pub fn can_hold(&self, load: usize) -> bool {
        self.limits
            .max_assignments
            .is_none_or(|max| load < max as usize)
    }

    pub fn remaining_daily(&self) -> u32 {
        self.limits.daily_actions.saturating_sub(self.daily_actions)
    }

    pub fn remaining_hourly(&self) -> u32 {
        self.limits.hourly_actions.saturating_sub(self.hourly_actions)
    }

    pub fn record_action(&mut self) {
        self.hourly_actions += 1;
        self.daily_actions += 1;
        self.last_action_at = Some(Utc::now());
    }

    pub fn reset_hourly(&mut self) {
        self.hourly_actions = 0;
    }

    pub fn reset_daily(&mut self) {
        self.daily_actions = 0;
    }

    /// Also valid while authenticating: a login can be restarted.
    pub fn begin_auth(&mut self) -> DomainResult<()> {
        match self.status {
            WorkerStatus::Pending | WorkerStatus::Error | WorkerStatus::Authenticating => {
                self.status = WorkerStatus::Authenticating;
                Ok(())
            }
            other => Err(DomainError::transition(format!(
                "cannot start auth from {other:?}"
            ))),
        }
    }

    /// Store a fresh session and make the worker eligible for work.
    pub fn activate(&mut self, session: Vec<u8>) -> DomainResult<()> {
        if self.status == WorkerStatus::Banned {
            return Err(DomainError::transition("banned worker cannot be activated"));
        }
        self.session = Some(session);
        self.status = WorkerStatus::Active;
        self.error_message = None;
        Ok(())
    }

    pub fn pause(&mut self) -> DomainResult<()> {
        if self.status != WorkerStatus::Active {
            return Err(DomainError::transition("only active workers can be paused"));
        }
        self.status = WorkerStatus::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> DomainResult<()> {
        if self.status != WorkerStatus::Paused {
            return Err(DomainError::transition("only paused workers can be resumed"));
        }
        self.status = WorkerStatus::Active;
        Ok(())
    }

    pub fn mark_banned(&mut self, reason: impl Into<String>) {
        self.status = WorkerStatus::Banned;
        self.error_message = Some(reason.into());
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = WorkerStatus::Error;
        self.error_message = Some(message.into());
    }
}

impl Entity for Worker {
    type Id = WorkerId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
