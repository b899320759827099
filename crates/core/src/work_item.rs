//! Work item entity: a public channel that workers service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::{CampaignId, OwnerId, WorkItemId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Imported, not yet checked.
    Pending,
    /// Reachable and accepting comments.
    Active,
    /// Private, deleted or otherwise unreachable.
    NoAccess,
    /// Reachable, but comments are disabled.
    NoComments,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub campaign_id: CampaignId,
    pub owner: OwnerId,
    /// Public handle without the leading `@`.
    pub handle: String,
    pub title: Option<String>,
    pub about: Option<String>,
    pub status: WorkItemStatus,
    pub error_message: Option<String>,
    /// Id of the last post that was serviced.
    pub last_processed: Option<i64>,
    pub actions_posted: u64,
    pub created_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn new(campaign_id: CampaignId, owner: OwnerId, handle: impl Into<String>) -> Self {
        Self {
            id: WorkItemId::new(),
            campaign_id,
            owner,
            handle: handle.into(),
            title: None,
            about: None,
            status: WorkItemStatus::Pending,
            error_message: None,
            last_processed: None,
            actions_posted: 0,
            created_at: Utc::now(),
            last_checked_at: None,
        }
    }

    /// Build an item from a user-supplied link (see [`parse_handle`]).
    pub fn from_link(campaign_id: CampaignId, owner: OwnerId, link: &str) -> DomainResult<Self> {
        Ok(Self::new(campaign_id, owner, parse_handle(link)?))
    }

    pub fn is_available(&self) -> bool {
        self.status == WorkItemStatus::Active
    }

    pub fn mark_active(&mut self, title: Option<String>) {
        self.status = WorkItemStatus::Active;
        if title.is_some() {
            self.title = title;
        }
        self.error_message = None;
        self.last_checked_at = Some(Utc::now());
    }

    pub fn mark_no_access(&mut self, reason: impl Into<String>) {
        self.status = WorkItemStatus::NoAccess;
        self.error_message = Some(reason.into());
        self.last_checked_at = Some(Utc::now());
    }

    pub fn mark_no_comments(&mut self) {
        self.status = WorkItemStatus::NoComments;
        self.error_message = Some("comments are disabled".to_string());
        self.last_checked_at = Some(Utc::now());
    }

    pub fn mark_error(&mut self, reason: impl Into<String>) {
        self.status = WorkItemStatus::Error;
        self.error_message = Some(reason.into());
        self.last_checked_at = Some(Utc::now());
    }

    pub fn record_processed(&mut self, marker: i64) {
        self.last_processed = Some(marker);
        self.actions_posted += 1;
    }
}

impl Entity for WorkItem {
    type Id = WorkItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Extract a public handle from `@name`, `t.me/name`, `https://t.me/name/42?x`
/// or a bare `name`.
///
/// Private invite links (`t.me/+...`, `t.me/joinchat/...`) are rejected since
/// they cannot be resolved to a public profile.
pub fn parse_handle(link: &str) -> DomainResult<String> {
    let mut rest = link.trim();
    for scheme in ["https://", "http://"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped;
        }
    }
    for host in ["www.t.me/", "t.me/", "telegram.me/"] {
        if let Some(stripped) = rest.strip_prefix(host) {
            rest = stripped;
            break;
        }
    }
    let rest = rest.strip_prefix('@').unwrap_or(rest);

    if rest.starts_with('+') || rest.starts_with("joinchat/") {
        return Err(DomainError::validation(format!("private link: {link}")));
    }

    let handle = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();

    if handle.is_empty() || !handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DomainError::validation(format!("not a public handle: {link}")));
    }
    Ok(handle.to_string())
}
