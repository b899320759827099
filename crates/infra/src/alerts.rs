//! Operator alerts for account errors, worker restarts and campaign issues.
//!
//! Delivery is best effort: a failed notify is logged by the caller and
//! never aborts the operation that raised it.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use fleet_core::{CampaignId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    AccountError,
    WorkerRestart,
    CampaignIssue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub details: serde_json::Value,
    pub raised_at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(kind: AlertKind, details: serde_json::Value) -> Self {
        Self {
            kind,
            details,
            raised_at: Utc::now(),
        }
    }

    pub fn account_error(worker: WorkerId, label: &str, error: &str) -> Self {
        Self::new(
            AlertKind::AccountError,
            json!({ "worker_id": worker.to_string(), "label": label, "error": error }),
        )
    }

    pub fn worker_restart(worker: WorkerId, reason: &str) -> Self {
        Self::new(
            AlertKind::WorkerRestart,
            json!({ "worker_id": worker.to_string(), "reason": reason }),
        )
    }

    pub fn campaign_issue(campaign: CampaignId, issue: &str) -> Self {
        Self::new(
            AlertKind::CampaignIssue,
            json!({ "campaign_id": campaign.to_string(), "issue": issue }),
        )
    }
}

#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    /// Returns `false` if the alert could not be delivered.
    async fn notify(&self, event: &AlertEvent) -> bool;
}

/// Emits alerts as structured log records.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait::async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, event: &AlertEvent) -> bool {
        warn!(kind = ?event.kind, details = %event.details, "operator alert");
        true
    }
}

/// Keeps every alert in memory.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    events: Mutex<Vec<AlertEvent>>,
    reject: bool,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that records but reports every delivery as failed.
    pub fn rejecting() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            reject: true,
        }
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: AlertKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

#[async_trait::async_trait]
impl AlertSink for RecordingAlertSink {
    async fn notify(&self, event: &AlertEvent) -> bool {
        self.events.lock().unwrap().push(event.clone());
        !self.reject
    }
}
