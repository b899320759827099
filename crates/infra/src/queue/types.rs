//! Core task types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task kind for routing to handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Service one assignment: post to the assigned work item.
    ServiceAssignment,
    /// Generic/custom task
    Custom(String),
}

impl TaskKind {
    pub fn custom(kind: impl Into<String>) -> Self {
        Self::Custom(kind.into())
    }

    pub fn type_name(&self) -> &str {
        match self {
            TaskKind::ServiceAssignment => "service_assignment",
            TaskKind::Custom(kind) => kind,
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^retry
    #[default]
    Exponential,
    /// Linear backoff: base * retry
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = dead-letter on first failure)
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(3600),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the `retry`-th retry becomes eligible (1-indexed; the
    /// retry count is incremented before the delay is computed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(2_u32.saturating_pow(retry.min(31))),
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
        };
        delay.min(self.max_delay)
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

/// Arguments of one enqueue call.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub routing_key: String,
    /// Higher runs first.
    pub priority: i32,
    pub deduplicate: bool,
    pub delay: Duration,
}

impl NewTask {
    pub fn new(kind: TaskKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            routing_key: "default".to_string(),
            priority: 0,
            deduplicate: true,
            delay: Duration::ZERO,
        }
    }

    pub fn routed_to(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn allow_duplicates(mut self) -> Self {
        self.deduplicate = false;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Identity used for deduplication: kind plus canonical JSON payload.
    ///
    /// `serde_json` objects keep keys sorted, so equal payloads serialize to
    /// equal strings regardless of construction order.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.kind.type_name(), self.payload)
    }
}

/// A task as held by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub routing_key: String,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Not eligible for dequeue before this instant.
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl QueuedTask {
    pub fn from_new(task: NewTask, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            kind: task.kind,
            payload: task.payload,
            routing_key: task.routing_key,
            priority: task.priority,
            retry_count: 0,
            max_retries,
            enqueued_at: now,
            available_at: now + chrono_delay(task.delay),
            last_error: None,
        }
    }

    /// Sort score: lower runs first. Priority dominates, then enqueue time.
    pub fn score(&self) -> f64 {
        -(self.priority as f64) * 1e13 + self.enqueued_at.timestamp_millis() as f64
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

pub(crate) fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

/// What `fail` did with a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-queued; eligible again after `delay`.
    Retried { retry_count: u32, delay: Duration },
    /// Retries exhausted; moved to the dead-letter list.
    DeadLettered,
}

/// Result of running a handler.
#[derive(Debug)]
pub enum TaskResult {
    /// Task completed successfully
    Success,
    /// Task failed; the queue retries it with backoff or dead-letters it
    Failure(String),
    /// Task is no longer relevant; complete it without retry
    Discard(String),
}

/// Entry in the dead-letter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task: QueuedTask,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(task: QueuedTask, error: String) -> Self {
        Self {
            task,
            error,
            failed_at: Utc::now(),
        }
    }
}

/// Per-routing-key queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Waiting, including tasks whose backoff has not elapsed.
    pub queued: usize,
    pub processing: usize,
    pub dead: usize,
}

/// Queue tuning shared by all backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub dedup_ttl: Duration,
    pub dead_letter_cap: usize,
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(10),
            dedup_ttl: Duration::from_secs(3600),
            dead_letter_cap: 1000,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_retries,
            self.retry_base_delay,
            Duration::from_secs(3600),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_from_first_retry() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(20));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(40));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(80));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::exponential(50, Duration::from_secs(10), Duration::from_secs(60));
        assert_eq!(policy.delay_for_retry(40), Duration::from_secs(60));
    }

    #[test]
    fn fixed_and_linear_backoff() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(fixed.delay_for_retry(3), Duration::from_millis(500));

        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            ..RetryPolicy::default()
        };
        assert_eq!(linear.delay_for_retry(3), Duration::from_secs(30));
    }

    #[test]
    fn should_retry_respects_max_retries() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn dedup_key_ignores_field_order() {
        let a = NewTask::new(TaskKind::ServiceAssignment, serde_json::json!({"a": 1, "b": 2}));
        let b = NewTask::new(TaskKind::ServiceAssignment, serde_json::json!({"b": 2, "a": 1}));
        assert_eq!(a.dedup_key(), b.dedup_key());

        let c = NewTask::new(TaskKind::custom("other"), serde_json::json!({"a": 1, "b": 2}));
        assert_ne!(a.dedup_key(), c.dedup_key());
    }

    #[test]
    fn higher_priority_scores_lower() {
        let low = QueuedTask::from_new(NewTask::new(TaskKind::custom("x"), serde_json::json!({})), 3);
        let high = QueuedTask::from_new(
            NewTask::new(TaskKind::custom("x"), serde_json::json!({})).with_priority(5),
            3,
        );
        assert!(high.score() < low.score());
    }
}
