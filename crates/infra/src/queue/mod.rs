//! Priority task queue with deduplication, retry backoff and dead-lettering.
//!
//! ## Design
//!
//! - Tasks are partitioned by routing key (one key per worker)
//! - Ordering is `(-priority, enqueue time)`
//! - A dequeued task sits in a processing set until completed or failed
//! - Failed tasks are re-queued with exponential backoff, then dead-lettered
//!
//! ## Components
//!
//! - `TaskQueue`: the queue contract
//! - `InMemoryTaskQueue` / `RedisTaskQueue`: backends
//! - `QueueProcessor`: per-routing-key poll loop dispatching to handlers

pub mod memory;
pub mod processor;
#[cfg(feature = "redis")]
pub mod redis;
pub mod types;

pub use memory::InMemoryTaskQueue;
pub use processor::{ProcessorHandle, ProcessorStats, QueueProcessor, TaskHandler};
#[cfg(feature = "redis")]
pub use self::redis::RedisTaskQueue;
pub use types::{
    BackoffStrategy, DeadLetterEntry, FailOutcome, NewTask, QueueConfig, QueueStats, QueuedTask,
    RetryPolicy, TaskId, TaskKind, TaskResult,
};

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<::redis::RedisError> for QueueError {
    fn from(err: ::redis::RedisError) -> Self {
        QueueError::Backend(err.to_string())
    }
}

/// Task queue abstraction.
#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    /// Returns `None` when deduplication dropped the task.
    async fn enqueue(&self, task: NewTask) -> Result<Option<TaskId>, QueueError>;

    /// Pop the best eligible task for `routing_key` and mark it processing.
    async fn dequeue(&self, routing_key: &str) -> Result<Option<QueuedTask>, QueueError>;

    async fn complete(&self, task: &QueuedTask) -> Result<(), QueueError>;

    /// Re-queue with backoff, or dead-letter once retries are exhausted.
    async fn fail(&self, task: &QueuedTask, error: &str) -> Result<FailOutcome, QueueError>;

    async fn stats(&self, routing_key: &str) -> Result<QueueStats, QueueError>;

    /// Newest first.
    async fn dead_letters(
        &self,
        routing_key: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError>;

    /// Put tasks left in processing (e.g. by a crash) back on their queues.
    async fn recover_processing(&self) -> Result<usize, QueueError>;
}
