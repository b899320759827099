//! Per-routing-key queue consumer with handler dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::types::{FailOutcome, QueuedTask, TaskKind, TaskResult};
use super::{QueueError, TaskQueue};

/// Handles tasks of one kind.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &QueuedTask) -> TaskResult;
}

/// Processor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProcessorStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub discarded: u64,
    pub dead_lettered: u64,
}

/// Dequeues from one routing key and dispatches by `TaskKind`.
///
/// Unknown kinds are completed without action: retrying cannot help when no
/// handler exists.
pub struct QueueProcessor {
    queue: Arc<dyn TaskQueue>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    poll_interval: Duration,
    stats: Arc<Mutex<ProcessorStats>>,
}

impl QueueProcessor {
    pub fn new(queue: Arc<dyn TaskQueue>, poll_interval: Duration) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            poll_interval,
            stats: Arc::new(Mutex::new(ProcessorStats::default())),
        }
    }

    pub fn register_handler(&mut self, kind: &TaskKind, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(kind.type_name().to_string(), handler);
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats.lock().unwrap().clone()
    }

    /// Process at most one task. Returns `false` when nothing was eligible.
    pub async fn process_next(&self, routing_key: &str) -> Result<bool, QueueError> {
        let Some(task) = self.queue.dequeue(routing_key).await? else {
            return Ok(false);
        };
        debug!(task_id = %task.id, kind = task.kind.type_name(), routing_key, "claimed task");

        let Some(handler) = self.handlers.get(task.kind.type_name()) else {
            warn!(task_id = %task.id, kind = task.kind.type_name(), "no handler for task kind");
            self.queue.complete(&task).await?;
            self.bump(|s| s.discarded += 1);
            return Ok(true);
        };

        match handler.handle(&task).await {
            TaskResult::Success => {
                self.queue.complete(&task).await?;
                self.bump(|s| s.succeeded += 1);
            }
            TaskResult::Discard(reason) => {
                debug!(task_id = %task.id, reason = %reason, "task discarded");
                self.queue.complete(&task).await?;
                self.bump(|s| s.discarded += 1);
            }
            TaskResult::Failure(err) => {
                let outcome = self.queue.fail(&task, &err).await?;
                self.bump(|s| {
                    s.failed += 1;
                    if outcome == FailOutcome::DeadLettered {
                        s.dead_lettered += 1;
                    }
                });
            }
        }
        Ok(true)
    }

    fn bump(&self, f: impl FnOnce(&mut ProcessorStats)) {
        let mut stats = self.stats.lock().unwrap();
        stats.processed += 1;
        f(&mut stats);
    }

    /// Run the poll loop on a tokio task until `shutdown` flips to `true`.
    pub fn spawn(self, routing_key: String, mut shutdown: watch::Receiver<bool>) -> ProcessorHandle {
        let stats = self.stats.clone();
        let join = tokio::spawn(async move {
            info!(routing_key = %routing_key, "queue processor started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match self.process_next(&routing_key).await {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => error!(routing_key = %routing_key, error = %e, "queue poll failed"),
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
            info!(routing_key = %routing_key, "queue processor stopped");
        });
        ProcessorHandle { join, stats }
    }
}

/// Handle to a running processor loop.
#[derive(Debug)]
pub struct ProcessorHandle {
    join: JoinHandle<()>,
    stats: Arc<Mutex<ProcessorStats>>,
}

impl ProcessorHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats.lock().unwrap().clone()
    }

    /// Wait up to `timeout` for the loop to exit, aborting it otherwise.
    /// Returns `true` on a clean exit.
    pub async fn join(self, timeout: Duration) -> bool {
        let abort = self.join.abort_handle();
        match tokio::time::timeout(timeout, self.join).await {
            Ok(_) => true,
            Err(_) => {
                abort.abort();
                false
            }
        }
    }
}
