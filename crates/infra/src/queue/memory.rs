//! In-memory task queue for tests/dev.

use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::types::{
    DeadLetterEntry, FailOutcome, NewTask, QueueConfig, QueueStats, QueuedTask, RetryPolicy,
    TaskId, chrono_delay,
};
use super::{QueueError, TaskQueue};

#[derive(Debug)]
struct Pending {
    seq: u64,
    ready_at: Instant,
    task: QueuedTask,
}

#[derive(Debug, Default)]
struct Lane {
    pending: Vec<Pending>,
    processing: HashMap<TaskId, (u64, QueuedTask)>,
    dead: VecDeque<DeadLetterEntry>,
    dedup: HashMap<String, Instant>,
}

#[derive(Debug, Default)]
struct State {
    lanes: HashMap<String, Lane>,
    next_seq: u64,
}

/// In-memory queue.
///
/// Eligibility and dedup windows use `tokio::time::Instant`, so tests with a
/// paused clock can step through backoff delays.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    state: Mutex<State>,
    config: QueueConfig,
    policy: RetryPolicy,
}

impl InMemoryTaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            policy: config.retry_policy(),
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn arc(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Tasks waiting on `routing_key`, in dequeue order, ignoring backoff.
    pub fn pending(&self, routing_key: &str) -> Vec<QueuedTask> {
        let state = self.state.lock().unwrap();
        let Some(lane) = state.lanes.get(routing_key) else {
            return Vec::new();
        };
        let mut entries: Vec<_> = lane.pending.iter().collect();
        entries.sort_by_key(|p| (Reverse(p.task.priority), p.seq));
        entries.into_iter().map(|p| p.task.clone()).collect()
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait::async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: NewTask) -> Result<Option<TaskId>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let seq = state.next_seq;
        let lane = state.lanes.entry(task.routing_key.clone()).or_default();

        if task.deduplicate {
            lane.dedup.retain(|_, expires| *expires > now);
            let key = task.dedup_key();
            if lane.dedup.contains_key(&key) {
                debug!(routing_key = %task.routing_key, dedup_key = %key, "duplicate task dropped");
                return Ok(None);
            }
            lane.dedup.insert(key, now + self.config.dedup_ttl);
        }

        let ready_at = now + task.delay;
        let queued = QueuedTask::from_new(task, self.config.max_retries);
        let id = queued.id;
        lane.pending.push(Pending {
            seq,
            ready_at,
            task: queued,
        });
        state.next_seq += 1;
        Ok(Some(id))
    }

    async fn dequeue(&self, routing_key: &str) -> Result<Option<QueuedTask>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let Some(lane) = state.lanes.get_mut(routing_key) else {
            return Ok(None);
        };

        let best = lane
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.ready_at <= now)
            .min_by_key(|(_, p)| (Reverse(p.task.priority), p.seq))
            .map(|(idx, _)| idx);

        Ok(best.map(|idx| {
            let entry = lane.pending.swap_remove(idx);
            lane.processing
                .insert(entry.task.id, (entry.seq, entry.task.clone()));
            entry.task
        }))
    }

    async fn complete(&self, task: &QueuedTask) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if let Some(lane) = state.lanes.get_mut(&task.routing_key) {
            lane.processing.remove(&task.id);
        }
        Ok(())
    }

    async fn fail(&self, task: &QueuedTask, error: &str) -> Result<FailOutcome, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let fallback_seq = state.next_seq;
        let lane = state.lanes.entry(task.routing_key.clone()).or_default();
        let seq = lane
            .processing
            .remove(&task.id)
            .map(|(seq, _)| seq)
            .unwrap_or(fallback_seq);

        if task.retry_count < task.max_retries {
            let retry_count = task.retry_count + 1;
            let delay = self.policy.delay_for_retry(retry_count);
            let mut retried = task.clone();
            retried.retry_count = retry_count;
            retried.available_at = Utc::now() + chrono_delay(delay);
            retried.last_error = Some(error.to_string());
            lane.pending.push(Pending {
                seq,
                ready_at: now + delay,
                task: retried,
            });
            debug!(task_id = %task.id, retry_count, delay_secs = delay.as_secs(), "task scheduled for retry");
            return Ok(FailOutcome::Retried { retry_count, delay });
        }

        warn!(task_id = %task.id, kind = task.kind.type_name(), error, "task dead-lettered");
        lane.dead
            .push_front(DeadLetterEntry::new(task.clone(), error.to_string()));
        lane.dead.truncate(self.config.dead_letter_cap);
        Ok(FailOutcome::DeadLettered)
    }

    async fn stats(&self, routing_key: &str) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .lanes
            .get(routing_key)
            .map(|lane| QueueStats {
                queued: lane.pending.len(),
                processing: lane.processing.len(),
                dead: lane.dead.len(),
            })
            .unwrap_or_default())
    }

    async fn dead_letters(
        &self,
        routing_key: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .lanes
            .get(routing_key)
            .map(|lane| lane.dead.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn recover_processing(&self) -> Result<usize, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let mut recovered = 0;
        for lane in state.lanes.values_mut() {
            for (_, (seq, task)) in lane.processing.drain() {
                lane.pending.push(Pending {
                    seq,
                    ready_at: now,
                    task,
                });
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
