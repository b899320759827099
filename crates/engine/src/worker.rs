//! One running worker: a connected client plus the queue loop that services
//! its assignments.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fleet_core::{AssignmentId, WorkerId};
use fleet_infra::alerts::{AlertEvent, AlertSink};
use fleet_infra::queue::{
    ProcessorHandle, ProcessorStats, QueueProcessor, QueuedTask, TaskHandler, TaskKind, TaskQueue,
    TaskResult,
};
use fleet_infra::store::{SessionFactory, StoreResult};
use fleet_infra::transport::{ChatClient, TransportError};

use crate::distributor::Distributor;
use crate::profile::ProfileSync;

/// Payload of a [`TaskKind::ServiceAssignment`] task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAssignment {
    pub assignment_id: AssignmentId,
}

/// Queue routing key owned by `worker`.
pub fn routing_key(worker: WorkerId) -> String {
    format!("worker:{worker}")
}

/// Dependencies shared by every unit.
#[derive(Clone)]
pub struct UnitDeps {
    pub sessions: Arc<dyn SessionFactory>,
    pub queue: Arc<dyn TaskQueue>,
    pub profile_sync: Arc<dyn ProfileSync>,
    pub alerts: Arc<dyn AlertSink>,
    pub max_fails: u32,
    pub poll_interval: Duration,
}

pub struct WorkerUnit {
    worker_id: WorkerId,
    label: String,
    client: Arc<dyn ChatClient>,
    deps: UnitDeps,
    running: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
    processor: Option<ProcessorHandle>,
}

impl WorkerUnit {
    pub fn new(worker_id: WorkerId, label: impl Into<String>, client: Arc<dyn ChatClient>, deps: UnitDeps) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            worker_id,
            label: label.into(),
            client,
            deps,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(shutdown),
            processor: None,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn processor_stats(&self) -> ProcessorStats {
        self.processor
            .as_ref()
            .map(ProcessorHandle::stats)
            .unwrap_or_default()
    }

    pub fn start(&mut self) {
        if self.processor.is_some() {
            return;
        }
        let handler = Arc::new(ServiceAssignmentHandler {
            worker_id: self.worker_id,
            label: self.label.clone(),
            client: self.client.clone(),
            deps: self.deps.clone(),
            running: self.running.clone(),
            shutdown: self.shutdown.clone(),
        });
        let mut processor = QueueProcessor::new(self.deps.queue.clone(), self.deps.poll_interval);
        processor.register_handler(&TaskKind::ServiceAssignment, handler);

        let _ = self.shutdown.send(false);
        self.running.store(true, Ordering::SeqCst);
        self.processor = Some(processor.spawn(routing_key(self.worker_id), self.shutdown.subscribe()));
        info!(worker_id = %self.worker_id, label = %self.label, "worker started");
    }

    /// Stop the loop and disconnect. Returns `false` if the loop had to be
    /// aborted after `timeout`.
    pub async fn stop(&mut self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        let graceful = match self.processor.take() {
            Some(handle) => handle.join(timeout).await,
            None => true,
        };
        if !graceful {
            warn!(worker_id = %self.worker_id, "worker loop did not stop in time, aborted");
        }
        self.client.disconnect().await;
        info!(worker_id = %self.worker_id, "worker stopped");
        graceful
    }

    /// Running, loop alive and client connected.
    pub fn health_check(&self) -> bool {
        self.is_running()
            && self.processor.as_ref().is_some_and(|p| !p.is_finished())
            && self.client.is_connected()
    }
}

struct ServiceAssignmentHandler {
    worker_id: WorkerId,
    label: String,
    client: Arc<dyn ChatClient>,
    deps: UnitDeps,
    running: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
}

#[async_trait::async_trait]
impl TaskHandler for ServiceAssignmentHandler {
    async fn handle(&self, task: &QueuedTask) -> TaskResult {
        let request: ServiceAssignment = match task.payload_as() {
            Ok(request) => request,
            Err(e) => return TaskResult::Discard(format!("malformed payload: {e}")),
        };
        match self.service(request.assignment_id).await {
            Ok(result) => result,
            Err(e) => {
                error!(worker_id = %self.worker_id, assignment_id = %request.assignment_id, error = %e, "service failed");
                TaskResult::Failure(e.to_string())
            }
        }
    }
}

impl ServiceAssignmentHandler {
    async fn service(&self, assignment_id: AssignmentId) -> StoreResult<TaskResult> {
        let store = self.deps.sessions.open().await?;

        let Some(assignment) = store.assignments.get(assignment_id).await? else {
            return Ok(TaskResult::Discard("assignment no longer exists".into()));
        };
        if !assignment.is_active() || assignment.worker_id != self.worker_id {
            return Ok(TaskResult::Discard("assignment moved or inactive".into()));
        }
        let Some(campaign) = store
            .campaigns
            .get(assignment.campaign_id)
            .await?
            .filter(|c| c.is_active())
        else {
            return Ok(TaskResult::Discard("campaign not active".into()));
        };
        let Some(mut item) = store
            .items
            .get(assignment.work_item_id)
            .await?
            .filter(|i| i.is_available())
        else {
            return Ok(TaskResult::Discard("work item unavailable".into()));
        };
        let Some(worker) = store.workers.get(self.worker_id).await?.filter(|w| w.is_active()) else {
            return Ok(TaskResult::Discard("worker not active".into()));
        };

        if worker.remaining_hourly() == 0 || worker.remaining_daily() == 0 {
            debug!(worker_id = %self.worker_id, "at action limit, deferring task");
            return Ok(TaskResult::Failure("worker at action limit".into()));
        }

        let text = {
            let mut rng = rand::thread_rng();
            campaign.pick_template(&mut rng).map(str::to_string)
        };
        let Some(text) = text else {
            return Ok(TaskResult::Discard("campaign has no templates".into()));
        };

        let distributor = Distributor::new(store.clone(), self.deps.profile_sync.clone(), self.deps.max_fails);

        match self.post(&item.handle, &text).await {
            Ok((post_id, message_id)) => {
                distributor.handle_success(assignment_id, self.worker_id).await?;
                item.record_processed(post_id);
                store.items.save(&item).await?;
                store.workers.record_action(self.worker_id).await?;
                store.campaigns.record_result(campaign.id, true).await?;
                info!(
                    worker_id = %self.worker_id,
                    assignment_id = %assignment_id,
                    post_id,
                    message_id,
                    "assignment serviced"
                );
                Ok(TaskResult::Success)
            }
            Err(TransportError::FloodWait(wait)) => {
                warn!(worker_id = %self.worker_id, wait_secs = wait.as_secs(), "flood wait");
                Ok(TaskResult::Failure(format!("flood wait {}s", wait.as_secs())))
            }
            Err(TransportError::Banned) => {
                error!(worker_id = %self.worker_id, label = %self.label, "worker banned");
                if let Some(mut fresh) = store.workers.get(self.worker_id).await? {
                    fresh.mark_banned("banned by network");
                    store.workers.save(&fresh).await?;
                }
                store.campaigns.record_result(campaign.id, false).await?;
                let alert = AlertEvent::account_error(self.worker_id, &self.label, "banned");
                if !self.deps.alerts.notify(&alert).await {
                    warn!(worker_id = %self.worker_id, "ban alert not delivered");
                }
                self.running.store(false, Ordering::SeqCst);
                let _ = self.shutdown.send(true);
                Ok(TaskResult::Discard("worker banned".into()))
            }
            Err(TransportError::CommentsDisabled) => {
                warn!(worker_id = %self.worker_id, item_id = %item.id, "comments disabled");
                item.mark_no_comments();
                store.items.save(&item).await?;
                distributor.handle_failure(assignment_id, self.worker_id, "comments disabled").await?;
                store.campaigns.record_result(campaign.id, false).await?;
                Ok(TaskResult::Discard("comments disabled".into()))
            }
            Err(e) => {
                warn!(worker_id = %self.worker_id, assignment_id = %assignment_id, error = %e, "post failed");
                let reason = e.to_string();
                if let Some(outcome) = distributor.handle_failure(assignment_id, self.worker_id, &reason).await? {
                    if let Some(to) = outcome.swapped_to {
                        info!(assignment_id = %assignment_id, new_worker_id = %to, "assignment handed to another worker");
                    }
                }
                store.campaigns.record_result(campaign.id, false).await?;
                Ok(TaskResult::Discard(reason))
            }
        }
    }

    /// Comment under the latest post of `peer`.
    async fn post(&self, peer: &str, text: &str) -> Result<(i64, i64), TransportError> {
        let posts = self.client.fetch_recent(peer, 1).await?;
        let latest = posts
            .first()
            .ok_or_else(|| TransportError::Other(format!("{peer} has no posts")))?;
        let message_id = self.client.send_message(peer, text, Some(latest.id)).await?;
        Ok((latest.id, message_id))
    }
}
