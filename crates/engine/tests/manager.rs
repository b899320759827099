//! Worker manager lifecycle against the loopback transport.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fleet_core::{Assignment, AssignmentId, AssignmentStatus, Worker, WorkerId, WorkerStatus};
use fleet_engine::{ManagerConfig, ServiceAssignment, routing_key};
use fleet_infra::alerts::AlertKind;
use fleet_infra::config::{SchedulerTimings, TaskTiming};
use fleet_infra::lock::DISTRIBUTE_LOCK;
use fleet_infra::queue::{NewTask, TaskKind, TaskQueue};
use fleet_infra::store::Store;
use fleet_infra::transport::{
    ChatClient, ChatTransport, LoopbackTransport, PostRecord, ProfileSnapshot, TransportError,
};

use common::{Fleet, GatedTransport};

async fn settle(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

async fn enqueue_service(fleet: &Fleet, worker: WorkerId, assignment: AssignmentId) {
    let task = NewTask::new(
        TaskKind::ServiceAssignment,
        serde_json::json!(ServiceAssignment { assignment_id: assignment }),
    )
    .routed_to(routing_key(worker))
    .allow_duplicates();
    fleet.queue.enqueue(task).await.unwrap();
}

/// Maintenance timings slow enough that nothing but the code under test
/// starts or restarts workers.
fn quiet_timings() -> SchedulerTimings {
    SchedulerTimings {
        health_check: TaskTiming::new(3600, 0.0),
        sync_workers: TaskTiming::new(3600, 0.0),
        ..SchedulerTimings::default()
    }
}

/// Client whose read hands the assignment to `new_holder` before failing,
/// as a rebalance landing mid-send would.
struct HandedOverMidSend {
    store: Store,
    assignment: AssignmentId,
    new_holder: WorkerId,
    connected: AtomicBool,
}

#[async_trait::async_trait]
impl ChatClient for HandedOverMidSend {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_message(&self, _: &str, _: &str, _: Option<i64>) -> Result<i64, TransportError> {
        Err(TransportError::Other("unreachable".into()))
    }

    async fn fetch_recent(&self, _: &str, _: usize) -> Result<Vec<PostRecord>, TransportError> {
        let mut a = self.store.assignments.get(self.assignment).await.unwrap().unwrap();
        a.swap_worker(self.new_holder);
        self.store.assignments.save(&a).await.unwrap();
        Err(TransportError::Other("timeout".into()))
    }

    async fn fetch_profile(&self, _: &str) -> Result<ProfileSnapshot, TransportError> {
        Ok(ProfileSnapshot::default())
    }

    async fn update_profile(&self, _: &ProfileSnapshot) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

struct HandOverTransport {
    inner: LoopbackTransport,
    worker: WorkerId,
    client: Arc<HandedOverMidSend>,
}

#[async_trait::async_trait]
impl ChatTransport for HandOverTransport {
    async fn connect(&self, worker: &Worker, session: &[u8]) -> Result<Arc<dyn ChatClient>, TransportError> {
        if worker.id == self.worker {
            return Ok(self.client.clone());
        }
        self.inner.connect(worker, session).await
    }
}

#[tokio::test(start_paused = true)]
async fn batch_is_dispatched_and_serviced() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let w2 = fleet.worker("w2").await;
    let campaign = fleet.campaign().await;
    fleet.items(&campaign, 3).await;
    let manager = fleet.manager(fleet.config());

    assert!(manager.start_worker(w1.id).await);
    assert!(manager.start_worker(w2.id).await);

    let summary = manager.distribute_tick().await.unwrap().unwrap();
    assert_eq!(summary.campaigns, 1);
    assert_eq!(summary.assigned, 3);
    assert_eq!(summary.dispatched, 3);

    settle(10).await;

    let sent = fleet.transport.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|m| m.text == "nice post" && m.reply_to == Some(3)));

    let stored = fleet.store.campaigns.get(campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.successful_actions, 3);
    assert!(stored.schedule.last_batch_at.is_some());

    let w1 = fleet.store.workers.get(w1.id).await.unwrap().unwrap();
    let w2 = fleet.store.workers.get(w2.id).await.unwrap().unwrap();
    assert_eq!(w1.hourly_actions + w2.hourly_actions, 3);
    assert_eq!(w1.daily_actions + w2.daily_actions, 3);

    // The batch interval has not elapsed yet.
    let again = manager.distribute_tick().await.unwrap().unwrap();
    assert_eq!(again.dispatched, 0);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn batch_is_capped_by_remaining_actions() {
    let fleet = Fleet::new();
    let mut w = fleet.worker("w1").await;
    w.hourly_actions = w.limits.hourly_actions - 2;
    fleet.store.workers.save(&w).await.unwrap();
    let campaign = fleet.campaign().await;
    fleet.items(&campaign, 5).await;
    let manager = fleet.manager(fleet.config());
    assert!(manager.start_worker(w.id).await);

    let summary = manager.distribute_tick().await.unwrap().unwrap();

    assert_eq!(summary.assigned, 5);
    assert_eq!(summary.dispatched, 2);
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn held_lock_skips_distribution() {
    let fleet = Fleet::new();
    fleet.worker("w1").await;
    let campaign = fleet.campaign().await;
    fleet.items(&campaign, 2).await;
    let manager = fleet.manager(fleet.config());

    let other = fleet.locks.create_lock(DISTRIBUTE_LOCK, Duration::from_secs(30));
    assert!(other.acquire().await);

    assert_eq!(manager.distribute_tick().await.unwrap(), None);
    assert_eq!(fleet.store.assignments.list_by_campaign(campaign.id).await.unwrap().len(), 0);

    assert!(other.release().await);
    assert!(manager.distribute_tick().await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn start_worker_rejections() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let w2 = fleet.worker("w2").await;
    let w3 = fleet.worker("w3").await;
    let mut paused = fleet.worker("paused").await;
    paused.pause().unwrap();
    fleet.store.workers.save(&paused).await.unwrap();
    fleet.transport.refuse_connect(w3.id);

    let manager = fleet.manager(ManagerConfig {
        max_workers: 2,
        ..fleet.config()
    });

    assert!(!manager.start_worker(paused.id).await);
    assert!(!manager.start_worker(w3.id).await);
    assert_eq!(fleet.alerts.count(AlertKind::AccountError), 1);

    assert!(manager.start_worker(w1.id).await);
    assert!(!manager.start_worker(w1.id).await);
    assert!(manager.start_worker(w2.id).await);

    let extra = fleet.worker("extra").await;
    assert!(!manager.start_worker(extra.id).await);

    let stats = manager.get_stats().await;
    assert_eq!(stats.total_workers, 2);
    assert_eq!(stats.active_workers, 2);
}

#[tokio::test(start_paused = true)]
async fn sync_follows_worker_status() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let manager = fleet.manager(fleet.config());

    let report = manager.sync_workers().await.unwrap();
    assert_eq!((report.started, report.stopped), (1, 0));

    let mut w1 = fleet.store.workers.get(w1.id).await.unwrap().unwrap();
    w1.pause().unwrap();
    fleet.store.workers.save(&w1).await.unwrap();
    let w2 = fleet.worker("w2").await;

    let report = manager.sync_workers().await.unwrap();
    assert_eq!((report.started, report.stopped), (1, 1));
    assert_eq!(manager.running_workers().await, vec![w2.id]);
    assert_eq!(fleet.transport.connections(w1.id), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnected_worker_is_restarted() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let manager = fleet.manager(fleet.config());
    assert!(manager.start_worker(w1.id).await);

    assert_eq!(manager.health_check().await.unwrap(), 0);

    fleet.transport.sever(w1.id);
    assert_eq!(manager.get_stats().await.active_workers, 0);

    assert_eq!(manager.health_check().await.unwrap(), 1);
    assert_eq!(fleet.alerts.count(AlertKind::WorkerRestart), 1);
    assert_eq!(manager.get_stats().await.active_workers, 1);
    assert_eq!(fleet.transport.connections(w1.id), 1);
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn banned_worker_stops_and_is_not_restarted() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let campaign = fleet.campaign().await;
    fleet.items(&campaign, 1).await;
    fleet.transport.fail_all_sends(w1.id, TransportError::Banned);
    let manager = fleet.manager(fleet.config());
    assert!(manager.start_worker(w1.id).await);

    manager.distribute_tick().await.unwrap();
    settle(10).await;

    let stored = fleet.store.workers.get(w1.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkerStatus::Banned);
    assert_eq!(fleet.alerts.count(AlertKind::AccountError), 1);
    let c = fleet.store.campaigns.get(campaign.id).await.unwrap().unwrap();
    assert_eq!(c.failed_actions, 1);

    assert_eq!(manager.get_stats().await.active_workers, 0);
    assert_eq!(manager.health_check().await.unwrap(), 0);
    assert!(manager.running_workers().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn flood_wait_is_retried_with_backoff() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let campaign = fleet.campaign().await;
    fleet.items(&campaign, 1).await;
    fleet
        .transport
        .fail_next_send(w1.id, "channel0", TransportError::FloodWait(Duration::from_secs(30)));
    let manager = fleet.manager(fleet.config());
    assert!(manager.start_worker(w1.id).await);

    manager.distribute_tick().await.unwrap();
    settle(5).await;

    assert!(fleet.transport.sent().is_empty());
    let stats = fleet.queue.stats(&routing_key(w1.id)).await.unwrap();
    assert_eq!(stats.queued, 1);

    // First retry waits 20s.
    settle(20).await;
    assert_eq!(fleet.transport.sent_by(w1.id).len(), 1);
    let stats = fleet.queue.stats(&routing_key(w1.id)).await.unwrap();
    assert_eq!((stats.queued, stats.processing, stats.dead), (0, 0, 0));
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn persistent_flood_wait_ends_in_dead_letter() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let campaign = fleet.campaign().await;
    fleet.items(&campaign, 1).await;
    fleet
        .transport
        .fail_all_sends(w1.id, TransportError::FloodWait(Duration::from_secs(30)));
    let manager = fleet.manager(fleet.config());
    assert!(manager.start_worker(w1.id).await);

    manager.distribute_tick().await.unwrap();
    // 20 + 40 + 80 seconds of backoff, then the final attempt.
    settle(150).await;

    let dead = fleet.queue.dead_letters(&routing_key(w1.id), 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task.retry_count, 3);
    // Rate limiting is not the item's fault.
    let assignments = fleet.store.assignments.list_by_campaign(campaign.id).await.unwrap();
    assert_eq!(assignments[0].fail_count, 0);
    assert_eq!(assignments[0].status, AssignmentStatus::Active);
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_send_errors_swap_the_item() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let w2 = fleet.worker("w2").await;
    let campaign = fleet.campaign().await;
    let items = fleet.items(&campaign, 1).await;
    let assignment = Assignment::new(campaign.id, items[0].id, w1.id, fleet.owner);
    fleet.store.assignments.insert(&assignment).await.unwrap();
    fleet
        .transport
        .fail_all_sends(w1.id, TransportError::Other("peer flood".into()));
    let manager = fleet.manager(fleet.config());
    assert!(manager.start_worker(w1.id).await);
    assert!(manager.start_worker(w2.id).await);

    for _ in 0..3 {
        enqueue_service(&fleet, w1.id, assignment.id).await;
    }
    settle(10).await;

    let stored = fleet.store.assignments.get(assignment.id).await.unwrap().unwrap();
    assert_eq!(stored.worker_id, w2.id);
    assert_eq!(stored.previous_worker, Some(w1.id));
    assert_eq!(stored.fail_count, 0);
    let c = fleet.store.campaigns.get(campaign.id).await.unwrap().unwrap();
    assert_eq!(c.failed_actions, 3);
    assert!(fleet.transport.sent().is_empty());
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn start_and_stop_whole_fleet() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let w2 = fleet.worker("w2").await;
    let manager = fleet.manager(fleet.config());

    manager.start().await.unwrap();

    let stats = manager.get_stats().await;
    assert!(stats.running);
    assert_eq!(stats.total_workers, 2);
    assert!(stats.scheduler.running);
    let names: Vec<&str> = stats.scheduler.tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "distribute",
            "health_check",
            "sync_workers",
            "rebalance",
            "reset_hourly_counters",
            "reset_daily_counters",
            "evict_pending_logins",
        ]
    );

    // Reset hours are assigned by the immediate daily check.
    settle(1).await;
    let stored = fleet.store.workers.get(w1.id).await.unwrap().unwrap();
    assert!(stored.daily_reset_hour.is_some());

    manager.stop().await;

    let stats = manager.get_stats().await;
    assert!(!stats.running);
    assert_eq!(stats.total_workers, 0);
    assert_eq!(fleet.transport.connections(w1.id), 0);
    assert_eq!(fleet.transport.connections(w2.id), 0);
}

#[tokio::test(start_paused = true)]
async fn failure_after_item_moved_is_not_charged_to_new_holder() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let w2 = fleet.worker("w2").await;
    let campaign = fleet.campaign().await;
    let items = fleet.items(&campaign, 1).await;
    let assignment = Assignment::new(campaign.id, items[0].id, w1.id, fleet.owner);
    fleet.store.assignments.insert(&assignment).await.unwrap();

    let transport = HandOverTransport {
        inner: fleet.transport.clone(),
        worker: w1.id,
        client: Arc::new(HandedOverMidSend {
            store: fleet.store.clone(),
            assignment: assignment.id,
            new_holder: w2.id,
            connected: AtomicBool::new(true),
        }),
    };
    let manager = fleet.manager_over(fleet.config(), Arc::new(transport));
    assert!(manager.start_worker(w1.id).await);

    enqueue_service(&fleet, w1.id, assignment.id).await;
    settle(5).await;

    let stored = fleet.store.assignments.get(assignment.id).await.unwrap().unwrap();
    assert_eq!(stored.worker_id, w2.id);
    assert_eq!(stored.previous_worker, Some(w1.id));
    assert_eq!(stored.fail_count, 0);
    assert_eq!(stored.swap_count, 1);
    assert_eq!(stored.status, AssignmentStatus::Active);
    manager.stop_worker(w1.id).await;
}

#[tokio::test(start_paused = true)]
async fn hung_connect_does_not_block_the_fleet() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let w2 = fleet.worker("w2").await;
    let gated = GatedTransport::new(fleet.transport.clone());
    gated.hold(w1.id, None);
    let manager = fleet.manager_over(
        ManagerConfig {
            connect_timeout: Duration::from_secs(60),
            ..fleet.config()
        },
        Arc::new(gated),
    );

    let starting = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start_worker(w1.id).await }
    });
    settle(1).await;

    let stats = tokio::time::timeout(Duration::from_secs(1), manager.get_stats())
        .await
        .expect("stats blocked by a pending connect");
    assert_eq!(stats.total_workers, 0);
    assert!(manager.start_worker(w2.id).await);
    assert_eq!(manager.running_workers().await, vec![w2.id]);

    settle(60).await;
    assert!(!starting.await.unwrap());
    assert_eq!(fleet.alerts.count(AlertKind::AccountError), 1);
    assert_eq!(manager.running_workers().await, vec![w2.id]);
    manager.stop_worker(w2.id).await;
}

#[tokio::test(start_paused = true)]
async fn stop_discards_worker_connecting_during_shutdown() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let gated = GatedTransport::new(fleet.transport.clone());
    gated.hold(w1.id, Some(Duration::from_secs(5)));
    let config = ManagerConfig {
        timings: quiet_timings(),
        ..fleet.config()
    };
    let shutdown = config.shutdown_timeout;
    let manager = fleet.manager_over(config, Arc::new(gated));

    let starting = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start().await }
    });
    settle(1).await;

    tokio::time::timeout(shutdown, manager.stop())
        .await
        .expect("stop waited on a pending connect");

    settle(10).await;
    starting.await.unwrap().unwrap();
    assert!(manager.running_workers().await.is_empty());
    assert_eq!(fleet.transport.connections(w1.id), 0);
    assert_eq!(fleet.alerts.count(AlertKind::AccountError), 0);
}

#[tokio::test(start_paused = true)]
async fn start_staggers_worker_starts() {
    let fleet = Fleet::new();
    for label in ["w1", "w2", "w3", "w4"] {
        fleet.worker(label).await;
    }
    let gated = GatedTransport::new(fleet.transport.clone());
    let (min, max) = (Duration::from_secs(3), Duration::from_secs(10));
    let manager = fleet.manager_over(
        ManagerConfig {
            stagger_min: min,
            stagger_max: max,
            timings: quiet_timings(),
            ..ManagerConfig::default()
        },
        Arc::new(gated.clone()),
    );

    manager.start().await.unwrap();

    let requests = gated.requests();
    assert_eq!(requests.len(), 4);
    // Sleeps round up to the timer's millisecond tick.
    let slack = Duration::from_millis(5);
    for pair in requests.windows(2) {
        let gap = pair[1].1 - pair[0].1;
        assert!(gap >= min && gap <= max + slack, "gap {gap:?}");
    }
    assert_eq!(manager.get_stats().await.total_workers, 4);
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_keep_one_connection() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let gated = GatedTransport::new(fleet.transport.clone());
    gated.hold(w1.id, Some(Duration::from_secs(2)));
    let manager = fleet.manager_over(fleet.config(), Arc::new(gated.clone()));

    let (a, b) = tokio::join!(manager.start_worker(w1.id), manager.start_worker(w1.id));

    assert!(a ^ b);
    assert_eq!(gated.requests().len(), 2);
    assert_eq!(fleet.transport.connections(w1.id), 1);
    assert_eq!(manager.running_workers().await, vec![w1.id]);
    manager.stop_worker(w1.id).await;
}
