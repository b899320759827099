//! Fleet supervisor: owns the live worker units, runs the maintenance
//! schedule and feeds assignment batches into the per-worker queues.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use fleet_core::{Campaign, CampaignId, OwnerId, WorkerId, WorkerStatus};
use fleet_infra::FleetConfig;
use fleet_infra::alerts::{AlertEvent, AlertSink};
use fleet_infra::cipher::{CipherError, SessionCipher};
use fleet_infra::config::{LockTtls, SchedulerTimings, TaskTiming};
use fleet_infra::lock::{DISTRIBUTE_LOCK, HEALTH_CHECK_LOCK, LockManager, REBALANCE_LOCK};
use fleet_infra::queue::{NewTask, TaskKind, TaskQueue};
use fleet_infra::store::{SessionFactory, Store, StoreError};
use fleet_infra::transport::{ChatTransport, TransportError};

use crate::distributor::{DistributionReport, Distributor};
use crate::onboarding::Onboarding;
use crate::profile::ProfileSync;
use crate::scheduler::{ScheduledTask, Scheduler, SchedulerStats};
use crate::worker::{ServiceAssignment, UnitDeps, WorkerUnit, routing_key};

#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub max_workers: usize,
    pub max_fails: u32,
    pub timings: SchedulerTimings,
    pub locks: LockTtls,
    pub stagger_min: Duration,
    pub stagger_max: Duration,
    pub shutdown_timeout: Duration,
    pub worker_stop_timeout: Duration,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub auth_ttl: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&FleetConfig::default())
    }
}

impl From<&FleetConfig> for ManagerConfig {
    fn from(config: &FleetConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            max_fails: config.max_fails_before_swap,
            timings: config.timings.clone(),
            locks: config.locks.clone(),
            stagger_min: config.stagger_min,
            stagger_max: config.stagger_max,
            shutdown_timeout: config.shutdown_timeout,
            worker_stop_timeout: config.worker_stop_timeout,
            connect_timeout: config.connect_timeout,
            poll_interval: config.queue.poll_interval,
            auth_ttl: Duration::from_secs(600),
        }
    }
}

/// Why a worker could not be started.
#[derive(Debug, thiserror::Error)]
pub enum WorkerStartError {
    #[error("worker not found")]
    NotFound,
    #[error("worker already running")]
    AlreadyRunning,
    #[error("worker is {0:?}, not active")]
    NotActive(WorkerStatus),
    #[error("worker has no session")]
    NoSession,
    #[error("worker limit of {0} reached")]
    AtCapacity(usize),
    /// The manager was stopped while the worker was connecting.
    #[error("manager stopped during start")]
    Interrupted,
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// External collaborators the manager drives.
#[derive(Clone)]
pub struct FleetServices {
    pub sessions: Arc<dyn SessionFactory>,
    pub queue: Arc<dyn TaskQueue>,
    pub locks: Arc<LockManager>,
    pub transport: Arc<dyn ChatTransport>,
    pub cipher: Arc<dyn SessionCipher>,
    pub alerts: Arc<dyn AlertSink>,
    pub profile_sync: Arc<dyn ProfileSync>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub started: usize,
    pub stopped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DistributeSummary {
    pub campaigns: usize,
    pub assigned: usize,
    pub dispatched: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebalanceSummary {
    pub campaigns: usize,
    pub swaps: usize,
    pub moved: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStats {
    pub running: bool,
    pub total_workers: usize,
    pub active_workers: usize,
    pub worker_ids: Vec<WorkerId>,
    pub scheduler: SchedulerStats,
}

struct Inner {
    config: ManagerConfig,
    services: FleetServices,
    onboarding: Arc<Onboarding>,
    units: Mutex<HashMap<WorkerId, WorkerUnit>>,
    /// Bumped by `stop`; a start that straddles it is discarded.
    epoch: AtomicU64,
    scheduler: Mutex<Scheduler>,
    running: AtomicBool,
    last_daily_check: StdMutex<Option<DateTime<Utc>>>,
}

/// Cheap to clone; clones share one fleet.
#[derive(Clone)]
pub struct WorkerManager {
    inner: Arc<Inner>,
}

impl WorkerManager {
    pub fn new(config: ManagerConfig, services: FleetServices) -> Self {
        let onboarding = Arc::new(Onboarding::new(
            services.sessions.clone(),
            services.cipher.clone(),
            config.auth_ttl,
        ));
        Self {
            inner: Arc::new(Inner {
                config,
                services,
                onboarding,
                units: Mutex::new(HashMap::new()),
                epoch: AtomicU64::new(0),
                scheduler: Mutex::new(Scheduler::new()),
                running: AtomicBool::new(false),
                last_daily_check: StdMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn onboarding(&self) -> Arc<Onboarding> {
        self.inner.onboarding.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn unit_deps(&self) -> UnitDeps {
        let s = &self.inner.services;
        UnitDeps {
            sessions: s.sessions.clone(),
            queue: s.queue.clone(),
            profile_sync: s.profile_sync.clone(),
            alerts: s.alerts.clone(),
            max_fails: self.inner.config.max_fails,
            poll_interval: self.inner.config.poll_interval,
        }
    }

    fn distributor(&self, store: &Store) -> Distributor {
        Distributor::new(
            store.clone(),
            self.inner.services.profile_sync.clone(),
            self.inner.config.max_fails,
        )
    }

    async fn alert(&self, event: AlertEvent) {
        if !self.inner.services.alerts.notify(&event).await {
            warn!(kind = ?event.kind, "alert not delivered");
        }
    }

    /// Start a unit for `worker_id`. Returns `false` if it was rejected or
    /// could not be built.
    pub async fn start_worker(&self, worker_id: WorkerId) -> bool {
        match self.try_start_worker(worker_id).await {
            Ok(()) => true,
            Err(
                e @ (WorkerStartError::AlreadyRunning
                | WorkerStartError::AtCapacity(_)
                | WorkerStartError::NotFound
                | WorkerStartError::NotActive(_)
                | WorkerStartError::NoSession
                | WorkerStartError::Interrupted),
            ) => {
                debug!(worker_id = %worker_id, reason = %e, "worker not started");
                false
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "worker failed to start");
                let label = match self.inner.services.sessions.open().await {
                    Ok(store) => store
                        .workers
                        .get(worker_id)
                        .await
                        .ok()
                        .flatten()
                        .map(|w| w.label)
                        .unwrap_or_default(),
                    Err(_) => String::new(),
                };
                self.alert(AlertEvent::account_error(worker_id, &label, &e.to_string()))
                    .await;
                false
            }
        }
    }

    /// The units map is only locked for the admission checks and the final
    /// insert; loading, decrypting and connecting run without it.
    async fn try_start_worker(&self, worker_id: WorkerId) -> Result<(), WorkerStartError> {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.admit(&*self.inner.units.lock().await, worker_id)?;

        let store = self.inner.services.sessions.open().await?;
        let worker = store
            .workers
            .get(worker_id)
            .await?
            .ok_or(WorkerStartError::NotFound)?;
        if !worker.is_active() {
            return Err(WorkerStartError::NotActive(worker.status));
        }
        let sealed = worker.session.as_deref().ok_or(WorkerStartError::NoSession)?;

        let session = self.inner.services.cipher.decrypt(sealed)?;
        let limit = self.inner.config.connect_timeout;
        let client = tokio::time::timeout(limit, self.inner.services.transport.connect(&worker, &session))
            .await
            .map_err(|_| WorkerStartError::ConnectTimeout(limit))??;

        let mut units = self.inner.units.lock().await;
        let admitted = if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            Err(WorkerStartError::Interrupted)
        } else {
            self.admit(&units, worker_id)
        };
        if let Err(e) = admitted {
            drop(units);
            client.disconnect().await;
            return Err(e);
        }

        let mut unit = WorkerUnit::new(worker.id, worker.label.clone(), client, self.unit_deps());
        unit.start();
        units.insert(worker_id, unit);
        Ok(())
    }

    fn admit(&self, units: &HashMap<WorkerId, WorkerUnit>, worker_id: WorkerId) -> Result<(), WorkerStartError> {
        if units.contains_key(&worker_id) {
            return Err(WorkerStartError::AlreadyRunning);
        }
        if units.len() >= self.inner.config.max_workers {
            return Err(WorkerStartError::AtCapacity(self.inner.config.max_workers));
        }
        Ok(())
    }

    /// Gracefully stop and forget the unit. Returns `false` if none was live.
    pub async fn stop_worker(&self, worker_id: WorkerId) -> bool {
        let unit = self.inner.units.lock().await.remove(&worker_id);
        match unit {
            Some(mut unit) => {
                unit.stop(self.inner.config.worker_stop_timeout).await;
                true
            }
            None => false,
        }
    }

    pub async fn running_workers(&self) -> Vec<WorkerId> {
        self.inner.units.lock().await.keys().copied().collect()
    }

    /// Start units for newly active workers and stop units whose worker left
    /// the active set.
    pub async fn sync_workers(&self) -> anyhow::Result<SyncReport> {
        let store = self.inner.services.sessions.open().await?;
        let active: HashSet<WorkerId> = store
            .workers
            .list_by_status(WorkerStatus::Active)
            .await?
            .into_iter()
            .map(|w| w.id)
            .collect();
        let live: HashSet<WorkerId> = self.running_workers().await.into_iter().collect();

        let mut report = SyncReport::default();
        for id in live.difference(&active) {
            if self.stop_worker(*id).await {
                report.stopped += 1;
            }
        }
        let mut to_start: Vec<WorkerId> = active.difference(&live).copied().collect();
        to_start.sort();
        for id in to_start {
            if self.start_worker(id).await {
                report.started += 1;
            }
        }
        if report != SyncReport::default() {
            info!(started = report.started, stopped = report.stopped, "workers synced");
        }
        Ok(report)
    }

    /// Restart every unhealthy unit. Returns how many were restarted; `0`
    /// when another instance holds the health-check lock.
    pub async fn health_check(&self) -> anyhow::Result<usize> {
        let locks = &self.inner.services.locks;
        let ttl = self.inner.config.locks.health_check;
        Ok(locks
            .with_lock(HEALTH_CHECK_LOCK, ttl, || self.restart_unhealthy())
            .await
            .unwrap_or(0))
    }

    async fn restart_unhealthy(&self) -> usize {
        let unhealthy: Vec<WorkerId> = self
            .inner
            .units
            .lock()
            .await
            .iter()
            .filter(|(_, unit)| !unit.health_check())
            .map(|(id, _)| *id)
            .collect();

        let mut restarted = 0;
        for id in unhealthy {
            warn!(worker_id = %id, "worker unhealthy, restarting");
            self.alert(AlertEvent::worker_restart(id, "health check failed")).await;
            self.stop_worker(id).await;
            if self.start_worker(id).await {
                restarted += 1;
            }
        }
        restarted
    }

    /// Distribute items and dispatch due batches for every active campaign.
    /// `None` when another instance holds the distribute lock.
    pub async fn distribute_tick(&self) -> anyhow::Result<Option<DistributeSummary>> {
        let locks = &self.inner.services.locks;
        let ttl = self.inner.config.locks.distribute;
        locks
            .with_lock(DISTRIBUTE_LOCK, ttl, || self.distribute_all())
            .await
            .transpose()
    }

    async fn distribute_all(&self) -> anyhow::Result<DistributeSummary> {
        let store = self.inner.services.sessions.open().await?;
        let campaigns = store.campaigns.list_active().await?;
        let mut summary = DistributeSummary {
            campaigns: campaigns.len(),
            ..Default::default()
        };

        for campaign in campaigns {
            let stats = self.distributor(&store).distribute(campaign.id, campaign.owner).await?;
            summary.assigned += stats.assigned;

            let now = Utc::now();
            if campaign.schedule.can_send_batch(now) {
                let dispatched = self.dispatch_batch(&store, &campaign).await?;
                if dispatched > 0 {
                    store.campaigns.record_batch_sent(campaign.id, now).await?;
                    summary.dispatched += dispatched;
                }
            }
        }
        Ok(summary)
    }

    /// Enqueue one batch of service tasks for `campaign`, spaced per worker by
    /// the campaign's random delay.
    async fn dispatch_batch(&self, store: &Store, campaign: &Campaign) -> anyhow::Result<usize> {
        let live: HashSet<WorkerId> = self.running_workers().await.into_iter().collect();
        let assignments: Vec<_> = store
            .assignments
            .list_by_campaign(campaign.id)
            .await?
            .into_iter()
            .filter(|a| a.is_active() && live.contains(&a.worker_id))
            .collect();

        let mut capacity: HashMap<WorkerId, u32> = HashMap::new();
        for a in &assignments {
            if capacity.contains_key(&a.worker_id) {
                continue;
            }
            let remaining = match store.workers.get(a.worker_id).await? {
                Some(w) if w.is_active() => w.remaining_daily().min(w.remaining_hourly()),
                _ => 0,
            };
            capacity.insert(a.worker_id, remaining);
        }
        let total: u32 = capacity.values().sum();
        let batch = campaign.schedule.batch_size.min(total) as usize;
        if batch == 0 {
            debug!(campaign_id = %campaign.id, "no capacity for batch");
            return Ok(0);
        }

        let mut offsets: HashMap<WorkerId, Duration> = HashMap::new();
        let mut dispatched = 0;
        for a in &assignments {
            if dispatched == batch {
                break;
            }
            let Some(left) = capacity.get_mut(&a.worker_id).filter(|left| **left > 0) else {
                continue;
            };
            let delay = {
                let mut rng = rand::thread_rng();
                campaign.schedule.pick_delay(&mut rng)
            };
            let offset = offsets.entry(a.worker_id).or_default();
            *offset += delay;

            let task = NewTask::new(
                TaskKind::ServiceAssignment,
                json!(ServiceAssignment { assignment_id: a.id }),
            )
            .routed_to(routing_key(a.worker_id))
            .delayed(*offset);
            if self.inner.services.queue.enqueue(task).await?.is_some() {
                *left -= 1;
                dispatched += 1;
            }
        }
        info!(campaign_id = %campaign.id, dispatched, "batch dispatched");
        Ok(dispatched)
    }

    /// Cross-swap then rebalance every active campaign. `None` when another
    /// instance holds the rebalance lock.
    pub async fn rebalance_tick(&self) -> anyhow::Result<Option<RebalanceSummary>> {
        let locks = &self.inner.services.locks;
        let ttl = self.inner.config.locks.rebalance;
        locks
            .with_lock(REBALANCE_LOCK, ttl, || self.rebalance_all())
            .await
            .transpose()
    }

    async fn rebalance_all(&self) -> anyhow::Result<RebalanceSummary> {
        let store = self.inner.services.sessions.open().await?;
        let campaigns = store.campaigns.list_active().await?;
        let mut summary = RebalanceSummary {
            campaigns: campaigns.len(),
            ..Default::default()
        };
        for campaign in campaigns {
            let distributor = self.distributor(&store);
            summary.swaps += distributor.perform_cross_swap(campaign.id, campaign.owner).await?.swaps;
            summary.moved += distributor.rebalance_load(campaign.id, campaign.owner).await?.moved;
        }
        Ok(summary)
    }

    pub async fn distribution_report(&self, campaign: CampaignId, owner: OwnerId) -> anyhow::Result<DistributionReport> {
        let store = self.inner.services.sessions.open().await?;
        Ok(self.distributor(&store).distribution_report(campaign, owner).await?)
    }

    pub async fn reset_hourly_counters(&self) -> anyhow::Result<usize> {
        let store = self.inner.services.sessions.open().await?;
        let reset = store.workers.reset_hourly().await?;
        info!(workers = reset, "hourly counters reset");
        Ok(reset)
    }

    /// Reset daily counters of workers whose reset hour passed since the
    /// previous check. Each UTC hour is handled at most once.
    pub async fn reset_daily_counters(&self) -> anyhow::Result<usize> {
        self.reset_daily_counters_at(Utc::now()).await
    }

    pub async fn reset_daily_counters_at(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let hours = {
            let mut last = self
                .inner
                .last_daily_check
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let hours = hours_since(*last, now);
            *last = Some(now);
            hours
        };
        if hours.is_empty() {
            return Ok(0);
        }

        let store = self.inner.services.sessions.open().await?;
        let seeded = store.workers.initialize_daily_reset_hours().await?;
        if seeded > 0 {
            info!(workers = seeded, "daily reset hours assigned");
        }
        let mut reset = 0;
        for hour in hours {
            reset += store.workers.reset_daily(hour).await?;
        }
        if reset > 0 {
            info!(workers = reset, "daily counters reset");
        }
        Ok(reset)
    }

    fn task<F, Fut>(&self, name: &str, timing: TaskTiming, job: F) -> ScheduledTask
    where
        F: Fn(WorkerManager) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let job = Arc::new(job);
        ScheduledTask::new(name, timing.interval, move || {
            let weak = weak.clone();
            let job = job.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => job(WorkerManager { inner }).await,
                    None => Ok(()),
                }
            }
        })
        .with_jitter(timing.jitter)
    }

    fn scheduled_tasks(&self) -> Vec<ScheduledTask> {
        let t = &self.inner.config.timings;
        vec![
            self.task("distribute", t.distribute, |m| async move {
                m.distribute_tick().await.map(drop)
            })
            .run_immediately(),
            self.task("health_check", t.health_check, |m| async move {
                m.health_check().await.map(drop)
            }),
            self.task("sync_workers", t.sync_workers, |m| async move {
                m.sync_workers().await.map(drop)
            }),
            self.task("rebalance", t.rebalance, |m| async move {
                m.rebalance_tick().await.map(drop)
            }),
            self.task("reset_hourly_counters", t.hourly_reset, |m| async move {
                m.reset_hourly_counters().await.map(drop)
            }),
            self.task("reset_daily_counters", t.daily_reset_check, |m| async move {
                m.reset_daily_counters().await.map(drop)
            })
            .run_immediately(),
            self.task("evict_pending_logins", TaskTiming::new(60, 0.25), |m| async move {
                m.inner.onboarding.evict_expired().await.map(drop).map_err(anyhow::Error::from)
            }),
        ]
    }

    /// Recover stranded tasks, start the schedule, then bring up active
    /// workers in random order with a random pause between starts.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let recovered = self.inner.services.queue.recover_processing().await?;
        if recovered > 0 {
            warn!(tasks = recovered, "recovered stranded queue tasks");
        }

        {
            let mut scheduler = self.inner.scheduler.lock().await;
            for task in self.scheduled_tasks() {
                scheduler.add_task(task)?;
            }
            scheduler.start();
        }

        let store = self.inner.services.sessions.open().await?;
        let mut ids: Vec<WorkerId> = store
            .workers
            .list_by_status(WorkerStatus::Active)
            .await?
            .into_iter()
            .map(|w| w.id)
            .collect();
        ids.shuffle(&mut rand::thread_rng());

        let mut started = 0;
        for (i, id) in ids.iter().enumerate() {
            if !self.is_running() {
                break;
            }
            if i > 0 {
                tokio::time::sleep(self.stagger()).await;
            }
            if self.start_worker(*id).await {
                started += 1;
            }
        }
        info!(workers = started, "worker manager started");
        Ok(())
    }

    fn stagger(&self) -> Duration {
        let (lo, hi) = (self.inner.config.stagger_min, self.inner.config.stagger_max);
        if hi <= lo {
            return lo;
        }
        Duration::from_secs_f64(rand::thread_rng().gen_range(lo.as_secs_f64()..=hi.as_secs_f64()))
    }

    /// Stop the schedule, then every unit concurrently within the shutdown
    /// timeout. Units that miss it are abandoned.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let timeout = self.inner.config.shutdown_timeout;
        {
            let mut scheduler = self.inner.scheduler.lock().await;
            scheduler.stop(timeout).await;
            *scheduler = Scheduler::new();
        }

        let units: Vec<WorkerUnit> = {
            let mut units = self.inner.units.lock().await;
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            units.drain().map(|(_, u)| u).collect()
        };
        let total = units.len();
        let per_unit = self.inner.config.worker_stop_timeout;
        let mut set = JoinSet::new();
        for mut unit in units {
            set.spawn(async move { unit.stop(per_unit).await });
        }

        let mut stopped = 0;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = set.join_next().await {
                if joined.is_ok() {
                    stopped += 1;
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(abandoned = total - stopped, "workers did not stop before shutdown timeout");
            set.abort_all();
        }
        self.inner.services.locks.release_all().await;
        info!(workers = stopped, "worker manager stopped");
    }

    pub async fn get_stats(&self) -> ManagerStats {
        let (total_workers, active_workers, mut worker_ids) = {
            let units = self.inner.units.lock().await;
            (
                units.len(),
                units.values().filter(|u| u.health_check()).count(),
                units.keys().copied().collect::<Vec<_>>(),
            )
        };
        worker_ids.sort();
        ManagerStats {
            running: self.is_running(),
            total_workers,
            active_workers,
            worker_ids,
            scheduler: self.inner.scheduler.lock().await.stats(),
        }
    }
}

/// UTC hours whose start lies in `(last, now]`, or the current hour on the
/// first check. At most 24.
fn hours_since(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Vec<u8> {
    let floor = |t: DateTime<Utc>| t.timestamp().div_euclid(3600);
    let current = floor(now);
    let first = match last {
        Some(last) => floor(last) + 1,
        None => current,
    };
    let first = first.max(current - 23);
    (first..=current)
        .map(|h| h.rem_euclid(24) as u8)
        .collect()
}
