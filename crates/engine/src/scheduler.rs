//! Periodic maintenance tasks with jittered intervals.
//!
//! Each task runs on its own tokio task. Intervals are re-drawn every cycle
//! within `base ± base * jitter` so fleet activity never falls into a fixed
//! rhythm.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Job = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("task {0} already exists")]
    DuplicateTask(String),
}

pub struct ScheduledTask {
    name: String,
    job: Job,
    interval: Duration,
    run_immediately: bool,
    jitter: f64,
    randomize_start: bool,
}

impl ScheduledTask {
    /// A task with ±25% jitter and a randomized first run.
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            job: Arc::new(move || Box::pin(job()) as JobFuture),
            interval,
            run_immediately: false,
            jitter: 0.25,
            randomize_start: true,
        }
    }

    pub fn run_immediately(mut self) -> Self {
        self.run_immediately = true;
        self
    }

    /// Fraction of the base interval, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn fixed_start(mut self) -> Self {
        self.randomize_start = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next sleep, drawn uniformly from `base ± base * jitter`.
    pub fn next_interval(&self) -> Duration {
        let base = self.interval.as_secs_f64();
        let spread = base * self.jitter;
        let offset = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + offset).max(0.0))
    }

    fn first_delay(&self) -> Option<Duration> {
        if self.run_immediately {
            None
        } else if self.randomize_start {
            let half = self.interval.as_secs_f64() * 0.5;
            Some(Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=half)))
        } else {
            Some(self.next_interval())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStats {
    pub name: String,
    pub running: bool,
    pub base_interval: Duration,
    pub jitter: f64,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub tasks: Vec<TaskStats>,
}

struct Entry {
    task: Arc<ScheduledTask>,
    stats: Arc<Mutex<TaskStats>>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct Scheduler {
    entries: Vec<Entry>,
    shutdown: Option<watch::Sender<bool>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Register `task`. If the scheduler is already running the task starts
    /// right away.
    pub fn add_task(&mut self, task: ScheduledTask) -> Result<(), SchedulerError> {
        if self.entries.iter().any(|e| e.task.name == task.name) {
            return Err(SchedulerError::DuplicateTask(task.name));
        }
        let stats = Arc::new(Mutex::new(TaskStats {
            name: task.name.clone(),
            running: false,
            base_interval: task.interval,
            jitter: task.jitter,
            last_run: None,
            run_count: 0,
            error_count: 0,
        }));
        let mut entry = Entry {
            task: Arc::new(task),
            stats,
            handle: None,
        };
        if let Some(tx) = &self.shutdown {
            entry.handle = Some(spawn_task(&entry, tx.subscribe()));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Abort and drop the task named `name`.
    pub fn remove_task(&mut self, name: &str) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.task.name == name) else {
            return false;
        };
        let entry = self.entries.remove(pos);
        if let Some(handle) = entry.handle {
            handle.abort();
        }
        true
    }

    pub fn start(&mut self) {
        if self.shutdown.is_some() {
            return;
        }
        let (tx, _) = watch::channel(false);
        for entry in &mut self.entries {
            entry.handle = Some(spawn_task(entry, tx.subscribe()));
        }
        info!(tasks = self.entries.len(), "scheduler started");
        self.shutdown = Some(tx);
    }

    /// Signal every task and wait up to `timeout` in total; stragglers are
    /// aborted.
    pub async fn stop(&mut self, timeout: Duration) {
        let Some(tx) = self.shutdown.take() else {
            return;
        };
        let _ = tx.send(true);

        let deadline = tokio::time::Instant::now() + timeout;
        for entry in &mut self.entries {
            let Some(mut handle) = entry.handle.take() else {
                continue;
            };
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(task = %entry.task.name, "scheduled task did not stop in time, aborting");
                handle.abort();
                entry.stats.lock().unwrap().running = false;
            }
        }
        info!("scheduler stopped");
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.is_running(),
            tasks: self
                .entries
                .iter()
                .map(|e| e.stats.lock().unwrap().clone())
                .collect(),
        }
    }
}

fn spawn_task(entry: &Entry, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let task = entry.task.clone();
    let stats = entry.stats.clone();
    stats.lock().unwrap().running = true;
    info!(task = %task.name, base_interval_secs = task.interval.as_secs_f64(), "scheduled task started");
    tokio::spawn(async move {
        run_loop(&task, &stats, shutdown).await;
        stats.lock().unwrap().running = false;
        info!(task = %task.name, "scheduled task stopped");
    })
}

async fn run_loop(task: &ScheduledTask, stats: &Mutex<TaskStats>, mut shutdown: watch::Receiver<bool>) {
    if let Some(delay) = task.first_delay() {
        debug!(task = %task.name, offset_secs = delay.as_secs_f64(), "delaying first run");
        if !sleep_unless_stopped(delay, &mut shutdown).await {
            return;
        }
    }
    loop {
        if *shutdown.borrow() {
            return;
        }
        execute(task, stats).await;
        let next = task.next_interval();
        debug!(task = %task.name, interval_secs = next.as_secs_f64(), "next scheduled run");
        if !sleep_unless_stopped(next, &mut shutdown).await {
            return;
        }
    }
}

async fn execute(task: &ScheduledTask, stats: &Mutex<TaskStats>) {
    debug!(task = %task.name, "executing scheduled task");
    {
        let mut s = stats.lock().unwrap();
        s.last_run = Some(Utc::now());
        s.run_count += 1;
    }
    if let Err(e) = (task.job)().await {
        stats.lock().unwrap().error_count += 1;
        error!(task = %task.name, error = %e, "scheduled task failed");
    }
}

/// `false` once stop was requested.
async fn sleep_unless_stopped(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.wait_for(|stop| *stop) => false,
    }
}
