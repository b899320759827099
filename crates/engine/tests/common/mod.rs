#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use fleet_core::{Campaign, OwnerId, WorkItem, Worker, WorkerId};
use fleet_engine::{FleetServices, ManagerConfig, NoopProfileSync, ProfileSync, WorkerManager};
use fleet_infra::alerts::RecordingAlertSink;
use fleet_infra::cipher::PlaintextCipher;
use fleet_infra::lock::LockManager;
use fleet_infra::queue::{InMemoryTaskQueue, QueueConfig};
use fleet_infra::store::{InMemoryStore, Store};
use fleet_infra::transport::{ChatClient, ChatTransport, LoopbackTransport, TransportError};

/// An in-memory fleet: store, loopback network, queue, locks and alerts.
pub struct Fleet {
    pub mem: Arc<InMemoryStore>,
    pub store: Store,
    pub transport: LoopbackTransport,
    pub queue: Arc<InMemoryTaskQueue>,
    pub locks: Arc<LockManager>,
    pub alerts: Arc<RecordingAlertSink>,
    pub owner: OwnerId,
}

impl Fleet {
    pub fn new() -> Self {
        let mem = InMemoryStore::arc();
        Self {
            store: mem.store(),
            mem,
            transport: LoopbackTransport::new(),
            queue: InMemoryTaskQueue::arc(QueueConfig::default()),
            locks: Arc::new(LockManager::in_memory()),
            alerts: Arc::new(RecordingAlertSink::new()),
            owner: OwnerId::new(),
        }
    }

    pub async fn worker(&self, label: &str) -> Worker {
        let mut w = Worker::new(self.owner, label);
        w.activate(label.as_bytes().to_vec()).unwrap();
        self.store.workers.save(&w).await.unwrap();
        w
    }

    /// An active campaign with one template and no spacing between sends.
    pub async fn campaign(&self) -> Campaign {
        let mut c = Campaign::new(self.owner, "launch");
        c.add_template("nice post").unwrap();
        c.schedule.delay_min_secs = 0;
        c.schedule.delay_max_secs = 0;
        c.activate().unwrap();
        self.store.campaigns.save(&c).await.unwrap();
        c
    }

    /// `n` reachable items, each with posts 1..=3.
    pub async fn items(&self, campaign: &Campaign, n: usize) -> Vec<WorkItem> {
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let handle = format!("channel{i}");
            self.transport.add_peer(&handle, &format!("Channel {i}"), None, &[1, 2, 3]);
            let mut item = WorkItem::new(campaign.id, self.owner, handle);
            item.mark_active(None);
            self.store.items.save(&item).await.unwrap();
            out.push(item);
        }
        out
    }

    pub fn config(&self) -> ManagerConfig {
        ManagerConfig {
            stagger_min: Duration::ZERO,
            stagger_max: Duration::ZERO,
            ..ManagerConfig::default()
        }
    }

    pub fn manager(&self, config: ManagerConfig) -> WorkerManager {
        self.manager_with_sync(config, Arc::new(NoopProfileSync))
    }

    pub fn manager_with_sync(&self, config: ManagerConfig, profile_sync: Arc<dyn ProfileSync>) -> WorkerManager {
        self.build(config, Arc::new(self.transport.clone()), profile_sync)
    }

    /// A manager that connects through `transport` instead of the loopback.
    pub fn manager_over(&self, config: ManagerConfig, transport: Arc<dyn ChatTransport>) -> WorkerManager {
        self.build(config, transport, Arc::new(NoopProfileSync))
    }

    fn build(
        &self,
        config: ManagerConfig,
        transport: Arc<dyn ChatTransport>,
        profile_sync: Arc<dyn ProfileSync>,
    ) -> WorkerManager {
        WorkerManager::new(
            config,
            FleetServices {
                sessions: self.mem.session_factory(),
                queue: self.queue.clone(),
                locks: self.locks.clone(),
                transport,
                cipher: Arc::new(PlaintextCipher),
                alerts: self.alerts.clone(),
                profile_sync,
            },
        )
    }
}

/// Loopback transport that records when each connect was requested and can
/// hold chosen workers' connects open.
#[derive(Clone)]
pub struct GatedTransport {
    inner: LoopbackTransport,
    /// `None` holds forever.
    holds: Arc<Mutex<HashMap<WorkerId, Option<Duration>>>>,
    requests: Arc<Mutex<Vec<(WorkerId, Instant)>>>,
}

impl GatedTransport {
    pub fn new(inner: LoopbackTransport) -> Self {
        Self {
            inner,
            holds: Arc::default(),
            requests: Arc::default(),
        }
    }

    pub fn hold(&self, worker: WorkerId, hold: Option<Duration>) {
        self.holds.lock().unwrap().insert(worker, hold);
    }

    pub fn requests(&self) -> Vec<(WorkerId, Instant)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ChatTransport for GatedTransport {
    async fn connect(&self, worker: &Worker, session: &[u8]) -> Result<Arc<dyn ChatClient>, TransportError> {
        self.requests.lock().unwrap().push((worker.id, Instant::now()));
        let hold = self.holds.lock().unwrap().get(&worker.id).copied();
        match hold {
            Some(Some(delay)) => tokio::time::sleep(delay).await,
            Some(None) => std::future::pending::<()>().await,
            None => {}
        }
        self.inner.connect(worker, session).await
    }
}
