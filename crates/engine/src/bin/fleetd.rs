use std::sync::Arc;

use fleet_engine::{FleetServices, ManagerConfig, TransportProfileSync, WorkerManager};
use fleet_infra::FleetConfig;
use fleet_infra::alerts::LogAlertSink;
use fleet_infra::cipher::PlaintextCipher;
use fleet_infra::lock::LockManager;
use fleet_infra::queue::{InMemoryTaskQueue, TaskQueue};
use fleet_infra::store::InMemoryStore;
use fleet_infra::transport::LoopbackTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fleet_observability::init();

    let config = FleetConfig::from_env()?;
    let (queue, locks) = backends(&config).await?;

    let store = InMemoryStore::arc();
    let sessions = store.session_factory();
    let transport = Arc::new(LoopbackTransport::new());
    let cipher = Arc::new(PlaintextCipher);
    let profile_sync = Arc::new(TransportProfileSync::new(
        sessions.clone(),
        transport.clone(),
        cipher.clone(),
    ));

    let manager = WorkerManager::new(
        ManagerConfig::from(&config),
        FleetServices {
            sessions,
            queue,
            locks,
            transport,
            cipher,
            alerts: Arc::new(LogAlertSink),
            profile_sync,
        },
    );

    manager.start().await?;
    tracing::info!(max_workers = config.max_workers, "fleetd running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    manager.stop().await;
    Ok(())
}

#[cfg(feature = "redis")]
async fn backends(config: &FleetConfig) -> anyhow::Result<(Arc<dyn TaskQueue>, Arc<LockManager>)> {
    use fleet_infra::lock::RedisLockBackend;
    use fleet_infra::queue::RedisTaskQueue;

    match config.redis_url.as_deref() {
        Some(url) => {
            tracing::info!("using redis queue and locks");
            let queue: Arc<dyn TaskQueue> = Arc::new(RedisTaskQueue::connect(url, config.queue.clone()).await?);
            let locks = LockManager::new(Arc::new(RedisLockBackend::connect(url).await?));
            Ok((queue, Arc::new(locks)))
        }
        None => Ok(in_memory(config)),
    }
}

#[cfg(not(feature = "redis"))]
async fn backends(config: &FleetConfig) -> anyhow::Result<(Arc<dyn TaskQueue>, Arc<LockManager>)> {
    if config.redis_url.is_some() {
        tracing::warn!("FLEET_REDIS_URL set but built without the redis feature; using in-memory backends");
    }
    Ok(in_memory(config))
}

fn in_memory(config: &FleetConfig) -> (Arc<dyn TaskQueue>, Arc<LockManager>) {
    let queue: Arc<dyn TaskQueue> = InMemoryTaskQueue::arc(config.queue.clone());
    (queue, Arc::new(LockManager::in_memory()))
}
