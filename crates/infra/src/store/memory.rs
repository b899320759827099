//! In-memory repositories for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rand::Rng;

use fleet_core::{
    Assignment, AssignmentId, Campaign, CampaignId, Entity, OwnerId, WorkItem, WorkItemId,
    WorkItemStatus, Worker, WorkerId, WorkerStatus,
};

use super::{
    AssignmentRepository, CampaignRepository, SessionFactory, Store, StoreError, StoreResult,
    WorkItemRepository, WorkerRepository,
};

#[derive(Debug)]
struct Table<E: Entity> {
    rows: HashMap<E::Id, E>,
}

impl<E: Entity> Default for Table<E> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }
}

impl<E: Entity + Clone> Table<E> {
    fn get(&self, id: &E::Id) -> Option<E> {
        self.rows.get(id).cloned()
    }

    fn upsert(&mut self, row: E) {
        self.rows.insert(*row.id(), row);
    }

    fn modify(&mut self, id: &E::Id, f: impl FnOnce(&mut E)) -> Option<E> {
        let row = self.rows.get_mut(id)?;
        f(row);
        Some(row.clone())
    }

    fn remove(&mut self, id: &E::Id) -> bool {
        self.rows.remove(id).is_some()
    }

    fn select(&self, pred: impl Fn(&E) -> bool) -> Vec<E> {
        self.rows.values().filter(|r| pred(r)).cloned().collect()
    }
}

#[derive(Debug, Default)]
struct Tables {
    workers: Table<Worker>,
    items: Table<WorkItem>,
    assignments: Table<Assignment>,
    campaigns: Table<Campaign>,
}

impl Tables {
    fn active_load(&self, worker: WorkerId) -> usize {
        self.assignments
            .rows
            .values()
            .filter(|a| a.worker_id == worker && a.is_active())
            .count()
    }
}

/// In-memory store backing all four repositories.
///
/// [`InMemoryStore::set_unavailable`] simulates an outage: every call then
/// fails with [`StoreError::Unavailable`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// A [`Store`] whose repositories all point at `self`.
    pub fn store(self: &Arc<Self>) -> Store {
        Store {
            workers: self.clone(),
            items: self.clone(),
            assignments: self.clone(),
            campaigns: self.clone(),
        }
    }

    pub fn session_factory(self: &Arc<Self>) -> Arc<dyn SessionFactory> {
        Arc::new(InMemorySessionFactory {
            store: self.clone(),
        })
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".into()));
        }
        Ok(())
    }
}

/// Hands out sessions over one shared [`InMemoryStore`].
#[derive(Debug, Clone)]
pub struct InMemorySessionFactory {
    store: Arc<InMemoryStore>,
}

#[async_trait::async_trait]
impl SessionFactory for InMemorySessionFactory {
    async fn open(&self) -> StoreResult<Store> {
        self.store.check()?;
        Ok(self.store.store())
    }
}

fn by_creation<T>(rows: &mut [T], key: impl Fn(&T) -> (DateTime<Utc>, uuid::Uuid)) {
    rows.sort_by_key(|r| key(r));
}

#[async_trait::async_trait]
impl WorkerRepository for InMemoryStore {
    async fn get(&self, id: WorkerId) -> StoreResult<Option<Worker>> {
        self.check()?;
        Ok(self.tables.read().unwrap().workers.get(&id))
    }

    async fn save(&self, worker: &Worker) -> StoreResult<()> {
        self.check()?;
        self.tables.write().unwrap().workers.upsert(worker.clone());
        Ok(())
    }

    async fn delete(&self, id: WorkerId) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.write().unwrap();
        tables.assignments.rows.retain(|_, a| a.worker_id != id);
        Ok(tables.workers.remove(&id))
    }

    async fn list_by_status(&self, status: WorkerStatus) -> StoreResult<Vec<Worker>> {
        self.check()?;
        let mut rows = self.tables.read().unwrap().workers.select(|w| w.status == status);
        by_creation(&mut rows, |w| (w.created_at, *w.id.as_uuid()));
        Ok(rows)
    }

    async fn list_available(&self, owner: OwnerId) -> StoreResult<Vec<Worker>> {
        self.check()?;
        let tables = self.tables.read().unwrap();
        let mut rows = tables
            .workers
            .select(|w| w.owner == owner && w.has_capacity(tables.active_load(w.id)));
        rows.sort_by_key(|w| (w.daily_actions, w.created_at, *w.id.as_uuid()));
        Ok(rows)
    }

    async fn record_action(&self, id: WorkerId) -> StoreResult<Option<Worker>> {
        self.check()?;
        Ok(self
            .tables
            .write()
            .unwrap()
            .workers
            .modify(&id, Worker::record_action))
    }

    async fn reset_hourly(&self) -> StoreResult<usize> {
        self.check()?;
        let mut tables = self.tables.write().unwrap();
        let mut changed = 0;
        for w in tables.workers.rows.values_mut() {
            if w.hourly_actions > 0 {
                w.reset_hourly();
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn initialize_daily_reset_hours(&self) -> StoreResult<usize> {
        self.check()?;
        let mut rng = rand::thread_rng();
        let mut tables = self.tables.write().unwrap();
        let mut seeded = 0;
        for w in tables.workers.rows.values_mut() {
            if w.daily_reset_hour.is_none() {
                w.daily_reset_hour = Some(rng.gen_range(0..24));
                seeded += 1;
            }
        }
        Ok(seeded)
    }

    async fn reset_daily(&self, hour: u8) -> StoreResult<usize> {
        self.check()?;
        let mut tables = self.tables.write().unwrap();
        let mut changed = 0;
        for w in tables.workers.rows.values_mut() {
            if w.daily_reset_hour == Some(hour) {
                w.reset_daily();
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[async_trait::async_trait]
impl WorkItemRepository for InMemoryStore {
    async fn get(&self, id: WorkItemId) -> StoreResult<Option<WorkItem>> {
        self.check()?;
        Ok(self.tables.read().unwrap().items.get(&id))
    }

    async fn save(&self, item: &WorkItem) -> StoreResult<()> {
        self.check()?;
        self.tables.write().unwrap().items.upsert(item.clone());
        Ok(())
    }

    async fn delete(&self, id: WorkItemId) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.write().unwrap();
        tables.assignments.rows.retain(|_, a| a.work_item_id != id);
        Ok(tables.items.remove(&id))
    }

    async fn list_by_campaign(&self, campaign: CampaignId) -> StoreResult<Vec<WorkItem>> {
        self.check()?;
        let mut rows = self
            .tables
            .read()
            .unwrap()
            .items
            .select(|i| i.campaign_id == campaign);
        by_creation(&mut rows, |i| (i.created_at, *i.id.as_uuid()));
        Ok(rows)
    }

    async fn list_unassigned(&self, campaign: CampaignId) -> StoreResult<Vec<WorkItem>> {
        self.check()?;
        let tables = self.tables.read().unwrap();
        let mut rows = tables.items.select(|i| {
            i.campaign_id == campaign
                && i.status == WorkItemStatus::Active
                && !tables.assignments.rows.values().any(|a| {
                    a.work_item_id == i.id && a.campaign_id == campaign && a.occupies_item()
                })
        });
        by_creation(&mut rows, |i| (i.created_at, *i.id.as_uuid()));
        Ok(rows)
    }
}

#[async_trait::async_trait]
impl AssignmentRepository for InMemoryStore {
    async fn get(&self, id: AssignmentId) -> StoreResult<Option<Assignment>> {
        self.check()?;
        Ok(self.tables.read().unwrap().assignments.get(&id))
    }

    async fn insert(&self, assignment: &Assignment) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.tables.write().unwrap();
        let occupied = tables.assignments.rows.values().any(|a| {
            a.work_item_id == assignment.work_item_id
                && a.campaign_id == assignment.campaign_id
                && a.occupies_item()
        });
        if occupied && assignment.occupies_item() {
            return Err(StoreError::Conflict(format!(
                "work item {} already assigned in campaign {}",
                assignment.work_item_id, assignment.campaign_id
            )));
        }
        if tables.assignments.rows.contains_key(&assignment.id) {
            return Err(StoreError::Conflict(format!(
                "assignment {} already exists",
                assignment.id
            )));
        }
        tables.assignments.upsert(assignment.clone());
        Ok(())
    }

    async fn save(&self, assignment: &Assignment) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.tables.write().unwrap();
        if !tables.assignments.rows.contains_key(&assignment.id) {
            return Err(StoreError::NotFound(format!("assignment {}", assignment.id)));
        }
        tables.assignments.upsert(assignment.clone());
        Ok(())
    }

    async fn save_if_unchanged(&self, assignment: &Assignment, seen: &Assignment) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.write().unwrap();
        match tables.assignments.rows.get(&assignment.id) {
            None => Err(StoreError::NotFound(format!("assignment {}", assignment.id))),
            Some(current) if current != seen => Ok(false),
            Some(_) => {
                tables.assignments.upsert(assignment.clone());
                Ok(true)
            }
        }
    }

    async fn delete(&self, id: AssignmentId) -> StoreResult<bool> {
        self.check()?;
        Ok(self.tables.write().unwrap().assignments.remove(&id))
    }

    async fn list_by_campaign(&self, campaign: CampaignId) -> StoreResult<Vec<Assignment>> {
        self.check()?;
        let mut rows = self
            .tables
            .read()
            .unwrap()
            .assignments
            .select(|a| a.campaign_id == campaign);
        by_creation(&mut rows, |a| (a.assigned_at, *a.id.as_uuid()));
        Ok(rows)
    }

    async fn list_active_by_worker(
        &self,
        worker: WorkerId,
        campaign: Option<CampaignId>,
    ) -> StoreResult<Vec<Assignment>> {
        self.check()?;
        let mut rows = self.tables.read().unwrap().assignments.select(|a| {
            a.worker_id == worker && a.is_active() && campaign.is_none_or(|c| a.campaign_id == c)
        });
        by_creation(&mut rows, |a| (a.assigned_at, *a.id.as_uuid()));
        Ok(rows)
    }

    async fn count_active_by_worker(&self, worker: WorkerId) -> StoreResult<usize> {
        self.check()?;
        Ok(self.tables.read().unwrap().active_load(worker))
    }

    async fn list_needing_swap(
        &self,
        campaign: CampaignId,
        threshold: u32,
    ) -> StoreResult<Vec<Assignment>> {
        self.check()?;
        let mut rows = self
            .tables
            .read()
            .unwrap()
            .assignments
            .select(|a| a.campaign_id == campaign && a.needs_swap(threshold) && a.occupies_item());
        by_creation(&mut rows, |a| (a.assigned_at, *a.id.as_uuid()));
        Ok(rows)
    }
}

#[async_trait::async_trait]
impl CampaignRepository for InMemoryStore {
    async fn get(&self, id: CampaignId) -> StoreResult<Option<Campaign>> {
        self.check()?;
        Ok(self.tables.read().unwrap().campaigns.get(&id))
    }

    async fn save(&self, campaign: &Campaign) -> StoreResult<()> {
        self.check()?;
        self.tables.write().unwrap().campaigns.upsert(campaign.clone());
        Ok(())
    }

    async fn list_active(&self) -> StoreResult<Vec<Campaign>> {
        self.check()?;
        let mut rows = self
            .tables
            .read()
            .unwrap()
            .campaigns
            .select(Campaign::is_active);
        by_creation(&mut rows, |c| (c.created_at, *c.id.as_uuid()));
        Ok(rows)
    }

    async fn record_result(&self, id: CampaignId, success: bool) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.write().unwrap();
        Ok(tables.campaigns.modify(&id, |c| c.record_result(success)).is_some())
    }

    async fn record_batch_sent(&self, id: CampaignId, at: DateTime<Utc>) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.write().unwrap();
        Ok(tables
            .campaigns
            .modify(&id, |c| c.schedule.record_batch_sent(at))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::WorkerLimits;

    fn active_worker(owner: OwnerId, label: &str) -> Worker {
        let mut w = Worker::new(owner, label);
        w.activate(vec![0]).unwrap();
        w
    }

    fn active_item(campaign: CampaignId, owner: OwnerId, handle: &str) -> WorkItem {
        let mut item = WorkItem::new(campaign, owner, handle);
        item.mark_active(None);
        item
    }

    #[tokio::test]
    async fn insert_rejects_second_live_assignment() {
        let store = InMemoryStore::arc();
        let owner = OwnerId::new();
        let campaign = CampaignId::new();
        let item = active_item(campaign, owner, "chan");
        let (w1, w2) = (WorkerId::new(), WorkerId::new());

        let first = Assignment::new(campaign, item.id, w1, owner);
        AssignmentRepository::insert(&*store, &first).await.unwrap();

        let second = Assignment::new(campaign, item.id, w2, owner);
        let err = AssignmentRepository::insert(&*store, &second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let mut blocked = first.clone();
        blocked.mark_blocked();
        AssignmentRepository::save(&*store, &blocked).await.unwrap();
        assert!(AssignmentRepository::insert(&*store, &second).await.is_err());
    }

    #[tokio::test]
    async fn save_if_unchanged_rejects_stale_copy() {
        let store = InMemoryStore::arc();
        let owner = OwnerId::new();
        let campaign = CampaignId::new();
        let item = active_item(campaign, owner, "chan");
        let (w1, w2) = (WorkerId::new(), WorkerId::new());
        let original = Assignment::new(campaign, item.id, w1, owner);
        AssignmentRepository::insert(&*store, &original).await.unwrap();

        let mut moved = original.clone();
        moved.swap_worker(w2);
        assert!(AssignmentRepository::save_if_unchanged(&*store, &moved, &original).await.unwrap());

        let mut stale = original.clone();
        stale.record_failure(3);
        assert!(!AssignmentRepository::save_if_unchanged(&*store, &stale, &original).await.unwrap());

        let stored = AssignmentRepository::get(&*store, original.id).await.unwrap().unwrap();
        assert_eq!(stored.worker_id, w2);
        assert_eq!(stored.fail_count, 0);
    }

    #[tokio::test]
    async fn unassigned_excludes_occupied_and_inactive_items() {
        let store = InMemoryStore::arc();
        let s = store.store();
        let owner = OwnerId::new();
        let campaign = CampaignId::new();

        let free = active_item(campaign, owner, "free");
        let taken = active_item(campaign, owner, "taken");
        let pending = WorkItem::new(campaign, owner, "pending");
        for item in [&free, &taken, &pending] {
            s.items.save(item).await.unwrap();
        }
        s.assignments
            .insert(&Assignment::new(campaign, taken.id, WorkerId::new(), owner))
            .await
            .unwrap();

        let unassigned = s.items.list_unassigned(campaign).await.unwrap();
        assert_eq!(unassigned.iter().map(|i| i.id).collect::<Vec<_>>(), vec![free.id]);
    }

    #[tokio::test]
    async fn deleting_item_or_worker_cascades() {
        let store = InMemoryStore::arc();
        let s = store.store();
        let owner = OwnerId::new();
        let campaign = CampaignId::new();
        let worker = active_worker(owner, "w");
        let a_item = active_item(campaign, owner, "a");
        let b_item = active_item(campaign, owner, "b");
        s.workers.save(&worker).await.unwrap();
        for item in [&a_item, &b_item] {
            s.items.save(item).await.unwrap();
            s.assignments
                .insert(&Assignment::new(campaign, item.id, worker.id, owner))
                .await
                .unwrap();
        }

        assert!(s.items.delete(a_item.id).await.unwrap());
        assert_eq!(s.assignments.count_active_by_worker(worker.id).await.unwrap(), 1);

        assert!(s.workers.delete(worker.id).await.unwrap());
        assert!(s.assignments.list_by_campaign(campaign).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn available_workers_respect_owner_and_capacity() {
        let store = InMemoryStore::arc();
        let s = store.store();
        let owner = OwnerId::new();
        let campaign = CampaignId::new();

        let busy = active_worker(owner, "busy").with_limits(WorkerLimits {
            max_assignments: Some(1),
            ..WorkerLimits::default()
        });
        let idle = active_worker(owner, "idle");
        let foreign = active_worker(OwnerId::new(), "foreign");
        let mut paused = active_worker(owner, "paused");
        paused.pause().unwrap();
        for w in [&busy, &idle, &foreign, &paused] {
            s.workers.save(w).await.unwrap();
        }
        let item = active_item(campaign, owner, "x");
        s.assignments
            .insert(&Assignment::new(campaign, item.id, busy.id, owner))
            .await
            .unwrap();

        let available = s.workers.list_available(owner).await.unwrap();
        assert_eq!(available.iter().map(|w| w.id).collect::<Vec<_>>(), vec![idle.id]);
    }

    #[tokio::test]
    async fn daily_reset_only_touches_matching_hour() {
        let store = InMemoryStore::arc();
        let s = store.store();
        let owner = OwnerId::new();
        let mut early = active_worker(owner, "early");
        early.daily_reset_hour = Some(3);
        early.record_action();
        let mut late = active_worker(owner, "late");
        late.daily_reset_hour = Some(17);
        late.record_action();
        let mut unseeded = active_worker(owner, "new");
        unseeded.record_action();
        for w in [&early, &late, &unseeded] {
            s.workers.save(w).await.unwrap();
        }

        assert_eq!(s.workers.initialize_daily_reset_hours().await.unwrap(), 1);
        assert!(s.workers.get(unseeded.id).await.unwrap().unwrap().daily_reset_hour.unwrap() < 24);

        s.workers.reset_daily(3).await.unwrap();
        assert_eq!(s.workers.get(early.id).await.unwrap().unwrap().daily_actions, 0);
        assert_eq!(s.workers.get(late.id).await.unwrap().unwrap().daily_actions, 1);

        assert_eq!(s.workers.reset_hourly().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn outage_surfaces_as_unavailable() {
        let store = InMemoryStore::arc();
        let sessions = store.session_factory();
        store.set_unavailable(true);
        assert!(matches!(sessions.open().await, Err(StoreError::Unavailable(_))));
        store.set_unavailable(false);
        assert!(sessions.open().await.is_ok());
    }

    #[tokio::test]
    async fn counters_update_in_place() {
        let store = InMemoryStore::arc();
        let s = store.store();
        let owner = OwnerId::new();
        let worker = active_worker(owner, "w");
        s.workers.save(&worker).await.unwrap();
        let campaign = Campaign::new(owner, "c");
        s.campaigns.save(&campaign).await.unwrap();

        let updated = s.workers.record_action(worker.id).await.unwrap().unwrap();
        assert_eq!(updated.daily_actions, 1);
        assert!(s.workers.record_action(WorkerId::new()).await.unwrap().is_none());

        assert!(s.campaigns.record_result(campaign.id, false).await.unwrap());
        let now = Utc::now();
        assert!(s.campaigns.record_batch_sent(campaign.id, now).await.unwrap());
        let stored = s.campaigns.get(campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.failed_actions, 1);
        assert_eq!(stored.schedule.last_batch_at, Some(now));
    }
}
