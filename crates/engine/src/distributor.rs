//! Work item distribution, failure-driven swaps and load rebalancing.
//!
//! The distributor works on one [`Store`] session. All loads are read from
//! the store at the start of each operation and never cached across calls.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use fleet_core::{
    Assignment, AssignmentId, AssignmentStatus, CampaignId, OwnerId, WorkItemId, Worker, WorkerId,
    WorkerStatus,
};
use fleet_infra::store::{Store, StoreError, StoreResult};

use crate::profile::ProfileSync;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DistributionStats {
    pub assigned: usize,
    pub total_items: usize,
    pub workers_used: usize,
    pub profiles_synced: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureOutcome {
    pub assignment: Assignment,
    pub threshold_reached: bool,
    pub swapped_to: Option<WorkerId>,
    pub blocked: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrossSwapStats {
    pub swaps: usize,
    /// Assignments that were eligible for a cross-swap.
    pub candidates: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebalanceStats {
    pub moved: usize,
    pub workers: usize,
    pub target_load: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerLoad {
    pub worker_id: WorkerId,
    pub label: String,
    pub assigned: usize,
    pub blocked: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DistributionReport {
    pub total_workers: usize,
    pub total_items: usize,
    pub assigned: usize,
    pub blocked: usize,
    pub unassigned: usize,
    pub per_worker: Vec<WorkerLoad>,
}

pub struct Distributor {
    store: Store,
    profile_sync: Arc<dyn ProfileSync>,
    max_fails: u32,
}

impl Distributor {
    pub fn new(store: Store, profile_sync: Arc<dyn ProfileSync>, max_fails: u32) -> Self {
        Self {
            store,
            profile_sync,
            max_fails,
        }
    }

    pub fn max_fails(&self) -> u32 {
        self.max_fails
    }

    async fn loads(&self, workers: &[Worker]) -> StoreResult<HashMap<WorkerId, usize>> {
        let mut loads = HashMap::with_capacity(workers.len());
        for w in workers {
            loads.insert(w.id, self.store.assignments.count_active_by_worker(w.id).await?);
        }
        Ok(loads)
    }

    /// Assign every unassigned item of `campaign` to the least loaded
    /// available worker of `owner`.
    pub async fn distribute(&self, campaign: CampaignId, owner: OwnerId) -> StoreResult<DistributionStats> {
        let workers = self.store.workers.list_available(owner).await?;
        if workers.is_empty() {
            warn!(campaign_id = %campaign, "no available workers for distribution");
            return Ok(DistributionStats::default());
        }
        let unassigned = self.store.items.list_unassigned(campaign).await?;
        if unassigned.is_empty() {
            debug!(campaign_id = %campaign, "all items already assigned");
            return Ok(DistributionStats {
                workers_used: workers.len(),
                ..Default::default()
            });
        }

        let mut loads = self.loads(&workers).await?;
        let mut first_item: Vec<(WorkerId, WorkItemId)> = Vec::new();
        let mut assigned = 0;

        for item in &unassigned {
            // Ties go to the earliest worker in list order.
            let Some(best) = workers
                .iter()
                .filter(|w| w.can_hold(loads[&w.id]))
                .min_by_key(|w| loads[&w.id])
            else {
                warn!(campaign_id = %campaign, "every worker reached its assignment cap");
                break;
            };

            let assignment = Assignment::new(campaign, item.id, best.id, owner);
            match self.store.assignments.insert(&assignment).await {
                Ok(()) => {}
                Err(StoreError::Conflict(reason)) => {
                    debug!(item_id = %item.id, reason = %reason, "item claimed concurrently");
                    continue;
                }
                Err(e) => return Err(e),
            }

            if let Some(load) = loads.get_mut(&best.id) {
                *load += 1;
            }
            if !first_item.iter().any(|(w, _)| *w == best.id) {
                first_item.push((best.id, item.id));
            }
            assigned += 1;
            info!(item_id = %item.id, worker_id = %best.id, campaign_id = %campaign, "item assigned");
        }

        let mut profiles_synced = 0;
        for (worker, item) in first_item {
            if self.profile_sync.sync(worker, item, Some(campaign)).await {
                profiles_synced += 1;
            }
        }

        Ok(DistributionStats {
            assigned,
            total_items: unassigned.len(),
            workers_used: workers.len(),
            profiles_synced,
        })
    }

    /// Count a failure reported by `reporter` and swap or block once the
    /// threshold is reached.
    ///
    /// Reports from a worker that no longer holds the assignment, or that race
    /// with another writer, change nothing and return `None`.
    pub async fn handle_failure(
        &self,
        assignment_id: AssignmentId,
        reporter: WorkerId,
        error: &str,
    ) -> StoreResult<Option<FailureOutcome>> {
        let Some(seen) = self.held_by(assignment_id, reporter).await? else {
            return Ok(None);
        };
        let mut assignment = seen.clone();

        let threshold_reached = assignment.record_failure(self.max_fails);
        debug!(
            assignment_id = %assignment.id,
            fail_count = assignment.fail_count,
            error,
            "assignment failure recorded"
        );

        let mut swapped_to = None;
        if threshold_reached {
            swapped_to = self.try_swap(&mut assignment).await?;
            if swapped_to.is_none() {
                assignment.mark_blocked();
            }
        }

        if !self.store.assignments.save_if_unchanged(&assignment, &seen).await? {
            debug!(assignment_id = %assignment_id, worker_id = %reporter, "assignment changed concurrently, failure dropped");
            return Ok(None);
        }
        if assignment.status == AssignmentStatus::Blocked {
            warn!(assignment_id = %assignment.id, worker_id = %assignment.worker_id, "assignment blocked, no swap candidate");
        }

        if let Some(worker) = swapped_to {
            self.profile_sync
                .sync(worker, assignment.work_item_id, Some(assignment.campaign_id))
                .await;
        }

        let blocked = assignment.status == AssignmentStatus::Blocked;
        Ok(Some(FailureOutcome {
            assignment,
            threshold_reached,
            swapped_to,
            blocked,
        }))
    }

    /// The stored assignment if `worker` still holds it and it still occupies
    /// its item.
    async fn held_by(&self, assignment_id: AssignmentId, worker: WorkerId) -> StoreResult<Option<Assignment>> {
        let Some(assignment) = self.store.assignments.get(assignment_id).await? else {
            return Ok(None);
        };
        if assignment.worker_id != worker || !assignment.occupies_item() {
            debug!(
                assignment_id = %assignment_id,
                reporter = %worker,
                holder = %assignment.worker_id,
                "stale report ignored"
            );
            return Ok(None);
        }
        Ok(Some(assignment))
    }

    /// Move `assignment` to the least loaded available worker that is neither
    /// its current nor its previous holder. Does not persist.
    pub async fn try_swap(&self, assignment: &mut Assignment) -> StoreResult<Option<WorkerId>> {
        let candidates: Vec<Worker> = self
            .store
            .workers
            .list_available(assignment.owner)
            .await?
            .into_iter()
            .filter(|w| w.id != assignment.worker_id && Some(w.id) != assignment.previous_worker)
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let loads = self.loads(&candidates).await?;
        let Some(best) = candidates.iter().min_by_key(|w| loads[&w.id]) else {
            return Ok(None);
        };

        let old = assignment.worker_id;
        assignment.swap_worker(best.id);
        warn!(
            assignment_id = %assignment.id,
            old_worker_id = %old,
            new_worker_id = %best.id,
            swap_count = assignment.swap_count,
            "worker swapped"
        );
        Ok(Some(best.id))
    }

    /// Clear the failure streak after a success reported by `reporter`.
    pub async fn handle_success(
        &self,
        assignment_id: AssignmentId,
        reporter: WorkerId,
    ) -> StoreResult<Option<Assignment>> {
        let Some(seen) = self.held_by(assignment_id, reporter).await? else {
            return Ok(None);
        };
        let mut assignment = seen.clone();
        assignment.record_success();
        if !self.store.assignments.save_if_unchanged(&assignment, &seen).await? {
            debug!(assignment_id = %assignment_id, worker_id = %reporter, "assignment changed concurrently, success dropped");
            return Ok(None);
        }
        Ok(Some(assignment))
    }

    /// Pair up failing assignments held by different workers and trade their
    /// items: A's item goes to B and B's item goes to A.
    ///
    /// The receiving worker's own history on the item is not consulted, so an
    /// item can return to the worker it was swapped away from.
    pub async fn perform_cross_swap(&self, campaign: CampaignId, owner: OwnerId) -> StoreResult<CrossSwapStats> {
        let needing_swap = self
            .store
            .assignments
            .list_needing_swap(campaign, self.max_fails)
            .await?;
        let candidates = needing_swap.len();
        if candidates < 2 {
            return Ok(CrossSwapStats { swaps: 0, candidates });
        }

        let available: HashSet<WorkerId> = self
            .store
            .workers
            .list_available(owner)
            .await?
            .into_iter()
            .map(|w| w.id)
            .collect();

        let mut order: Vec<WorkerId> = Vec::new();
        let mut groups: HashMap<WorkerId, Vec<Assignment>> = HashMap::new();
        for a in needing_swap {
            if !groups.contains_key(&a.worker_id) {
                order.push(a.worker_id);
            }
            groups.entry(a.worker_id).or_default().push(a);
        }

        let mut swaps = 0;
        for i in 0..order.len() {
            for j in (i + 1)..order.len() {
                let (worker_a, worker_b) = (order[i], order[j]);
                if groups[&worker_a].is_empty() || groups[&worker_b].is_empty() {
                    continue;
                }
                let (Some(mut a), Some(mut b)) = (
                    groups.get_mut(&worker_a).and_then(Vec::pop),
                    groups.get_mut(&worker_b).and_then(Vec::pop),
                ) else {
                    continue;
                };

                let (seen_a, seen_b) = (a.clone(), b.clone());
                a.swap_worker(worker_b);
                b.swap_worker(worker_a);
                if !self.store.assignments.save_if_unchanged(&a, &seen_a).await? {
                    debug!(assignment_id = %a.id, "assignment changed concurrently, cross-swap skipped");
                    continue;
                }
                if !self.store.assignments.save_if_unchanged(&b, &seen_b).await? {
                    // a has already moved; b stays with its current holder.
                    debug!(assignment_id = %b.id, "assignment changed concurrently, cross-swap left one-sided");
                    if available.contains(&worker_b) {
                        self.profile_sync.sync(worker_b, a.work_item_id, Some(campaign)).await;
                    }
                    continue;
                }
                swaps += 1;
                info!(
                    item_a = %a.work_item_id,
                    item_b = %b.work_item_id,
                    worker_a = %worker_a,
                    worker_b = %worker_b,
                    "cross-swap performed"
                );

                if available.contains(&worker_b) {
                    self.profile_sync.sync(worker_b, a.work_item_id, Some(campaign)).await;
                }
                if available.contains(&worker_a) {
                    self.profile_sync.sync(worker_a, b.work_item_id, Some(campaign)).await;
                }
            }
        }

        Ok(CrossSwapStats { swaps, candidates })
    }

    /// Move assignments from overloaded to underloaded workers within
    /// `campaign`.
    pub async fn rebalance_load(&self, campaign: CampaignId, owner: OwnerId) -> StoreResult<RebalanceStats> {
        let workers = self.store.workers.list_available(owner).await?;
        if workers.len() < 2 {
            return Ok(RebalanceStats {
                workers: workers.len(),
                ..Default::default()
            });
        }

        let mut loads: HashMap<WorkerId, usize> = HashMap::new();
        let mut held: HashMap<WorkerId, Vec<Assignment>> = HashMap::new();
        for w in &workers {
            let active = self
                .store
                .assignments
                .list_active_by_worker(w.id, Some(campaign))
                .await?;
            loads.insert(w.id, active.len());
            held.insert(w.id, active);
        }

        let total: usize = loads.values().sum();
        let target = total / workers.len();
        let remainder = total % workers.len();
        let allowance = usize::from(remainder > 0);

        let overloaded: Vec<WorkerId> = workers
            .iter()
            .map(|w| w.id)
            .filter(|id| loads[id] > target + 1)
            .collect();
        let mut underloaded: Vec<WorkerId> = workers
            .iter()
            .map(|w| w.id)
            .filter(|id| loads[id] < target)
            .collect();

        let mut moved = 0;
        for over in overloaded {
            let excess = loads[&over].saturating_sub(target + allowance);
            let to_move: Vec<Assignment> = held
                .get(&over)
                .map(|v| v.iter().take(excess).cloned().collect())
                .unwrap_or_default();

            for seen in to_move {
                let Some(&under) = underloaded.first() else {
                    break;
                };
                let mut assignment = seen.clone();
                assignment.swap_worker(under);
                if !self.store.assignments.save_if_unchanged(&assignment, &seen).await? {
                    debug!(assignment_id = %assignment.id, "assignment changed concurrently, not moved");
                    continue;
                }
                if let Some(l) = loads.get_mut(&over) {
                    *l -= 1;
                }
                if let Some(l) = loads.get_mut(&under) {
                    *l += 1;
                }
                moved += 1;
                debug!(
                    assignment_id = %assignment.id,
                    from_worker = %over,
                    to_worker = %under,
                    "assignment moved for balance"
                );
                self.profile_sync
                    .sync(under, assignment.work_item_id, Some(campaign))
                    .await;
                underloaded.retain(|id| loads[id] < target);
            }
        }

        if moved > 0 {
            info!(campaign_id = %campaign, moved, target_load = target, "load rebalanced");
        }
        Ok(RebalanceStats {
            moved,
            workers: workers.len(),
            target_load: target,
        })
    }

    pub async fn distribution_report(&self, campaign: CampaignId, owner: OwnerId) -> StoreResult<DistributionReport> {
        let mut workers: Vec<Worker> = self
            .store
            .workers
            .list_by_status(WorkerStatus::Active)
            .await?
            .into_iter()
            .filter(|w| w.owner == owner)
            .collect();
        workers.sort_by_key(|w| (w.created_at, w.id));
        let items = self.store.items.list_by_campaign(campaign).await?;
        let assignments = self.store.assignments.list_by_campaign(campaign).await?;

        let count = |worker: Option<WorkerId>, status: AssignmentStatus| {
            assignments
                .iter()
                .filter(|a| a.status == status && worker.is_none_or(|w| a.worker_id == w))
                .count()
        };
        let occupied: HashSet<WorkItemId> = assignments
            .iter()
            .filter(|a| a.occupies_item())
            .map(|a| a.work_item_id)
            .collect();

        let per_worker = workers
            .iter()
            .map(|w| WorkerLoad {
                worker_id: w.id,
                label: w.label.clone(),
                assigned: count(Some(w.id), AssignmentStatus::Active),
                blocked: count(Some(w.id), AssignmentStatus::Blocked),
            })
            .collect();

        Ok(DistributionReport {
            total_workers: workers.len(),
            total_items: items.len(),
            assigned: count(None, AssignmentStatus::Active),
            blocked: count(None, AssignmentStatus::Blocked),
            unassigned: items.iter().filter(|i| !occupied.contains(&i.id)).count(),
            per_worker,
        })
    }
}
