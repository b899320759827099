//! Distribution, swap and rebalance behavior over the in-memory store.

mod common;

use std::sync::Arc;

use proptest::prelude::*;

use fleet_core::{Assignment, AssignmentStatus};
use fleet_engine::{Distributor, NoopProfileSync};

use common::Fleet;

fn distributor(fleet: &Fleet) -> Distributor {
    Distributor::new(fleet.store.clone(), Arc::new(NoopProfileSync), 3)
}

#[tokio::test]
async fn ten_items_over_three_workers_split_four_three_three() {
    let fleet = Fleet::new();
    let workers = [
        fleet.worker("w1").await,
        fleet.worker("w2").await,
        fleet.worker("w3").await,
    ];
    let campaign = fleet.campaign().await;
    fleet.items(&campaign, 10).await;

    let stats = distributor(&fleet).distribute(campaign.id, fleet.owner).await.unwrap();
    assert_eq!(stats.assigned, 10);

    let mut loads = Vec::new();
    for w in &workers {
        loads.push(fleet.store.assignments.count_active_by_worker(w.id).await.unwrap());
    }
    loads.sort_unstable();
    assert_eq!(loads, vec![3, 3, 4]);

    let again = distributor(&fleet).distribute(campaign.id, fleet.owner).await.unwrap();
    assert_eq!(again.assigned, 0);
}

#[tokio::test]
async fn third_failure_moves_item_to_other_worker() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let w2 = fleet.worker("w2").await;
    let campaign = fleet.campaign().await;
    let items = fleet.items(&campaign, 1).await;
    let assignment = Assignment::new(campaign.id, items[0].id, w1.id, fleet.owner);
    fleet.store.assignments.insert(&assignment).await.unwrap();

    let d = distributor(&fleet);
    for _ in 0..2 {
        let outcome = d.handle_failure(assignment.id, w1.id, "timeout").await.unwrap().unwrap();
        assert!(!outcome.threshold_reached);
    }
    let outcome = d.handle_failure(assignment.id, w1.id, "timeout").await.unwrap().unwrap();

    assert_eq!(outcome.swapped_to, Some(w2.id));
    let stored = fleet.store.assignments.get(assignment.id).await.unwrap().unwrap();
    assert_eq!(stored.worker_id, w2.id);
    assert_eq!(stored.previous_worker, Some(w1.id));
    assert_eq!(stored.fail_count, 0);
    assert_eq!(stored.swap_count, 1);
}

#[tokio::test]
async fn lone_worker_blocks_failing_item() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let campaign = fleet.campaign().await;
    let items = fleet.items(&campaign, 1).await;
    let assignment = Assignment::new(campaign.id, items[0].id, w1.id, fleet.owner);
    fleet.store.assignments.insert(&assignment).await.unwrap();

    let d = distributor(&fleet);
    let mut last = None;
    for _ in 0..3 {
        last = d.handle_failure(assignment.id, w1.id, "timeout").await.unwrap();
    }

    let outcome = last.unwrap();
    assert!(outcome.blocked);
    assert_eq!(outcome.swapped_to, None);
    let report = d.distribution_report(campaign.id, fleet.owner).await.unwrap();
    assert_eq!(report.blocked, 1);
    assert_eq!(report.unassigned, 0);

    // A blocked item stays occupied: redistribution must not duplicate it.
    let stats = d.distribute(campaign.id, fleet.owner).await.unwrap();
    assert_eq!(stats.assigned, 0);
}

#[tokio::test]
async fn cross_swap_can_return_item_to_previous_holder() {
    let fleet = Fleet::new();
    let a = fleet.worker("a").await;
    let b = fleet.worker("b").await;
    let campaign = fleet.campaign().await;
    let items = fleet.items(&campaign, 2).await;

    // x went b -> a earlier; y is held by b. Both are now stuck.
    let mut x = Assignment::new(campaign.id, items[0].id, b.id, fleet.owner);
    x.swap_worker(a.id);
    x.mark_blocked();
    let mut y = Assignment::new(campaign.id, items[1].id, b.id, fleet.owner);
    y.mark_blocked();
    fleet.store.assignments.insert(&x).await.unwrap();
    fleet.store.assignments.insert(&y).await.unwrap();

    let stats = distributor(&fleet)
        .perform_cross_swap(campaign.id, fleet.owner)
        .await
        .unwrap();

    assert_eq!(stats.swaps, 1);
    assert_eq!(stats.candidates, 2);
    let x = fleet.store.assignments.get(x.id).await.unwrap().unwrap();
    let y = fleet.store.assignments.get(y.id).await.unwrap().unwrap();
    assert_eq!(x.worker_id, b.id);
    assert_eq!(x.previous_worker, Some(a.id));
    assert_eq!(y.worker_id, a.id);
    assert_eq!(x.status, AssignmentStatus::Active);
    assert_eq!(y.status, AssignmentStatus::Active);
}

#[tokio::test]
async fn single_stuck_assignment_is_not_cross_swapped() {
    let fleet = Fleet::new();
    let a = fleet.worker("a").await;
    fleet.worker("b").await;
    let campaign = fleet.campaign().await;
    let items = fleet.items(&campaign, 1).await;
    let mut x = Assignment::new(campaign.id, items[0].id, a.id, fleet.owner);
    x.mark_blocked();
    fleet.store.assignments.insert(&x).await.unwrap();

    let stats = distributor(&fleet)
        .perform_cross_swap(campaign.id, fleet.owner)
        .await
        .unwrap();

    assert_eq!(stats.swaps, 0);
    assert_eq!(stats.candidates, 1);
}

#[tokio::test]
async fn rebalance_after_new_worker_joins() {
    let fleet = Fleet::new();
    let w1 = fleet.worker("w1").await;
    let campaign = fleet.campaign().await;
    fleet.items(&campaign, 6).await;
    let d = distributor(&fleet);
    d.distribute(campaign.id, fleet.owner).await.unwrap();

    let w2 = fleet.worker("w2").await;
    let stats = d.rebalance_load(campaign.id, fleet.owner).await.unwrap();

    assert_eq!(stats.target_load, 3);
    assert_eq!(stats.moved, 3);
    assert_eq!(fleet.store.assignments.count_active_by_worker(w1.id).await.unwrap(), 3);
    assert_eq!(fleet.store.assignments.count_active_by_worker(w2.id).await.unwrap(), 3);
}

#[tokio::test]
async fn rebalance_levels_five_five_one_one() {
    let fleet = Fleet::new();
    let mut workers = Vec::new();
    for label in ["w1", "w2", "w3", "w4"] {
        workers.push(fleet.worker(label).await);
    }
    let campaign = fleet.campaign().await;
    let items = fleet.items(&campaign, 12).await;
    let holders = [0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 2, 3];
    for (item, &h) in items.iter().zip(&holders) {
        let a = Assignment::new(campaign.id, item.id, workers[h].id, fleet.owner);
        fleet.store.assignments.insert(&a).await.unwrap();
    }

    let stats = distributor(&fleet).rebalance_load(campaign.id, fleet.owner).await.unwrap();

    assert_eq!(stats.moved, 4);
    assert_eq!(stats.target_load, 3);
    for w in &workers {
        assert_eq!(fleet.store.assignments.count_active_by_worker(w.id).await.unwrap(), 3);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn distribution_keeps_loads_within_one(workers in 1usize..6, items in 0usize..40) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let (assigned, loads) = rt.block_on(async {
            let fleet = Fleet::new();
            let mut ws = Vec::new();
            for i in 0..workers {
                ws.push(fleet.worker(&format!("w{i}")).await);
            }
            let campaign = fleet.campaign().await;
            fleet.items(&campaign, items).await;

            let stats = distributor(&fleet).distribute(campaign.id, fleet.owner).await.unwrap();
            let mut loads = Vec::new();
            for w in &ws {
                loads.push(fleet.store.assignments.count_active_by_worker(w.id).await.unwrap());
            }
            (stats.assigned, loads)
        });

        prop_assert_eq!(assigned, items);
        prop_assert_eq!(loads.iter().sum::<usize>(), items);
        let max = loads.iter().max().copied().unwrap_or(0);
        let min = loads.iter().min().copied().unwrap_or(0);
        prop_assert!(max - min <= 1, "loads {:?}", loads);
    }
}
