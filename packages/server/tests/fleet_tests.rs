//! Fleet management: connect planning, manager capacity, disconnects.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::*;
use proptest::prelude::*;
use swarm_core::common::error::CoreError;
use swarm_core::fleet::{plan_connections, ClientKind, ManagerCapacity};
use swarm_core::testing::WorkerScript;
use uuid::Uuid;

fn idle_worker() -> WorkerScript {
    WorkerScript::Silent
}

async fn wait_for_manager_settled(harness: &Harness, expected_started: u32) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let views = harness.access.list_client_managers();
        let started: u32 = views.iter().map(|v| v.started_clients).sum();
        let pending: u32 = views.iter().map(|v| v.pending_starts).sum();
        if started == expected_started && pending == 0 {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "managers never settled at {} started clients",
            expected_started
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn fleet_wide_connect_spreads_and_skips_full_managers() {
    let harness = start_harness().await;
    let m1 = harness
        .fleet
        .connect_manager("m1", "10.0.1.1", 5, idle_worker())
        .unwrap();
    let m2 = harness
        .fleet
        .connect_manager("m2", "10.0.1.2", 3, idle_worker())
        .unwrap();
    let m3 = harness
        .fleet
        .connect_manager("m3", "10.0.1.3", 1, idle_worker())
        .unwrap();

    // Pre-fill: m1 runs 2 clients, m3 runs 1 (at its cap).
    harness.access.start_clients(m1, 2).unwrap();
    harness.access.start_clients(m3, 1).unwrap();
    wait_for_manager_settled(&harness, 3).await;

    let summary = harness.access.connect_total(6);
    assert_eq!(summary.shortfall, 0);

    let requested: HashMap<_, _> = summary
        .acks
        .iter()
        .map(|ack| (ack.manager, ack.requested))
        .collect();
    assert_eq!(requested.get(&m1), Some(&3));
    assert_eq!(requested.get(&m2), Some(&3));
    assert_eq!(requested.get(&m3), None, "full manager gets no allocation");
    assert!(summary.acks.iter().all(|ack| ack.accepted));

    // The new clients materialize and no manager exceeds its cap.
    wait_for_manager_settled(&harness, 9).await;
    for view in harness.access.list_client_managers() {
        assert!(view.started_clients <= view.max_clients);
    }

    harness.server.shutdown().await;
}

#[tokio::test]
async fn explicit_connect_requests_return_per_manager_acks() {
    let harness = start_harness().await;
    let m1 = harness
        .fleet
        .connect_manager("m1", "10.0.1.1", 2, idle_worker())
        .unwrap();
    let m2 = harness
        .fleet
        .connect_manager("m2", "10.0.1.2", 0, idle_worker())
        .unwrap();

    let mut requests = HashMap::new();
    requests.insert(m1, 4u32); // over m1's cap
    requests.insert(m2, 4u32); // unlimited

    let acks = harness.access.connect_clients(&requests);
    let by_manager: HashMap<_, _> = acks.iter().map(|a| (a.manager, a)).collect();

    assert!(!by_manager[&m1].accepted);
    assert!(by_manager[&m1].error.as_ref().unwrap().contains("capacity"));
    assert!(by_manager[&m2].accepted);

    harness.server.shutdown().await;
}

#[tokio::test]
async fn stop_clients_shrinks_the_fleet() {
    let harness = start_harness().await;
    let m1 = harness
        .fleet
        .connect_manager("m1", "10.0.1.1", 0, idle_worker())
        .unwrap();

    harness.access.start_clients(m1, 3).unwrap();
    wait_for_manager_settled(&harness, 3).await;
    assert_eq!(harness.access.list_clients(ClientKind::Load).len(), 3);

    harness.access.stop_clients(m1, -1).unwrap();
    wait_for_manager_settled(&harness, 0).await;
    assert!(harness.access.list_clients(ClientKind::Load).is_empty());

    harness.server.shutdown().await;
}

#[tokio::test]
async fn duplicate_worker_names_are_rejected() {
    let harness = start_harness().await;
    harness
        .fleet
        .connect_worker("c1", "10.0.0.1:3000", idle_worker())
        .unwrap();

    let err = harness
        .fleet
        .connect_worker("c1", "10.0.0.2:3000", idle_worker())
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateClient(_)));

    harness.server.shutdown().await;
}

#[tokio::test]
async fn disconnect_client_removes_it_from_the_fleet() {
    let harness = start_harness().await;
    let id = harness
        .fleet
        .connect_worker("c1", "10.0.0.1:3000", idle_worker())
        .unwrap();

    harness.access.disconnect_client(id, false).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !harness.access.list_clients(ClientKind::Load).is_empty() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(matches!(
        harness.access.disconnect_client(id, false).unwrap_err(),
        CoreError::NotFound(_)
    ));

    harness.server.shutdown().await;
}

// ============================================================================
// Planner properties
// ============================================================================

fn headroom(manager: &ManagerCapacity) -> u64 {
    if manager.max_clients == 0 {
        u64::from(u32::MAX)
    } else {
        u64::from(manager.max_clients.saturating_sub(manager.in_use))
    }
}

proptest! {
    /// The planner never breaches a cap and never under-allocates while
    /// total headroom covers the request.
    #[test]
    fn planner_respects_caps_and_never_underallocates(
        total in 0u32..200,
        specs in prop::collection::vec((0u32..50, 0u32..50), 0..8),
    ) {
        let managers: Vec<ManagerCapacity> = specs
            .iter()
            .map(|(in_use, max_clients)| ManagerCapacity {
                id: Uuid::new_v4(),
                in_use: *in_use,
                max_clients: *max_clients,
            })
            .collect();

        let plan = plan_connections(total, &managers);

        for (manager, (_, allocated)) in managers.iter().zip(plan.allocations.iter()) {
            prop_assert!(u64::from(*allocated) <= headroom(manager));
        }

        let total_headroom: u64 = managers.iter().map(headroom).sum();
        let expected = u64::from(total).min(total_headroom);
        prop_assert_eq!(u64::from(plan.total_allocated()), expected);
        prop_assert_eq!(
            u64::from(plan.shortfall),
            u64::from(total) - expected
        );
    }

    /// Allocation spreads evenly: two managers with equal headroom differ by
    /// at most one client.
    #[test]
    fn planner_spreads_evenly_across_equal_managers(
        total in 0u32..100,
        count in 1usize..6,
        cap in 1u32..20,
    ) {
        let managers: Vec<ManagerCapacity> = (0..count)
            .map(|_| ManagerCapacity {
                id: Uuid::new_v4(),
                in_use: 0,
                max_clients: cap,
            })
            .collect();

        let plan = plan_connections(total, &managers);
        let counts: Vec<u32> = plan.allocations.iter().map(|(_, n)| *n).collect();
        let min = counts.iter().min().copied().unwrap_or(0);
        let max = counts.iter().max().copied().unwrap_or(0);
        prop_assert!(max - min <= 1);
    }
}
