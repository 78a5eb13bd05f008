//! Integration test: full repair runs.
//!
//! Runs go from creation to DONE through the service, the manager, the
//! runners and the simulated coordinators.

use std::collections::HashSet;
use std::time::Duration;

use mender_cluster::{ClusterClient, ClusterConnector, coordinators_for};
use mender_cluster::sim::SimBehavior;
use mender_integration_tests::{IntegrationCluster, KEYSPACE, OWNER, fast_config};
use mender_repair::NewRunRequest;
use mender_types::{RunState, SegmentState};

/// Six nodes, replication factor 3, two repairs that hang. The run must
/// recover both segments and finish with every segment repaired by one of
/// its replicas.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_six_nodes_rf3_with_hanging_repairs() {
    let c = IntegrationCluster::new(6, 3, fast_config()).await;
    c.sim.script(&[
        SimBehavior::Succeed,
        SimBehavior::Hang,
        SimBehavior::Succeed,
        SimBehavior::Hang,
    ]);

    let run = c.start_run().await;

    // The first stalled attempt times out: its segment is NOT_STARTED
    // again with one failure while the run keeps RUNNING.
    loop {
        let segments = c.store.list_repair_segments(run.id).unwrap();
        if segments.iter().any(|s| s.fail_count > 0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let current = c.store.get_repair_run(run.id).unwrap().unwrap();
    assert_eq!(current.state, RunState::Running);

    let done = c.wait_for(run.id, RunState::Done).await;
    assert_eq!(done.last_event, "All done");
    assert!(done.start_time.unwrap() <= done.end_time.unwrap());

    let segments = c.store.list_repair_segments(run.id).unwrap();
    assert!(segments.iter().all(|s| s.state == SegmentState::Done));
    assert_eq!(segments.iter().map(|s| s.fail_count).sum::<u32>(), 2);
    assert_eq!(c.sim.cancelled().len(), 2);
    assert_eq!(c.sim.triggered().len(), segments.len() + 2);

    let client = c
        .service
        .context()
        .connector
        .connect(&c.sim.hosts()[0])
        .await
        .unwrap();
    let map = client.range_to_endpoint_map(KEYSPACE).await.unwrap();
    for segment in &segments {
        let host = segment.coordinator_host.as_ref().unwrap();
        assert!(
            coordinators_for(&map, &segment.range).contains(host),
            "{host} is not a replica of {}",
            segment.range
        );
    }
    while !c.service.context().segments.is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_concurrent_runs_of_different_keyspaces() {
    let c = IntegrationCluster::new(5, 2, fast_config()).await;
    c.sim.add_keyspace("audit", 2, &["entries"]);

    let first = c.start_run().await;
    let second = c
        .service
        .create_run(NewRunRequest::new(&c.cluster.name, "audit", OWNER))
        .await
        .unwrap();
    c.service.start_run(second.id).await.unwrap();

    c.wait_for(first.id, RunState::Done).await;
    c.wait_for(second.id, RunState::Done).await;

    let keyspaces: HashSet<String> = c
        .sim
        .triggered()
        .into_iter()
        .map(|t| t.request.keyspace)
        .collect();
    assert_eq!(keyspaces.len(), 2);
    for id in [first.id, second.id] {
        let status = c.service.run_status(id).unwrap();
        assert_eq!(status.segments_done, status.segments_total);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_low_intensity_spreads_repairs_out() {
    let mut config = fast_config();
    config.segment_count = 6;
    config.intensity = 0.5;
    let c = IntegrationCluster::new(3, 3, config).await;

    let started = std::time::Instant::now();
    let run = c.start_run().await;
    c.wait_for(run.id, RunState::Done).await;

    // One slot: every repair of at least 5ms is followed by an equal pause
    // before the slot takes the next segment.
    let status = c.service.run_status(run.id).unwrap();
    assert_eq!(status.segments_done, status.segments_total);
    let minimum = Duration::from_millis(10) * (status.segments_total as u32 - 1);
    assert!(started.elapsed() >= minimum);
}
