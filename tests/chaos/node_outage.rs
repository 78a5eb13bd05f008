//! Chaos test: nodes flapping during a repair run.
//!
//! A background task keeps taking random nodes down and bringing them back
//! while coordinators also fail and hang now and then. The run must ride
//! it out: every segment repaired, never an error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mender_cluster::sim::SimBehavior;
use mender_integration_tests::{IntegrationCluster, fast_config};
use mender_types::{RunState, SegmentState};
use rand::Rng;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_run_survives_flapping_nodes() {
    let mut config = fast_config();
    config.segment_count = 32;
    let c = IntegrationCluster::new(7, 3, config).await;
    c.sim.script(&[
        SimBehavior::Fail,
        SimBehavior::Succeed,
        SimBehavior::Hang,
        SimBehavior::Succeed,
        SimBehavior::Fail,
    ]);

    let run = c.start_run().await;

    let stop = Arc::new(AtomicBool::new(false));
    let flapper = {
        let sim = Arc::clone(&c.sim);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let hosts = sim.hosts().to_vec();
            while !stop.load(Ordering::Relaxed) {
                let index = rand::rng().random_range(0..hosts.len());
                sim.set_host_down(&hosts[index], true);
                tokio::time::sleep(Duration::from_millis(30)).await;
                sim.set_host_down(&hosts[index], false);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    // Poll until done, failing fast on an error.
    loop {
        let current = c.store.get_repair_run(run.id).unwrap().unwrap();
        assert_ne!(
            current.state,
            RunState::Error,
            "run failed: {}",
            current.last_event
        );
        if current.state == RunState::Done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    stop.store(true, Ordering::Relaxed);
    flapper.await.unwrap();
    for host in c.sim.hosts() {
        c.sim.set_host_down(host, false);
    }

    let segments = c.store.list_repair_segments(run.id).unwrap();
    assert!(segments.iter().all(|s| s.state == SegmentState::Done));
    let failures: u32 = segments.iter().map(|s| s.fail_count).sum();
    assert!(failures >= 3, "scripted failures and hang were retried");
    while !c.service.context().segments.is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
