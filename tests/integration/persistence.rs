//! Integration test: crash recovery.
//!
//! A run is interrupted by tearing down the runtime that drives it, which
//! drops every task mid-flight the way a killed process would. A new
//! service over the same Fjall directory must finish the run.

use std::time::Duration;

use mender_integration_tests::{IntegrationCluster, fast_config};
use mender_types::{RunState, SegmentState};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

#[test]
#[ntest::timeout(60000)]
fn test_run_survives_restart() {
    let mut config = fast_config();
    config.segment_count = 40;

    // --- First life: start the run, crash mid-way ---
    let first = runtime();
    let (sim, dir, run_id) = first.block_on(async {
        let c = IntegrationCluster::with_fjall(6, 3, config.clone()).await;
        let run = c.start_run().await;
        while c.done_segments(run.id) < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let (sim, dir) = c.into_parts();
        (sim, dir.unwrap(), run.id)
    });
    drop(first);

    // --- Second life: reopen and resume ---
    let second = runtime();
    second.block_on(async {
        let c = IntegrationCluster::reopen(sim, dir, config);
        let interrupted = c.store.get_repair_run(run_id).unwrap().unwrap();
        assert_eq!(interrupted.state, RunState::Running);
        assert!(c.done_segments(run_id) >= 5);

        let resumed = c.service.manager().resume_running_runs().await.unwrap();
        assert_eq!(resumed, 1);

        let done = c.wait_for(run_id, RunState::Done).await;
        assert_eq!(done.start_time, interrupted.start_time);
        assert_eq!(done.last_event, "All done");
        let segments = c.store.list_repair_segments(run_id).unwrap();
        assert!(segments.iter().all(|s| s.state == SegmentState::Done));
    });
}

#[test]
#[ntest::timeout(60000)]
fn test_paused_run_stays_paused_after_restart() {
    let first = runtime();
    let (sim, dir, run_id) = first.block_on(async {
        let c = IntegrationCluster::with_fjall(3, 1, fast_config()).await;
        let run = c.start_run().await;
        c.service.pause_run(run.id).unwrap();
        let (sim, dir) = c.into_parts();
        (sim, dir.unwrap(), run.id)
    });
    drop(first);

    let second = runtime();
    second.block_on(async {
        let c = IntegrationCluster::reopen(sim, dir, fast_config());
        assert_eq!(c.service.manager().resume_running_runs().await.unwrap(), 0);
        assert_eq!(
            c.store.get_repair_run(run_id).unwrap().unwrap().state,
            RunState::Paused
        );

        c.service.resume_run(run_id).await.unwrap();
        c.wait_for(run_id, RunState::Done).await;
    });
}
