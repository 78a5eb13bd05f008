//! Integration test: the background loops.
//!
//! Scheduling, auto-scheduling and cleanup run as spawned tasks exactly as
//! the daemon runs them, and the tests only observe the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use mender_integration_tests::{IntegrationCluster, KEYSPACE, OWNER, fast_config};
use mender_meta::{RunFilter, ScheduleFilter};
use mender_repair::{AUTO_SCHEDULE_OWNER, NewScheduleRequest};
use mender_types::RunState;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_due_schedule_runs_to_completion() {
    let c = IntegrationCluster::new(6, 3, fast_config()).await;
    let mut request = NewScheduleRequest::new(&c.cluster.name, KEYSPACE, OWNER);
    request.days_between = Some(7);
    let schedule = c.service.create_schedule(request).await.unwrap();
    let first_activation = schedule.next_activation;

    let scheduling = Arc::clone(c.service.scheduling());
    let loop_task = tokio::spawn(async move { scheduling.run().await });

    wait_until(|| !c.service.get_schedule(schedule.id).unwrap().run_history.is_empty()).await;
    let schedule = c.service.get_schedule(schedule.id).unwrap();
    assert_eq!(schedule.run_history.len(), 1);
    assert_eq!(
        schedule.next_activation,
        first_activation + TimeDelta::days(7)
    );

    let run = c.wait_for(schedule.run_history[0], RunState::Done).await;
    assert_eq!(run.owner, OWNER);
    assert_eq!(run.last_event, "All done");

    // The next activation is a week away: no second run.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(c.service.list_runs(&RunFilter::default()).unwrap().len(), 1);
    loop_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_auto_scheduler_follows_keyspaces() {
    let mut config = fast_config();
    config.auto_scheduling.enabled = true;
    config.auto_scheduling.initial_delay = Duration::ZERO;
    config.auto_scheduling.period_between_polls = Duration::from_millis(50);
    let c = IntegrationCluster::new(4, 2, config).await;

    let keyspaces = || {
        let mut keyspaces: Vec<String> = c
            .service
            .list_schedules(&ScheduleFilter::cluster(&c.cluster.name))
            .unwrap()
            .into_iter()
            .map(|s| c.store.get_repair_unit(s.unit_id).unwrap().unwrap().keyspace)
            .collect();
        keyspaces.sort();
        keyspaces
    };
    // Registration already scheduled the existing keyspace.
    assert_eq!(keyspaces(), vec![KEYSPACE.to_string()]);

    let scheduler = Arc::clone(c.service.auto_scheduler());
    let loop_task = tokio::spawn(async move { scheduler.run().await });

    c.sim.add_keyspace("ledger", 2, &["entries"]);
    wait_until(|| keyspaces().len() == 2).await;
    assert_eq!(keyspaces(), vec![KEYSPACE.to_string(), "ledger".to_string()]);

    c.sim.remove_keyspace(KEYSPACE);
    wait_until(|| keyspaces().len() == 1).await;
    assert_eq!(keyspaces(), vec!["ledger".to_string()]);

    let schedules = c.service.list_schedules(&ScheduleFilter::default()).unwrap();
    assert!(schedules.iter().all(|s| s.owner == AUTO_SCHEDULE_OWNER));
    assert!(schedules.iter().all(|s| s.next_activation > Utc::now()));
    loop_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_cleaner_removes_finished_scheduled_runs() {
    let mut config = fast_config();
    config.cleaner_interval = Duration::from_millis(50);
    let c = IntegrationCluster::new(3, 1, config).await;

    let mut request = NewScheduleRequest::new(&c.cluster.name, KEYSPACE, OWNER);
    request.days_to_expire_after_done = Some(0);
    let schedule = c.service.create_schedule(request).await.unwrap();
    assert_eq!(c.service.scheduling().tick(Utc::now()).await.unwrap(), 1);
    let run_id = c.service.get_schedule(schedule.id).unwrap().run_history[0];
    c.wait_for(run_id, RunState::Done).await;

    // A manual run is never touched by the cleaner.
    let manual = c.start_run().await;
    c.wait_for(manual.id, RunState::Done).await;

    let cleaner = Arc::clone(c.service.cleaner());
    let loop_task = tokio::spawn(async move { cleaner.run().await });

    wait_until(|| c.store.get_repair_run(run_id).unwrap().is_none()).await;
    assert!(c.store.list_repair_segments(run_id).unwrap().is_empty());
    assert_eq!(
        c.service.get_schedule(schedule.id).unwrap().run_history,
        vec![run_id]
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(c.store.get_repair_run(manual.id).unwrap().is_some());
    loop_task.abort();
}
