//! Periodic activation of repair schedules.

use std::sync::Arc;

use chrono::Utc;
use mender_meta::ScheduleFilter;
use mender_types::{RepairSchedule, ScheduleId, ScheduleState, Timestamp};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::RepairError;
use crate::manager::RepairManager;
use crate::setup::{RunParams, create_repair_run};

/// Cause recorded on runs spawned by a schedule.
pub const SCHEDULED_RUN_CAUSE: &str = "scheduled run";

/// Turns due schedules into started repair runs.
pub struct SchedulingManager {
    manager: Arc<RepairManager>,
}

impl SchedulingManager {
    /// Create a scheduling manager starting runs through `manager`.
    pub fn new(manager: Arc<RepairManager>) -> Self {
        Self { manager }
    }

    /// Poll the schedules every `scheduling_poll_interval`. Never returns.
    pub async fn run(&self) {
        let period = self.manager.context().config.scheduling_poll_interval;
        info!(?period, "scheduling manager started");
        let mut tick = interval(period);

        loop {
            tick.tick().await;
            match self.tick(Utc::now()).await {
                Ok(0) => {}
                Ok(started) => info!(started, "scheduled runs started"),
                Err(e) => error!(error = %e, "failed to check repair schedules"),
            }
        }
    }

    /// Activate every due `ACTIVE` schedule once. Returns how many runs
    /// were created.
    ///
    /// A schedule that fails to produce a run is left as is and tried
    /// again on the next tick.
    pub async fn tick(&self, now: Timestamp) -> Result<usize, RepairError> {
        let store = &self.manager.context().store;
        let schedules = store.list_repair_schedules(&ScheduleFilter::state(ScheduleState::Active))?;

        let mut created = 0;
        for schedule in schedules.into_iter().filter(|s| s.is_due(now)) {
            match self.activate(&schedule, now).await {
                Ok(()) => created += 1,
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "failed to activate schedule");
                }
            }
        }
        Ok(created)
    }

    async fn activate(&self, schedule: &RepairSchedule, now: Timestamp) -> Result<(), RepairError> {
        let ctx = self.manager.context();
        let unit = ctx
            .store
            .get_repair_unit(schedule.unit_id)?
            .ok_or_else(|| RepairError::not_found("repair unit", schedule.unit_id))?;
        let cluster = ctx
            .store
            .get_cluster(&unit.cluster_name)?
            .ok_or_else(|| RepairError::not_found("cluster", &unit.cluster_name))?;

        let params = RunParams {
            segment_count: schedule.segment_count,
            parallelism: schedule.parallelism,
            intensity: schedule.intensity,
        };
        let run = create_repair_run(ctx, &cluster, &unit, params, SCHEDULED_RUN_CAUSE, &schedule.owner)
            .await?;

        // The run exists from here on, so the schedule advances even if the
        // start fails; the run stays NOT_STARTED for an operator to start.
        if let Err(e) = self.manager.start_repair_run(run.id).await {
            warn!(run_id = %run.id, error = %e, "scheduled run created but not started");
        }

        let schedule = ctx
            .store
            .modify_repair_schedule(schedule.id, &|s| Ok(s.activated(run.id, now)))?;
        info!(
            schedule_id = %schedule.id,
            run_id = %run.id,
            keyspace = %unit.keyspace,
            next_activation = %schedule.next_activation,
            "schedule activated"
        );
        Ok(())
    }

    /// ACTIVE → PAUSED.
    pub fn pause_schedule(&self, id: ScheduleId) -> Result<RepairSchedule, RepairError> {
        let now = Utc::now();
        let schedule = self
            .manager
            .context()
            .store
            .modify_repair_schedule(id, &|s| Ok(s.paused(now)?))?;
        debug!(schedule_id = %id, "schedule paused");
        Ok(schedule)
    }

    /// PAUSED → ACTIVE. Activations missed while paused are skipped.
    pub fn resume_schedule(&self, id: ScheduleId) -> Result<RepairSchedule, RepairError> {
        let now = Utc::now();
        let schedule = self
            .manager
            .context()
            .store
            .modify_repair_schedule(id, &|s| Ok(s.resumed(now)?))?;
        debug!(schedule_id = %id, next_activation = %schedule.next_activation, "schedule resumed");
        Ok(schedule)
    }
}
