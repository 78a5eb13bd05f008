//! Removal of expired scheduled runs.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use mender_meta::ScheduleFilter;
use mender_types::{RunState, Timestamp};
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::RepairError;
use crate::context::RepairContext;

/// Deletes `DONE` runs of schedules that keep finished runs for a limited
/// number of days.
pub struct RunCleaner {
    ctx: Arc<RepairContext>,
}

impl RunCleaner {
    /// Create a cleaner working on the given context.
    pub fn new(ctx: Arc<RepairContext>) -> Self {
        Self { ctx }
    }

    /// Clean every `cleaner_interval`. Never returns.
    pub async fn run(&self) {
        let mut tick = interval(self.ctx.config.cleaner_interval);
        loop {
            tick.tick().await;
            match self.clean(Utc::now()) {
                Ok(0) => debug!("no expired runs"),
                Ok(removed) => info!(removed, "expired repair runs removed"),
                Err(e) => error!(error = %e, "run cleanup failed"),
            }
        }
    }

    /// Delete the runs that expired at `now`. Returns how many were deleted.
    ///
    /// Schedule histories are append-only: ids of deleted runs stay in
    /// them and are skipped here like anywhere else.
    pub fn clean(&self, now: Timestamp) -> Result<usize, RepairError> {
        let store = &self.ctx.store;
        let mut removed = 0;

        for schedule in store.list_repair_schedules(&ScheduleFilter::default())? {
            let Some(days) = schedule.days_to_expire_after_done else {
                continue;
            };
            let retention = TimeDelta::days(i64::from(days));

            for run_id in &schedule.run_history {
                let Some(run) = store.get_repair_run(*run_id)? else {
                    continue;
                };
                let ended = match (run.state, run.end_time) {
                    (RunState::Done, Some(end)) => end,
                    _ => continue,
                };
                if ended + retention <= now {
                    store.delete_repair_run(run.id)?;
                    debug!(run_id = %run.id, schedule_id = %schedule.id, "expired run deleted");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
