//! Automatic schedules: one per user keyspace of every registered cluster.
//!
//! Each poll compares the keyspaces a cluster reports with the keyspaces
//! that have a schedule. Schedules of keyspaces that disappeared are
//! deleted; new user keyspaces with tables get a schedule whose first activation is spread
//! out so that freshly discovered keyspaces do not all start together.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use mender_meta::ScheduleFilter;
use mender_types::{Cluster, NewRepairSchedule, RepairUnitScope, ScheduleId, Timestamp};
use tracing::{debug, error, info};

use crate::RepairError;
use crate::context::RepairContext;

/// Owner of the schedules created automatically.
pub const AUTO_SCHEDULE_OWNER: &str = "auto-scheduling";

/// Keyspaces that never get a schedule.
const SYSTEM_KEYSPACES: [&str; 5] = [
    "system",
    "system_auth",
    "system_traces",
    "system_distributed",
    "system_schema",
];

fn is_system_keyspace(keyspace: &str) -> bool {
    SYSTEM_KEYSPACES
        .iter()
        .any(|system| system.eq_ignore_ascii_case(keyspace))
}

/// Keyspaces to start and stop scheduling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleDiff {
    /// Live keyspaces without a schedule.
    pub to_add: BTreeSet<String>,
    /// Scheduled keyspaces that no longer exist.
    pub to_remove: BTreeSet<String>,
}

impl ScheduleDiff {
    /// Difference between the live and the scheduled keyspaces.
    pub fn compute(live: &BTreeSet<String>, scheduled: &BTreeSet<String>) -> Self {
        Self {
            to_add: live.difference(scheduled).cloned().collect(),
            to_remove: scheduled.difference(live).cloned().collect(),
        }
    }

    /// Whether nothing has to change.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Keeps the schedules of every registered cluster in line with its keyspaces.
pub struct ClusterRepairScheduler {
    ctx: Arc<RepairContext>,
}

impl ClusterRepairScheduler {
    /// Create a scheduler working on the given context.
    pub fn new(ctx: Arc<RepairContext>) -> Self {
        Self { ctx }
    }

    /// Poll every registered cluster, first after `initial_delay` then
    /// every `period_between_polls`. Never returns.
    pub async fn run(&self) {
        let config = &self.ctx.config.auto_scheduling;
        info!(
            initial_delay = ?config.initial_delay,
            period = ?config.period_between_polls,
            "auto-scheduler started"
        );
        tokio::time::sleep(config.initial_delay).await;
        let mut tick = tokio::time::interval(config.period_between_polls);

        loop {
            tick.tick().await;
            let clusters = match self.ctx.store.list_clusters() {
                Ok(clusters) => clusters,
                Err(e) => {
                    error!(error = %e, "failed to list clusters");
                    continue;
                }
            };
            for cluster in clusters {
                if let Err(e) = self.schedule_repairs(&cluster, Utc::now()).await {
                    error!(cluster = %cluster.name, error = %e, "auto-scheduling failed");
                }
            }
        }
    }

    /// Bring the schedules of `cluster` in line with its keyspaces.
    pub async fn schedule_repairs(
        &self,
        cluster: &Cluster,
        now: Timestamp,
    ) -> Result<ScheduleDiff, RepairError> {
        let hosts: Vec<String> = cluster.seed_hosts.iter().cloned().collect();
        let client = self.ctx.connector.connect_any(&hosts).await?;
        let keyspaces = client.keyspaces().await?;
        if keyspaces.is_empty() {
            return Err(RepairError::Validation(format!(
                "No keyspace found in cluster {}",
                cluster.name
            )));
        }

        let live: BTreeSet<String> = keyspaces.into_iter().collect();
        let scheduled = self.scheduled_keyspaces(&cluster.name)?;
        let mut diff = ScheduleDiff::compute(&live, &scheduled.keys().cloned().collect());

        // Only additions are filtered: a schedule on a system or empty
        // keyspace that still exists is left alone.
        let mut candidates = BTreeSet::new();
        for keyspace in std::mem::take(&mut diff.to_add) {
            if is_system_keyspace(&keyspace) {
                continue;
            }
            if client.tables(&keyspace).await?.is_empty() {
                debug!(%keyspace, "keyspace has no tables, not scheduled");
                continue;
            }
            candidates.insert(keyspace);
        }
        diff.to_add = candidates;

        if diff.is_empty() {
            debug!(cluster = %cluster.name, "schedules up to date");
            return Ok(diff);
        }

        for keyspace in &diff.to_remove {
            for id in &scheduled[keyspace] {
                self.ctx.store.delete_repair_schedule(*id)?;
            }
            info!(cluster = %cluster.name, %keyspace, "removed schedule of vanished keyspace");
        }
        for (index, keyspace) in diff.to_add.iter().enumerate() {
            let next_activation = now + self.first_activation_offset(index)?;
            self.add_schedule(cluster, keyspace, next_activation, now)?;
            info!(cluster = %cluster.name, %keyspace, %next_activation, "scheduled keyspace");
        }
        Ok(diff)
    }

    /// Scheduled keyspaces of a cluster with their schedules, whatever the owner.
    fn scheduled_keyspaces(
        &self,
        cluster_name: &str,
    ) -> Result<BTreeMap<String, Vec<ScheduleId>>, RepairError> {
        let mut scheduled: BTreeMap<String, Vec<ScheduleId>> = BTreeMap::new();
        for schedule in self
            .ctx
            .store
            .list_repair_schedules(&ScheduleFilter::cluster(cluster_name))?
        {
            if let Some(unit) = self.ctx.store.get_repair_unit(schedule.unit_id)? {
                scheduled.entry(unit.keyspace).or_default().push(schedule.id);
            }
        }
        Ok(scheduled)
    }

    fn first_activation_offset(&self, index: usize) -> Result<TimeDelta, RepairError> {
        let config = &self.ctx.config.auto_scheduling;
        let spread = config
            .schedule_spread_period
            .saturating_mul(u32::try_from(index).unwrap_or(u32::MAX));
        to_delta(config.time_before_first_schedule.saturating_add(spread))
    }

    fn add_schedule(
        &self,
        cluster: &Cluster,
        keyspace: &str,
        next_activation: Timestamp,
        now: Timestamp,
    ) -> Result<(), RepairError> {
        let config = &self.ctx.config;
        let unit = self.ctx.store.get_or_add_repair_unit(&RepairUnitScope {
            cluster_name: cluster.name.clone(),
            keyspace: keyspace.to_string(),
            tables: BTreeSet::new(),
            incremental: false,
        })?;
        self.ctx.store.add_repair_schedule(NewRepairSchedule {
            unit_id: unit.id,
            days_between: config.schedule_days_between,
            next_activation,
            segment_count: config.segment_count,
            parallelism: config.parallelism,
            intensity: config.intensity,
            creation_time: now,
            owner: AUTO_SCHEDULE_OWNER.to_string(),
            days_to_expire_after_done: None,
        })?;
        Ok(())
    }
}

fn to_delta(duration: Duration) -> Result<TimeDelta, RepairError> {
    TimeDelta::from_std(duration)
        .map_err(|_| RepairError::Validation(format!("duration {duration:?} out of range")))
}
