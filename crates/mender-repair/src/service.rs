//! Operator-facing repair operations.
//!
//! [`RepairService`] validates requests before touching any state and then
//! delegates to the manager and the schedulers.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use mender_meta::{RunFilter, ScheduleFilter};
use mender_ring::SegmentGenerator;
use mender_types::{
    Cluster, NewRepairSchedule, RepairParallelism, RepairRun, RepairSchedule, RepairUnit,
    RepairUnitScope, RunId, RunState, ScheduleId, ScheduleState, SegmentState, Timestamp,
};
use tracing::{info, warn};

use crate::RepairError;
use crate::auto_scheduler::ClusterRepairScheduler;
use crate::cleaner::RunCleaner;
use crate::context::RepairContext;
use crate::manager::RepairManager;
use crate::scheduling::SchedulingManager;
use crate::setup::{RunParams, create_repair_run};

/// Cause of runs created without one.
const MANUAL_CAUSE: &str = "manual spawn";

/// A request to create a repair run.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRunRequest {
    pub cluster_name: String,
    pub keyspace: String,
    /// Tables to repair; empty means the whole keyspace.
    pub tables: BTreeSet<String>,
    pub incremental: bool,
    pub owner: String,
    pub cause: Option<String>,
    pub segment_count: Option<u32>,
    pub parallelism: Option<RepairParallelism>,
    pub intensity: Option<f64>,
}

impl NewRunRequest {
    /// A request with every optional field left to the configured defaults.
    pub fn new(cluster_name: &str, keyspace: &str, owner: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            keyspace: keyspace.to_string(),
            tables: BTreeSet::new(),
            incremental: false,
            owner: owner.to_string(),
            cause: None,
            segment_count: None,
            parallelism: None,
            intensity: None,
        }
    }
}

/// A request to create a repair schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct NewScheduleRequest {
    pub cluster_name: String,
    pub keyspace: String,
    /// Tables to repair; empty means the whole keyspace.
    pub tables: BTreeSet<String>,
    pub incremental: bool,
    pub owner: String,
    pub days_between: Option<u32>,
    /// First activation; now when absent.
    pub next_activation: Option<Timestamp>,
    pub segment_count: Option<u32>,
    pub parallelism: Option<RepairParallelism>,
    pub intensity: Option<f64>,
    pub days_to_expire_after_done: Option<u32>,
}

impl NewScheduleRequest {
    /// A request with every optional field left to the configured defaults.
    pub fn new(cluster_name: &str, keyspace: &str, owner: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            keyspace: keyspace.to_string(),
            tables: BTreeSet::new(),
            incremental: false,
            owner: owner.to_string(),
            days_between: None,
            next_activation: None,
            segment_count: None,
            parallelism: None,
            intensity: None,
            days_to_expire_after_done: None,
        }
    }
}

/// A run with its progress.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatus {
    pub run: RepairRun,
    pub unit: RepairUnit,
    pub segments_done: usize,
    pub segments_total: usize,
}

/// Entry point for every operator request.
pub struct RepairService {
    ctx: Arc<RepairContext>,
    manager: Arc<RepairManager>,
    scheduling: Arc<SchedulingManager>,
    auto_scheduler: Arc<ClusterRepairScheduler>,
    cleaner: Arc<RunCleaner>,
}

impl RepairService {
    /// Build the service and the components it drives.
    pub fn new(ctx: Arc<RepairContext>) -> Self {
        let manager = RepairManager::new(Arc::clone(&ctx));
        Self {
            scheduling: Arc::new(SchedulingManager::new(Arc::clone(&manager))),
            auto_scheduler: Arc::new(ClusterRepairScheduler::new(Arc::clone(&ctx))),
            cleaner: Arc::new(RunCleaner::new(Arc::clone(&ctx))),
            manager,
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<RepairContext> {
        &self.ctx
    }

    pub fn manager(&self) -> &Arc<RepairManager> {
        &self.manager
    }

    pub fn scheduling(&self) -> &Arc<SchedulingManager> {
        &self.scheduling
    }

    pub fn auto_scheduler(&self) -> &Arc<ClusterRepairScheduler> {
        &self.auto_scheduler
    }

    pub fn cleaner(&self) -> &Arc<RunCleaner> {
        &self.cleaner
    }

    // -----------------------------------------------------------------------
    // Clusters
    // -----------------------------------------------------------------------

    /// Register the cluster reachable through `seed_hosts`.
    ///
    /// Registering a known cluster again replaces its seed hosts. With
    /// auto-scheduling enabled, its keyspaces are scheduled right away.
    pub async fn register_cluster(
        &self,
        seed_hosts: BTreeSet<String>,
    ) -> Result<Cluster, RepairError> {
        if seed_hosts.is_empty() {
            return Err(RepairError::Validation("at least one seed host is required".into()));
        }
        let hosts: Vec<String> = seed_hosts.iter().cloned().collect();
        let client = self.ctx.connector.connect_any(&hosts).await?;
        let name = client.cluster_name().await?;
        let partitioner = client.partitioner().await?;
        SegmentGenerator::from_partitioner(&partitioner)?;

        let cluster = match self.ctx.store.get_cluster(&name)? {
            Some(existing) => {
                info!(cluster = %name, "updating seed hosts of known cluster");
                existing.with_seed_hosts(seed_hosts)
            }
            None => Cluster {
                name,
                partitioner,
                seed_hosts,
            },
        };
        self.ctx.store.put_cluster(&cluster)?;
        info!(cluster = %cluster.name, seeds = cluster.seed_hosts.len(), "cluster registered");

        if self.ctx.config.auto_scheduling.enabled {
            if let Err(e) = self
                .auto_scheduler
                .schedule_repairs(&cluster, Utc::now())
                .await
            {
                warn!(cluster = %cluster.name, error = %e, "auto-scheduling of new cluster failed");
            }
        }
        Ok(cluster)
    }

    pub fn get_cluster(&self, name: &str) -> Result<Cluster, RepairError> {
        self.ctx
            .store
            .get_cluster(name)?
            .ok_or_else(|| RepairError::not_found("cluster", name))
    }

    pub fn list_clusters(&self) -> Result<Vec<Cluster>, RepairError> {
        Ok(self.ctx.store.list_clusters()?)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a `NOT_STARTED` run. It is not started.
    pub async fn create_run(&self, request: NewRunRequest) -> Result<RepairRun, RepairError> {
        let config = &self.ctx.config;
        require_owner(&request.owner)?;
        let params = RunParams {
            segment_count: request.segment_count.unwrap_or(config.segment_count),
            parallelism: effective_parallelism(
                request.incremental,
                request.parallelism.unwrap_or(config.parallelism),
            ),
            intensity: request.intensity.unwrap_or(config.intensity),
        };
        params.validate()?;

        let cluster = self.get_cluster(&request.cluster_name)?;
        let unit = self
            .resolve_unit(&cluster, &request.keyspace, request.tables, request.incremental)
            .await?;
        let cause = request.cause.as_deref().unwrap_or(MANUAL_CAUSE);
        create_repair_run(&self.ctx, &cluster, &unit, params, cause, &request.owner).await
    }

    /// Start a new run, or resume a paused one.
    pub async fn start_run(&self, id: RunId) -> Result<RepairRun, RepairError> {
        self.manager.start_repair_run(id).await
    }

    pub fn pause_run(&self, id: RunId) -> Result<RepairRun, RepairError> {
        self.manager.pause_run(id)
    }

    pub async fn resume_run(&self, id: RunId) -> Result<RepairRun, RepairError> {
        self.manager.resume_run(id).await
    }

    /// Delete a run and its segments. Running runs must be paused first.
    pub fn delete_run(&self, id: RunId, owner: &str) -> Result<RepairRun, RepairError> {
        let run = self
            .ctx
            .store
            .get_repair_run(id)?
            .ok_or_else(|| RepairError::not_found("run", id))?;
        if run.owner != owner {
            return Err(RepairError::NotOwner {
                kind: "run",
                id: id.to_string(),
                owner: run.owner,
            });
        }
        if run.state == RunState::Running {
            return Err(RepairError::RunState {
                state: run.state,
                operation: "delete",
            });
        }

        self.manager.remove_runner(id);
        let run = self
            .ctx
            .store
            .delete_repair_run(id)?
            .ok_or_else(|| RepairError::not_found("run", id))?;
        info!(run_id = %id, "repair run deleted");
        Ok(run)
    }

    /// A run with its segment progress.
    pub fn run_status(&self, id: RunId) -> Result<RunStatus, RepairError> {
        let store = &self.ctx.store;
        let run = store
            .get_repair_run(id)?
            .ok_or_else(|| RepairError::not_found("run", id))?;
        let unit = store
            .get_repair_unit(run.unit_id)?
            .ok_or_else(|| RepairError::not_found("repair unit", run.unit_id))?;
        Ok(RunStatus {
            segments_done: store.segment_count_in_state(id, SegmentState::Done)?,
            segments_total: store.segment_count(id)?,
            run,
            unit,
        })
    }

    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RepairRun>, RepairError> {
        Ok(self.ctx.store.list_repair_runs(filter)?)
    }

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    /// Create an `ACTIVE` schedule. A unit gets at most one schedule.
    pub async fn create_schedule(
        &self,
        request: NewScheduleRequest,
    ) -> Result<RepairSchedule, RepairError> {
        let config = &self.ctx.config;
        require_owner(&request.owner)?;
        let days_between = request.days_between.unwrap_or(config.schedule_days_between);
        if days_between == 0 {
            return Err(RepairError::Validation("days between runs must be positive".into()));
        }
        let params = RunParams {
            segment_count: request.segment_count.unwrap_or(config.segment_count),
            parallelism: effective_parallelism(
                request.incremental,
                request.parallelism.unwrap_or(config.parallelism),
            ),
            intensity: request.intensity.unwrap_or(config.intensity),
        };
        params.validate()?;

        let cluster = self.get_cluster(&request.cluster_name)?;
        let unit = self
            .resolve_unit(&cluster, &request.keyspace, request.tables, request.incremental)
            .await?;
        let existing = self
            .ctx
            .store
            .list_repair_schedules(&ScheduleFilter::cluster(&cluster.name))?
            .into_iter()
            .find(|s| s.unit_id == unit.id);
        if let Some(existing) = existing {
            return Err(RepairError::Validation(format!(
                "schedule {} already repairs keyspace {}",
                existing.id, unit.keyspace
            )));
        }

        let now = Utc::now();
        let schedule = self.ctx.store.add_repair_schedule(NewRepairSchedule {
            unit_id: unit.id,
            days_between,
            next_activation: request.next_activation.unwrap_or(now),
            segment_count: params.segment_count,
            parallelism: params.parallelism,
            intensity: params.intensity,
            creation_time: now,
            owner: request.owner,
            days_to_expire_after_done: request.days_to_expire_after_done,
        })?;
        info!(
            schedule_id = %schedule.id,
            cluster = %cluster.name,
            keyspace = %unit.keyspace,
            next_activation = %schedule.next_activation,
            "repair schedule created"
        );
        Ok(schedule)
    }

    pub fn pause_schedule(&self, id: ScheduleId) -> Result<RepairSchedule, RepairError> {
        self.scheduling.pause_schedule(id)
    }

    pub fn resume_schedule(&self, id: ScheduleId) -> Result<RepairSchedule, RepairError> {
        self.scheduling.resume_schedule(id)
    }

    /// Delete a schedule that is not `ACTIVE`. Runs it spawned are kept.
    pub fn delete_schedule(
        &self,
        id: ScheduleId,
        owner: &str,
    ) -> Result<RepairSchedule, RepairError> {
        let schedule = self
            .ctx
            .store
            .get_repair_schedule(id)?
            .ok_or_else(|| RepairError::not_found("schedule", id))?;
        if schedule.owner != owner {
            return Err(RepairError::NotOwner {
                kind: "schedule",
                id: id.to_string(),
                owner: schedule.owner,
            });
        }
        if schedule.state == ScheduleState::Active {
            return Err(RepairError::ScheduleState {
                state: schedule.state,
                operation: "delete",
            });
        }
        let schedule = self
            .ctx
            .store
            .delete_repair_schedule(id)?
            .ok_or_else(|| RepairError::not_found("schedule", id))?;
        info!(schedule_id = %id, "repair schedule deleted");
        Ok(schedule)
    }

    pub fn get_schedule(&self, id: ScheduleId) -> Result<RepairSchedule, RepairError> {
        self.ctx
            .store
            .get_repair_schedule(id)?
            .ok_or_else(|| RepairError::not_found("schedule", id))
    }

    pub fn list_schedules(
        &self,
        filter: &ScheduleFilter,
    ) -> Result<Vec<RepairSchedule>, RepairError> {
        Ok(self.ctx.store.list_repair_schedules(filter)?)
    }

    /// Check the keyspace and tables against the cluster, then find or
    /// create the matching unit.
    async fn resolve_unit(
        &self,
        cluster: &Cluster,
        keyspace: &str,
        tables: BTreeSet<String>,
        incremental: bool,
    ) -> Result<RepairUnit, RepairError> {
        let hosts: Vec<String> = cluster.seed_hosts.iter().cloned().collect();
        let client = self.ctx.connector.connect_any(&hosts).await?;
        if !client.keyspaces().await?.iter().any(|ks| ks == keyspace) {
            return Err(RepairError::Validation(format!(
                "keyspace {keyspace} does not exist in cluster {}",
                cluster.name
            )));
        }
        let known = client.tables(keyspace).await?;
        if let Some(unknown) = tables.iter().find(|t| !known.contains(*t)) {
            return Err(RepairError::Validation(format!(
                "table {unknown} does not exist in keyspace {keyspace}"
            )));
        }

        Ok(self.ctx.store.get_or_add_repair_unit(&RepairUnitScope {
            cluster_name: cluster.name.clone(),
            keyspace: keyspace.to_string(),
            tables,
            incremental,
        })?)
    }
}

fn require_owner(owner: &str) -> Result<(), RepairError> {
    if owner.trim().is_empty() {
        return Err(RepairError::Validation("owner must not be empty".into()));
    }
    Ok(())
}

/// Incremental repairs only support parallel validation.
fn effective_parallelism(incremental: bool, requested: RepairParallelism) -> RepairParallelism {
    if incremental && requested != RepairParallelism::Parallel {
        warn!(%requested, "incremental repair forces parallel validation");
        RepairParallelism::Parallel
    } else {
        requested
    }
}
