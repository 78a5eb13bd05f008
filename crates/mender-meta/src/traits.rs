//! The store trait and its query filters.

use mender_types::{
    Cluster, NewRepairRun, NewRepairSchedule, RepairRun, RepairSchedule, RepairSegment,
    RepairUnit, RepairUnitScope, RingRange, RunId, RunState, ScheduleId, ScheduleState,
    SegmentId, SegmentState, UnitId,
};

use crate::MetaError;

/// A whole-record update: receives the current value, returns the next one.
pub type Transform<'a, T> = &'a dyn Fn(&T) -> Result<T, MetaError>;

/// Filter for [`RepairStore::list_repair_runs`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    /// Only runs of this cluster.
    pub cluster: Option<String>,
    /// Only runs whose unit targets this keyspace.
    pub keyspace: Option<String>,
    /// Only runs in this state.
    pub state: Option<RunState>,
}

impl RunFilter {
    /// Runs of one cluster.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            cluster: Some(name.into()),
            ..Self::default()
        }
    }

    /// Runs in one state.
    pub fn state(state: RunState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Whether `run` (with its `unit`) passes the filter.
    pub fn matches(&self, run: &RepairRun, unit: Option<&RepairUnit>) -> bool {
        self.cluster.as_ref().is_none_or(|c| *c == run.cluster_name)
            && self.state.is_none_or(|s| s == run.state)
            && self
                .keyspace
                .as_ref()
                .is_none_or(|k| unit.is_some_and(|u| u.keyspace == *k))
    }
}

/// Filter for [`RepairStore::list_repair_schedules`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleFilter {
    /// Only schedules of this cluster.
    pub cluster: Option<String>,
    /// Only schedules whose unit targets this keyspace.
    pub keyspace: Option<String>,
    /// Only schedules in this state.
    pub state: Option<ScheduleState>,
}

impl ScheduleFilter {
    /// Schedules of one cluster.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            cluster: Some(name.into()),
            ..Self::default()
        }
    }

    /// Schedules in one state.
    pub fn state(state: ScheduleState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Whether `schedule` (with its `unit`) passes the filter.
    pub fn matches(&self, schedule: &RepairSchedule, unit: Option<&RepairUnit>) -> bool {
        self.state.is_none_or(|s| s == schedule.state)
            && self
                .cluster
                .as_ref()
                .is_none_or(|c| unit.is_some_and(|u| u.cluster_name == *c))
            && self
                .keyspace
                .as_ref()
                .is_none_or(|k| unit.is_some_and(|u| u.keyspace == *k))
    }
}

/// Persistence for everything the repair engine tracks.
///
/// Implementations must be `Send + Sync`: runners, schedulers and the
/// service share one store. `modify_*` calls are atomic with respect to each
/// other; the transform sees the latest committed value and its result is
/// stored only if it returns `Ok`.
pub trait RepairStore: Send + Sync {
    // ----- Clusters -----

    /// Insert a cluster or replace the one with the same name.
    fn put_cluster(&self, cluster: &Cluster) -> Result<(), MetaError>;

    /// Look up a cluster by name.
    fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, MetaError>;

    /// All registered clusters, ordered by name.
    fn list_clusters(&self) -> Result<Vec<Cluster>, MetaError>;

    // ----- Repair units -----

    /// Return the unit covering `scope`, creating it if needed.
    fn get_or_add_repair_unit(&self, scope: &RepairUnitScope) -> Result<RepairUnit, MetaError>;

    /// Look up a unit by id.
    fn get_repair_unit(&self, id: UnitId) -> Result<Option<RepairUnit>, MetaError>;

    // ----- Repair runs -----

    /// Create a run in `NOT_STARTED` together with one segment per range.
    fn add_repair_run(
        &self,
        run: NewRepairRun,
        ranges: &[RingRange],
    ) -> Result<RepairRun, MetaError>;

    /// Look up a run by id.
    fn get_repair_run(&self, id: RunId) -> Result<Option<RepairRun>, MetaError>;

    /// Atomically replace a run with `transform(run)`.
    fn modify_repair_run(
        &self,
        id: RunId,
        transform: Transform<'_, RepairRun>,
    ) -> Result<RepairRun, MetaError>;

    /// Runs matching `filter`, most recent first (see [`RepairRun::cmp_recency`]).
    fn list_repair_runs(&self, filter: &RunFilter) -> Result<Vec<RepairRun>, MetaError>;

    /// Remove a run and all of its segments. Returns the removed run.
    fn delete_repair_run(&self, id: RunId) -> Result<Option<RepairRun>, MetaError>;

    /// Record `event` as the run's last event unless the run is terminated.
    fn update_last_event(&self, id: RunId, event: &str) -> Result<RepairRun, MetaError> {
        self.modify_repair_run(id, &|run| {
            if run.state.is_terminated() {
                Ok(run.clone())
            } else {
                Ok(run.with_last_event(event))
            }
        })
    }

    // ----- Repair segments -----

    /// Look up a segment by id.
    fn get_repair_segment(&self, id: SegmentId) -> Result<Option<RepairSegment>, MetaError>;

    /// All segments of a run, ordered by id.
    fn list_repair_segments(&self, run_id: RunId) -> Result<Vec<RepairSegment>, MetaError>;

    /// Atomically replace a segment with `transform(segment)`.
    fn modify_repair_segment(
        &self,
        id: SegmentId,
        transform: Transform<'_, RepairSegment>,
    ) -> Result<RepairSegment, MetaError>;

    /// The lowest-id `NOT_STARTED` segment of a run.
    fn next_free_segment(&self, run_id: RunId) -> Result<Option<RepairSegment>, MetaError> {
        Ok(self
            .list_repair_segments(run_id)?
            .into_iter()
            .find(|seg| seg.state == SegmentState::NotStarted))
    }

    /// The lowest-id `NOT_STARTED` segment of a run lying inside `range`.
    fn next_free_segment_in_range(
        &self,
        run_id: RunId,
        range: &RingRange,
    ) -> Result<Option<RepairSegment>, MetaError> {
        Ok(self
            .list_repair_segments(run_id)?
            .into_iter()
            .find(|seg| seg.state == SegmentState::NotStarted && range.encloses(&seg.range)))
    }

    /// Number of segments of a run.
    fn segment_count(&self, run_id: RunId) -> Result<usize, MetaError> {
        Ok(self.list_repair_segments(run_id)?.len())
    }

    /// Number of segments of a run in `state`.
    fn segment_count_in_state(
        &self,
        run_id: RunId,
        state: SegmentState,
    ) -> Result<usize, MetaError> {
        Ok(self
            .list_repair_segments(run_id)?
            .iter()
            .filter(|seg| seg.state == state)
            .count())
    }

    // ----- Repair schedules -----

    /// Create a schedule in `ACTIVE`.
    fn add_repair_schedule(&self, schedule: NewRepairSchedule)
    -> Result<RepairSchedule, MetaError>;

    /// Look up a schedule by id.
    fn get_repair_schedule(&self, id: ScheduleId) -> Result<Option<RepairSchedule>, MetaError>;

    /// Atomically replace a schedule with `transform(schedule)`.
    fn modify_repair_schedule(
        &self,
        id: ScheduleId,
        transform: Transform<'_, RepairSchedule>,
    ) -> Result<RepairSchedule, MetaError>;

    /// Schedules matching `filter`, ordered by id.
    fn list_repair_schedules(
        &self,
        filter: &ScheduleFilter,
    ) -> Result<Vec<RepairSchedule>, MetaError>;

    /// Remove a schedule. Returns the removed schedule.
    fn delete_repair_schedule(&self, id: ScheduleId)
    -> Result<Option<RepairSchedule>, MetaError>;
}
