//! In-memory repair store.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use mender_types::{
    Cluster, NewRepairRun, NewRepairSchedule, RepairRun, RepairSchedule, RepairSegment,
    RepairUnit, RepairUnitScope, RingRange, RunId, ScheduleId, SegmentId, UnitId,
};
use tracing::debug;

use crate::MetaError;
use crate::traits::{RepairStore, RunFilter, ScheduleFilter, Transform};

/// Repair store kept entirely in process memory.
///
/// Everything lives behind a single `RwLock`, so each `modify_*` call is
/// trivially atomic. State is lost when the store is dropped.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    clusters: BTreeMap<String, Cluster>,
    units: BTreeMap<UnitId, RepairUnit>,
    runs: BTreeMap<RunId, RepairRun>,
    /// (run, segment) → segment, so a run's segments are one range scan.
    segments: BTreeMap<(RunId, SegmentId), RepairSegment>,
    segment_runs: HashMap<SegmentId, RunId>,
    schedules: BTreeMap<ScheduleId, RepairSchedule>,
    last_id: u64,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    fn run_segments(&self, run_id: RunId) -> impl Iterator<Item = &RepairSegment> {
        self.segments
            .range((run_id, SegmentId::new(0))..=(run_id, SegmentId::new(u64::MAX)))
            .map(|(_, seg)| seg)
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RepairStore for MemoryStore {
    fn put_cluster(&self, cluster: &Cluster) -> Result<(), MetaError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        inner.clusters.insert(cluster.name.clone(), cluster.clone());
        debug!(cluster = %cluster.name, "stored cluster");
        Ok(())
    }

    fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, MetaError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.clusters.get(name).cloned())
    }

    fn list_clusters(&self) -> Result<Vec<Cluster>, MetaError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.clusters.values().cloned().collect())
    }

    fn get_or_add_repair_unit(&self, scope: &RepairUnitScope) -> Result<RepairUnit, MetaError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        if let Some(unit) = inner.units.values().find(|u| u.matches(scope)) {
            return Ok(unit.clone());
        }
        let id = UnitId::new(inner.next_id());
        let unit = scope.clone().into_unit(id);
        inner.units.insert(id, unit.clone());
        debug!(unit_id = %id, keyspace = %unit.keyspace, "added repair unit");
        Ok(unit)
    }

    fn get_repair_unit(&self, id: UnitId) -> Result<Option<RepairUnit>, MetaError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.units.get(&id).cloned())
    }

    fn add_repair_run(
        &self,
        run: NewRepairRun,
        ranges: &[RingRange],
    ) -> Result<RepairRun, MetaError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        let run = run.into_run(RunId::new(inner.next_id()));
        for range in ranges {
            let seg_id = SegmentId::new(inner.next_id());
            let segment = RepairSegment::new(seg_id, run.id, run.unit_id, range.clone());
            inner.segments.insert((run.id, seg_id), segment);
            inner.segment_runs.insert(seg_id, run.id);
        }
        inner.runs.insert(run.id, run.clone());
        debug!(run_id = %run.id, segments = ranges.len(), "added repair run");
        Ok(run)
    }

    fn get_repair_run(&self, id: RunId) -> Result<Option<RepairRun>, MetaError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.runs.get(&id).cloned())
    }

    fn modify_repair_run(
        &self,
        id: RunId,
        transform: Transform<'_, RepairRun>,
    ) -> Result<RepairRun, MetaError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        let current = inner
            .runs
            .get(&id)
            .ok_or_else(|| MetaError::not_found("run", id))?;
        let next = transform(current)?;
        if next.id != id {
            return Err(MetaError::IdentityChanged { kind: "run", id: id.to_string() });
        }
        inner.runs.insert(id, next.clone());
        Ok(next)
    }

    fn list_repair_runs(&self, filter: &RunFilter) -> Result<Vec<RepairRun>, MetaError> {
        let inner = self.inner.read().expect("lock poisoned");
        let mut runs: Vec<RepairRun> = inner
            .runs
            .values()
            .filter(|run| filter.matches(run, inner.units.get(&run.unit_id)))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.cmp_recency(b));
        Ok(runs)
    }

    fn delete_repair_run(&self, id: RunId) -> Result<Option<RepairRun>, MetaError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        let Some(run) = inner.runs.remove(&id) else {
            return Ok(None);
        };
        let seg_ids: Vec<SegmentId> = inner.run_segments(id).map(|seg| seg.id).collect();
        for seg_id in &seg_ids {
            inner.segments.remove(&(id, *seg_id));
            inner.segment_runs.remove(seg_id);
        }
        debug!(run_id = %id, segments = seg_ids.len(), "deleted repair run");
        Ok(Some(run))
    }

    fn get_repair_segment(&self, id: SegmentId) -> Result<Option<RepairSegment>, MetaError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner
            .segment_runs
            .get(&id)
            .and_then(|run_id| inner.segments.get(&(*run_id, id)))
            .cloned())
    }

    fn list_repair_segments(&self, run_id: RunId) -> Result<Vec<RepairSegment>, MetaError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.run_segments(run_id).cloned().collect())
    }

    fn modify_repair_segment(
        &self,
        id: SegmentId,
        transform: Transform<'_, RepairSegment>,
    ) -> Result<RepairSegment, MetaError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        let run_id = *inner
            .segment_runs
            .get(&id)
            .ok_or_else(|| MetaError::not_found("segment", id))?;
        let current = inner
            .segments
            .get(&(run_id, id))
            .ok_or_else(|| MetaError::not_found("segment", id))?;
        let next = transform(current)?;
        if next.id != id || next.run_id != run_id {
            return Err(MetaError::IdentityChanged { kind: "segment", id: id.to_string() });
        }
        inner.segments.insert((run_id, id), next.clone());
        Ok(next)
    }

    fn add_repair_schedule(
        &self,
        schedule: NewRepairSchedule,
    ) -> Result<RepairSchedule, MetaError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        let schedule = schedule.into_schedule(ScheduleId::new(inner.next_id()));
        inner.schedules.insert(schedule.id, schedule.clone());
        debug!(schedule_id = %schedule.id, "added repair schedule");
        Ok(schedule)
    }

    fn get_repair_schedule(&self, id: ScheduleId) -> Result<Option<RepairSchedule>, MetaError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.schedules.get(&id).cloned())
    }

    fn modify_repair_schedule(
        &self,
        id: ScheduleId,
        transform: Transform<'_, RepairSchedule>,
    ) -> Result<RepairSchedule, MetaError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        let current = inner
            .schedules
            .get(&id)
            .ok_or_else(|| MetaError::not_found("schedule", id))?;
        let next = transform(current)?;
        if next.id != id {
            return Err(MetaError::IdentityChanged { kind: "schedule", id: id.to_string() });
        }
        inner.schedules.insert(id, next.clone());
        Ok(next)
    }

    fn list_repair_schedules(
        &self,
        filter: &ScheduleFilter,
    ) -> Result<Vec<RepairSchedule>, MetaError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner
            .schedules
            .values()
            .filter(|s| filter.matches(s, inner.units.get(&s.unit_id)))
            .cloned()
            .collect())
    }

    fn delete_repair_schedule(
        &self,
        id: ScheduleId,
    ) -> Result<Option<RepairSchedule>, MetaError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        let removed = inner.schedules.remove(&id);
        if removed.is_some() {
            debug!(schedule_id = %id, "deleted repair schedule");
        }
        Ok(removed)
    }
}
