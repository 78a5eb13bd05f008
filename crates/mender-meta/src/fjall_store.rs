//! [`FjallStore`] implementation wrapping Fjall keyspaces.

use std::path::Path;
use std::sync::Mutex;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use mender_types::{
    Cluster, NewRepairRun, NewRepairSchedule, RepairRun, RepairSchedule, RepairSegment,
    RepairUnit, RepairUnitScope, RingRange, RunId, ScheduleId, SegmentId, UnitId,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::MetaError;
use crate::traits::{RepairStore, RunFilter, ScheduleFilter, Transform};

type Result<T> = std::result::Result<T, MetaError>;

const SEQUENCE_KEY: &[u8] = b"last_id";

/// Repair store backed by Fjall.
///
/// Keyspaces:
///
/// - `clusters` — cluster name → [`Cluster`]
/// - `units` — [`UnitId`] → [`RepairUnit`]
/// - `runs` — [`RunId`] → [`RepairRun`]
/// - `segments` — [`RunId`] ++ [`SegmentId`] → [`RepairSegment`]
/// - `segment_runs` — [`SegmentId`] → owning [`RunId`]
/// - `schedules` — [`ScheduleId`] → [`RepairSchedule`]
/// - `sequences` — id allocator state
///
/// Ids are stored big-endian so key order matches numeric order. All writes
/// are serialized by `write_lock`, which makes read-modify-write transforms
/// atomic within the process.
pub struct FjallStore {
    db: Database,
    clusters: Keyspace,
    units: Keyspace,
    runs: Keyspace,
    segments: Keyspace,
    segment_runs: Keyspace,
    schedules: Keyspace,
    sequences: Keyspace,
    write_lock: Mutex<()>,
}

impl FjallStore {
    /// Open a persistent store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        Self::init_keyspaces(db)
    }

    /// Open a temporary store that is cleaned up on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir().map_err(std::io::Error::other)?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db)
    }

    fn init_keyspaces(db: Database) -> Result<Self> {
        let clusters = db.keyspace("clusters", KeyspaceCreateOptions::default)?;
        let units = db.keyspace("units", KeyspaceCreateOptions::default)?;
        let runs = db.keyspace("runs", KeyspaceCreateOptions::default)?;
        let segments = db.keyspace("segments", KeyspaceCreateOptions::default)?;
        let segment_runs = db.keyspace("segment_runs", KeyspaceCreateOptions::default)?;
        let schedules = db.keyspace("schedules", KeyspaceCreateOptions::default)?;
        let sequences = db.keyspace("sequences", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            clusters,
            units,
            runs,
            segments,
            segment_runs,
            schedules,
            sequences,
            write_lock: Mutex::new(()),
        })
    }

    /// Allocate the next id. Caller must hold `write_lock`.
    fn last_id(&self) -> Result<u64> {
        Ok(match self.sequences.get(SEQUENCE_KEY)? {
            Some(bytes) => decode_u64(&bytes),
            None => 0,
        })
    }

    fn next_id(&self) -> Result<u64> {
        let next = self.last_id()? + 1;
        self.sequences.insert(SEQUENCE_KEY, &next.to_be_bytes())?;
        Ok(next)
    }

    fn segment_run(&self, id: SegmentId) -> Result<Option<RunId>> {
        Ok(self
            .segment_runs
            .get(&id.to_be_bytes())?
            .map(|bytes| RunId::new(decode_u64(&bytes))))
    }
}

fn get_record<T: DeserializeOwned>(keyspace: &Keyspace, key: &[u8]) -> Result<Option<T>> {
    match keyspace.get(key)? {
        Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
        None => Ok(None),
    }
}

fn put_record<T: Serialize>(keyspace: &Keyspace, key: &[u8], record: &T) -> Result<()> {
    let value = postcard::to_allocvec(record)?;
    keyspace.insert(key, value.as_slice())?;
    Ok(())
}

fn scan_records<T: DeserializeOwned>(keyspace: &Keyspace) -> Result<Vec<T>> {
    let mut records = Vec::new();
    for guard in keyspace.iter() {
        let v = guard.value()?;
        records.push(postcard::from_bytes(&v)?);
    }
    Ok(records)
}

/// Build the segment key: `run_id (8 bytes BE) ++ segment_id (8 bytes BE)`.
fn segment_key(run_id: RunId, segment_id: SegmentId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&run_id.to_be_bytes());
    key[8..].copy_from_slice(&segment_id.to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    u64::from_be_bytes(buf)
}

impl RepairStore for FjallStore {
    fn put_cluster(&self, cluster: &Cluster) -> Result<()> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        put_record(&self.clusters, cluster.name.as_bytes(), cluster)?;
        debug!(cluster = %cluster.name, "stored cluster");
        Ok(())
    }

    fn get_cluster(&self, name: &str) -> Result<Option<Cluster>> {
        get_record(&self.clusters, name.as_bytes())
    }

    fn list_clusters(&self) -> Result<Vec<Cluster>> {
        scan_records(&self.clusters)
    }

    fn get_or_add_repair_unit(&self, scope: &RepairUnitScope) -> Result<RepairUnit> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let units: Vec<RepairUnit> = scan_records(&self.units)?;
        if let Some(unit) = units.into_iter().find(|u| u.matches(scope)) {
            return Ok(unit);
        }
        let id = UnitId::new(self.next_id()?);
        let unit = scope.clone().into_unit(id);
        put_record(&self.units, &id.to_be_bytes(), &unit)?;
        debug!(unit_id = %id, keyspace = %unit.keyspace, "added repair unit");
        Ok(unit)
    }

    fn get_repair_unit(&self, id: UnitId) -> Result<Option<RepairUnit>> {
        get_record(&self.units, &id.to_be_bytes())
    }

    fn add_repair_run(&self, run: NewRepairRun, ranges: &[RingRange]) -> Result<RepairRun> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let first = self.last_id()? + 1;
        let last = first + ranges.len() as u64;
        let run = run.into_run(RunId::new(first));

        // Run, segments and the id sequence commit together or not at all.
        let mut batch = self.db.batch();
        for (seg_id, range) in (first + 1..=last).map(SegmentId::new).zip(ranges) {
            let segment = RepairSegment::new(seg_id, run.id, run.unit_id, range.clone());
            batch.insert(
                &self.segments,
                &segment_key(run.id, seg_id)[..],
                postcard::to_allocvec(&segment)?,
            );
            batch.insert(
                &self.segment_runs,
                &seg_id.to_be_bytes()[..],
                &run.id.to_be_bytes()[..],
            );
        }
        batch.insert(&self.runs, &run.id.to_be_bytes()[..], postcard::to_allocvec(&run)?);
        batch.insert(&self.sequences, SEQUENCE_KEY, &last.to_be_bytes()[..]);
        batch.commit()?;

        debug!(run_id = %run.id, segments = ranges.len(), "added repair run");
        Ok(run)
    }

    fn get_repair_run(&self, id: RunId) -> Result<Option<RepairRun>> {
        get_record(&self.runs, &id.to_be_bytes())
    }

    fn modify_repair_run(&self, id: RunId, transform: Transform<'_, RepairRun>) -> Result<RepairRun> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let current: RepairRun = get_record(&self.runs, &id.to_be_bytes())?
            .ok_or_else(|| MetaError::not_found("run", id))?;
        let next = transform(&current)?;
        if next.id != id {
            return Err(MetaError::IdentityChanged { kind: "run", id: id.to_string() });
        }
        put_record(&self.runs, &id.to_be_bytes(), &next)?;
        Ok(next)
    }

    fn list_repair_runs(&self, filter: &RunFilter) -> Result<Vec<RepairRun>> {
        let mut runs = Vec::new();
        for run in scan_records::<RepairRun>(&self.runs)? {
            let unit = match filter.keyspace {
                Some(_) => self.get_repair_unit(run.unit_id)?,
                None => None,
            };
            if filter.matches(&run, unit.as_ref()) {
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| a.cmp_recency(b));
        Ok(runs)
    }

    fn delete_repair_run(&self, id: RunId) -> Result<Option<RepairRun>> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let Some(run) = get_record::<RepairRun>(&self.runs, &id.to_be_bytes())? else {
            return Ok(None);
        };
        self.runs.remove(&id.to_be_bytes())?;

        let mut keys = Vec::new();
        for guard in self.segments.prefix(&id.to_be_bytes()) {
            keys.push(guard.key()?);
        }
        for key in &keys {
            if key.len() == 16 {
                self.segment_runs.remove(&key[8..])?;
            }
            self.segments.remove(&key[..])?;
        }
        debug!(run_id = %id, segments = keys.len(), "deleted repair run");
        Ok(Some(run))
    }

    fn get_repair_segment(&self, id: SegmentId) -> Result<Option<RepairSegment>> {
        match self.segment_run(id)? {
            Some(run_id) => get_record(&self.segments, &segment_key(run_id, id)),
            None => Ok(None),
        }
    }

    fn list_repair_segments(&self, run_id: RunId) -> Result<Vec<RepairSegment>> {
        let mut segments = Vec::new();
        for guard in self.segments.prefix(&run_id.to_be_bytes()) {
            let v = guard.value()?;
            segments.push(postcard::from_bytes(&v)?);
        }
        Ok(segments)
    }

    fn modify_repair_segment(
        &self,
        id: SegmentId,
        transform: Transform<'_, RepairSegment>,
    ) -> Result<RepairSegment> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let run_id = self
            .segment_run(id)?
            .ok_or_else(|| MetaError::not_found("segment", id))?;
        let key = segment_key(run_id, id);
        let current: RepairSegment = get_record(&self.segments, &key)?
            .ok_or_else(|| MetaError::not_found("segment", id))?;
        let next = transform(&current)?;
        if next.id != id || next.run_id != run_id {
            return Err(MetaError::IdentityChanged { kind: "segment", id: id.to_string() });
        }
        put_record(&self.segments, &key, &next)?;
        Ok(next)
    }

    fn add_repair_schedule(&self, schedule: NewRepairSchedule) -> Result<RepairSchedule> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let schedule = schedule.into_schedule(ScheduleId::new(self.next_id()?));
        put_record(&self.schedules, &schedule.id.to_be_bytes(), &schedule)?;
        debug!(schedule_id = %schedule.id, "added repair schedule");
        Ok(schedule)
    }

    fn get_repair_schedule(&self, id: ScheduleId) -> Result<Option<RepairSchedule>> {
        get_record(&self.schedules, &id.to_be_bytes())
    }

    fn modify_repair_schedule(
        &self,
        id: ScheduleId,
        transform: Transform<'_, RepairSchedule>,
    ) -> Result<RepairSchedule> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let current: RepairSchedule = get_record(&self.schedules, &id.to_be_bytes())?
            .ok_or_else(|| MetaError::not_found("schedule", id))?;
        let next = transform(&current)?;
        if next.id != id {
            return Err(MetaError::IdentityChanged { kind: "schedule", id: id.to_string() });
        }
        put_record(&self.schedules, &id.to_be_bytes(), &next)?;
        Ok(next)
    }

    fn list_repair_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<RepairSchedule>> {
        let needs_unit = filter.cluster.is_some() || filter.keyspace.is_some();
        let mut schedules = Vec::new();
        for schedule in scan_records::<RepairSchedule>(&self.schedules)? {
            let unit = if needs_unit {
                self.get_repair_unit(schedule.unit_id)?
            } else {
                None
            };
            if filter.matches(&schedule, unit.as_ref()) {
                schedules.push(schedule);
            }
        }
        Ok(schedules)
    }

    fn delete_repair_schedule(&self, id: ScheduleId) -> Result<Option<RepairSchedule>> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let removed: Option<RepairSchedule> = get_record(&self.schedules, &id.to_be_bytes())?;
        if removed.is_some() {
            self.schedules.remove(&id.to_be_bytes())?;
            debug!(schedule_id = %id, "deleted repair schedule");
        }
        Ok(removed)
    }
}
