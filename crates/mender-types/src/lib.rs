//! Shared types and identifiers for Mender.
//!
//! This crate defines the data model used across the Mender workspace:
//! identifiers ([`RunId`], [`SegmentId`], [`UnitId`], [`ScheduleId`]),
//! token intervals ([`RingRange`]), the persisted records ([`Cluster`],
//! [`RepairUnit`], [`RepairRun`], [`RepairSegment`], [`RepairSchedule`]) and
//! engine configuration ([`RepairConfig`]).
//!
//! Records are immutable values. State changes are expressed as pure
//! transforms that return the next value (e.g. [`RepairRun::transition`]),
//! which the store then persists atomically.

pub mod config;
pub mod range;

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub use config::{AutoSchedulingConfig, RepairConfig};
pub use range::{RingRange, Token};

/// Wall-clock timestamp used by all records.
pub type Timestamp = DateTime<Utc>;

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw sequence number.
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Return the raw sequence number.
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Big-endian bytes, so that key order matches numeric order.
            pub fn to_be_bytes(self) -> [u8; 8] {
                self.0.to_be_bytes()
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

define_id!(
    /// Identifier of a [`RepairRun`].
    RunId
);

define_id!(
    /// Identifier of a [`RepairSegment`].
    SegmentId
);

define_id!(
    /// Identifier of a [`RepairUnit`].
    UnitId
);

define_id!(
    /// Identifier of a [`RepairSchedule`].
    ScheduleId
);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A requested state change that the record's state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {entity} transition: {from} -> {to}")]
pub struct InvalidTransition {
    /// Kind of record (`"run"`, `"schedule"`, `"segment"`).
    pub entity: &'static str,
    /// State the record was in.
    pub from: String,
    /// State that was requested.
    pub to: String,
}

impl InvalidTransition {
    fn new(entity: &'static str, from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster and repair unit
// ---------------------------------------------------------------------------

/// A registered database cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster name as reported by the nodes.
    pub name: String,
    /// Fully qualified partitioner class name.
    pub partitioner: String,
    /// Hosts used to reach the cluster.
    pub seed_hosts: BTreeSet<String>,
}

impl Cluster {
    /// Return a copy of this cluster with its seed hosts replaced.
    pub fn with_seed_hosts(&self, seed_hosts: BTreeSet<String>) -> Self {
        Self {
            seed_hosts,
            ..self.clone()
        }
    }
}

/// The scope of a repair: one keyspace (optionally some tables) of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairUnit {
    /// Unique identifier.
    pub id: UnitId,
    /// Owning cluster.
    pub cluster_name: String,
    /// Keyspace to repair.
    pub keyspace: String,
    /// Tables to repair; empty means every table of the keyspace.
    pub tables: BTreeSet<String>,
    /// Whether the repair is incremental.
    pub incremental: bool,
}

/// Everything that identifies a [`RepairUnit`] except its id.
///
/// Two requests with equal scopes resolve to the same stored unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepairUnitScope {
    /// Owning cluster.
    pub cluster_name: String,
    /// Keyspace to repair.
    pub keyspace: String,
    /// Tables to repair.
    pub tables: BTreeSet<String>,
    /// Whether the repair is incremental.
    pub incremental: bool,
}

impl RepairUnitScope {
    /// Materialize the scope under the given id.
    pub fn into_unit(self, id: UnitId) -> RepairUnit {
        RepairUnit {
            id,
            cluster_name: self.cluster_name,
            keyspace: self.keyspace,
            tables: self.tables,
            incremental: self.incremental,
        }
    }
}

impl RepairUnit {
    /// Whether this unit covers exactly the given scope.
    pub fn matches(&self, scope: &RepairUnitScope) -> bool {
        self.cluster_name == scope.cluster_name
            && self.keyspace == scope.keyspace
            && self.tables == scope.tables
            && self.incremental == scope.incremental
    }
}

/// How replicas validate during a repair session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairParallelism {
    /// One replica at a time.
    Sequential,
    /// All replicas at once.
    Parallel,
    /// One replica per datacenter at a time.
    DatacenterAware,
}

impl fmt::Display for RepairParallelism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sequential => "SEQUENTIAL",
            Self::Parallel => "PARALLEL",
            Self::DatacenterAware => "DATACENTER_AWARE",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Repair runs
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`RepairRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Created but never dispatched.
    NotStarted,
    /// Segments are being dispatched.
    Running,
    /// Aborted by a fatal condition.
    Error,
    /// Every segment has been repaired.
    Done,
    /// Temporarily halted by an operator.
    Paused,
    /// Stopped by an operator.
    Aborted,
    /// Marked for removal.
    Deleted,
}

impl RunState {
    /// Running or paused: a controller may still act on the run.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Terminal states never change again.
    pub fn is_terminated(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Aborted | Self::Deleted)
    }

    /// Whether the run state machine permits `self -> to`.
    pub fn can_transition_to(self, to: RunState) -> bool {
        matches!(
            (self, to),
            (Self::NotStarted, Self::Running)
                | (Self::Running, Self::Paused)
                | (Self::Paused, Self::Running)
                | (Self::Running, Self::Done)
                | (Self::Running, Self::Error)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Error => "ERROR",
            Self::Done => "DONE",
            Self::Paused => "PAUSED",
            Self::Aborted => "ABORTED",
            Self::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// Last-event message of a freshly created run.
pub const NO_EVENTS: &str = "no events";

/// One execution of a repair over a [`RepairUnit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairRun {
    /// Unique identifier.
    pub id: RunId,
    /// Scope being repaired.
    pub unit_id: UnitId,
    /// Owning cluster.
    pub cluster_name: String,
    /// Free-form reason the run was created.
    pub cause: String,
    /// Who created the run.
    pub owner: String,
    /// Current lifecycle state.
    pub state: RunState,
    /// When the run was created.
    pub creation_time: Timestamp,
    /// When the run first started dispatching.
    pub start_time: Option<Timestamp>,
    /// When the run reached a terminal state.
    pub end_time: Option<Timestamp>,
    /// When the run was last paused.
    pub pause_time: Option<Timestamp>,
    /// Fraction of time coordinators spend repairing, in `(0, 1]`.
    pub intensity: f64,
    /// Number of segments the ring was split into.
    pub segment_count: u32,
    /// Validation parallelism requested from coordinators.
    pub parallelism: RepairParallelism,
    /// Most recent human-readable event.
    pub last_event: String,
}

/// Fields needed to create a [`RepairRun`]; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRepairRun {
    /// Scope being repaired.
    pub unit_id: UnitId,
    /// Owning cluster.
    pub cluster_name: String,
    /// Free-form reason the run was created.
    pub cause: String,
    /// Who created the run.
    pub owner: String,
    /// When the run was created.
    pub creation_time: Timestamp,
    /// Target repair intensity.
    pub intensity: f64,
    /// Number of segments.
    pub segment_count: u32,
    /// Validation parallelism.
    pub parallelism: RepairParallelism,
}

impl NewRepairRun {
    /// Materialize the run under the given id, in `NOT_STARTED`.
    pub fn into_run(self, id: RunId) -> RepairRun {
        RepairRun {
            id,
            unit_id: self.unit_id,
            cluster_name: self.cluster_name,
            cause: self.cause,
            owner: self.owner,
            state: RunState::NotStarted,
            creation_time: self.creation_time,
            start_time: None,
            end_time: None,
            pause_time: None,
            intensity: self.intensity,
            segment_count: self.segment_count,
            parallelism: self.parallelism,
            last_event: NO_EVENTS.to_string(),
        }
    }
}

impl RepairRun {
    /// Produce the run as it is after moving to `to` at `now`.
    ///
    /// Keeps the timestamps consistent with the state: `start_time` is set
    /// on the first start, `pause_time` follows pausing and `end_time` is
    /// set exactly when the new state is terminal.
    pub fn transition(&self, to: RunState, now: Timestamp) -> Result<Self, InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition::new("run", self.state, to));
        }

        let mut next = self.clone();
        next.state = to;
        match (self.state, to) {
            (RunState::NotStarted, RunState::Running) => {
                next.start_time = Some(now);
            }
            (RunState::Running, RunState::Paused) => {
                next.pause_time = Some(now);
            }
            (RunState::Paused, RunState::Running) => {
                next.pause_time = None;
            }
            _ => {}
        }
        if to.is_terminated() {
            next.end_time = Some(now);
        }
        Ok(next)
    }

    /// Same as [`transition`](Self::transition), recording `event` as the last event.
    pub fn transition_with_event(
        &self,
        to: RunState,
        now: Timestamp,
        event: impl Into<String>,
    ) -> Result<Self, InvalidTransition> {
        let mut next = self.transition(to, now)?;
        next.last_event = event.into();
        Ok(next)
    }

    /// Return the run with a new last-event message.
    pub fn with_last_event(&self, event: impl Into<String>) -> Self {
        Self {
            last_event: event.into(),
            ..self.clone()
        }
    }

    /// Default listing order: latest end time first, then latest start time.
    ///
    /// A missing timestamp counts as "now", so unfinished runs come first.
    pub fn cmp_recency(&self, other: &RepairRun) -> Ordering {
        recency_key(other.end_time)
            .cmp(&recency_key(self.end_time))
            .then_with(|| recency_key(other.start_time).cmp(&recency_key(self.start_time)))
    }
}

fn recency_key(time: Option<Timestamp>) -> (bool, Option<Timestamp>) {
    (time.is_none(), time)
}

// ---------------------------------------------------------------------------
// Repair segments
// ---------------------------------------------------------------------------

/// Progress of a single [`RepairSegment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentState {
    /// Waiting for (another) attempt.
    NotStarted,
    /// A coordinator acknowledged the repair.
    Running,
    /// Repaired successfully.
    Done,
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// One token range of work inside a [`RepairRun`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairSegment {
    /// Unique identifier.
    pub id: SegmentId,
    /// Owning run.
    pub run_id: RunId,
    /// Scope being repaired.
    pub unit_id: UnitId,
    /// Tokens covered by this segment.
    pub range: RingRange,
    /// Current progress.
    pub state: SegmentState,
    /// When the current attempt was acknowledged.
    pub start_time: Option<Timestamp>,
    /// When the segment completed.
    pub end_time: Option<Timestamp>,
    /// Host coordinating the current attempt.
    pub coordinator_host: Option<String>,
    /// Command id returned by the coordinator.
    pub repair_command_id: Option<u32>,
    /// Number of attempts that did not complete.
    pub fail_count: u32,
}

impl RepairSegment {
    /// Build a fresh, not-yet-attempted segment.
    pub fn new(id: SegmentId, run_id: RunId, unit_id: UnitId, range: RingRange) -> Self {
        Self {
            id,
            run_id,
            unit_id,
            range,
            state: SegmentState::NotStarted,
            start_time: None,
            end_time: None,
            coordinator_host: None,
            repair_command_id: None,
            fail_count: 0,
        }
    }

    /// The segment as acknowledged by `coordinator` for `command_id`.
    pub fn started(&self, coordinator: &str, command_id: u32, now: Timestamp) -> Self {
        Self {
            state: SegmentState::Running,
            start_time: Some(now),
            end_time: None,
            coordinator_host: Some(coordinator.to_string()),
            repair_command_id: Some(command_id),
            ..self.clone()
        }
    }

    /// The segment as successfully repaired.
    pub fn done(&self, now: Timestamp) -> Self {
        Self {
            state: SegmentState::Done,
            end_time: Some(now),
            ..self.clone()
        }
    }

    /// The segment returned to the pool after an unsuccessful attempt.
    pub fn postponed(&self) -> Self {
        Self {
            state: SegmentState::NotStarted,
            start_time: None,
            end_time: None,
            coordinator_host: None,
            repair_command_id: None,
            fail_count: self.fail_count + 1,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Repair schedules
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`RepairSchedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleState {
    /// Spawns runs when due.
    Active,
    /// Kept but not spawning runs.
    Paused,
    /// Marked for removal.
    Deleted,
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// A periodic repair of a [`RepairUnit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairSchedule {
    /// Unique identifier.
    pub id: ScheduleId,
    /// Scope being repaired.
    pub unit_id: UnitId,
    /// Current lifecycle state.
    pub state: ScheduleState,
    /// Days between two activations.
    pub days_between: u32,
    /// When the schedule next spawns a run.
    pub next_activation: Timestamp,
    /// Runs spawned so far, oldest first.
    pub run_history: Vec<RunId>,
    /// Segment count of spawned runs.
    pub segment_count: u32,
    /// Parallelism of spawned runs.
    pub parallelism: RepairParallelism,
    /// Intensity of spawned runs.
    pub intensity: f64,
    /// When the schedule was created.
    pub creation_time: Timestamp,
    /// Who owns the schedule.
    pub owner: String,
    /// When the schedule was paused.
    pub pause_time: Option<Timestamp>,
    /// How long finished runs are kept before the cleaner removes them.
    pub days_to_expire_after_done: Option<u32>,
}

/// Fields needed to create a [`RepairSchedule`]; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRepairSchedule {
    /// Scope being repaired.
    pub unit_id: UnitId,
    /// Days between two activations.
    pub days_between: u32,
    /// First activation.
    pub next_activation: Timestamp,
    /// Segment count of spawned runs.
    pub segment_count: u32,
    /// Parallelism of spawned runs.
    pub parallelism: RepairParallelism,
    /// Intensity of spawned runs.
    pub intensity: f64,
    /// When the schedule was created.
    pub creation_time: Timestamp,
    /// Who owns the schedule.
    pub owner: String,
    /// Retention of finished runs.
    pub days_to_expire_after_done: Option<u32>,
}

impl NewRepairSchedule {
    /// Materialize the schedule under the given id, in `ACTIVE`.
    pub fn into_schedule(self, id: ScheduleId) -> RepairSchedule {
        RepairSchedule {
            id,
            unit_id: self.unit_id,
            state: ScheduleState::Active,
            days_between: self.days_between,
            next_activation: self.next_activation,
            run_history: Vec::new(),
            segment_count: self.segment_count,
            parallelism: self.parallelism,
            intensity: self.intensity,
            creation_time: self.creation_time,
            owner: self.owner,
            pause_time: None,
            days_to_expire_after_done: self.days_to_expire_after_done,
        }
    }
}

impl RepairSchedule {
    /// Whether the schedule should spawn a run at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.state == ScheduleState::Active && self.next_activation <= now
    }

    /// The activation after the next one.
    pub fn following_activation(&self) -> Timestamp {
        self.next_activation + self.interval()
    }

    fn interval(&self) -> Duration {
        Duration::days(i64::from(self.days_between.max(1)))
    }

    /// First activation strictly after `now`, stepping by whole intervals.
    ///
    /// Never earlier than the current `next_activation`.
    pub fn activation_after(&self, now: Timestamp) -> Timestamp {
        let mut next = self.next_activation;
        while next <= now {
            next += self.interval();
        }
        next
    }

    /// The schedule after spawning `run_id` at `now`.
    pub fn activated(&self, run_id: RunId, now: Timestamp) -> Self {
        let mut next = self.clone();
        next.run_history.push(run_id);
        next.next_activation = self.activation_after(now);
        next
    }

    /// ACTIVE → PAUSED.
    pub fn paused(&self, now: Timestamp) -> Result<Self, InvalidTransition> {
        if self.state != ScheduleState::Active {
            return Err(InvalidTransition::new(
                "schedule",
                self.state,
                ScheduleState::Paused,
            ));
        }
        Ok(Self {
            state: ScheduleState::Paused,
            pause_time: Some(now),
            ..self.clone()
        })
    }

    /// PAUSED → ACTIVE, skipping activations missed while paused.
    pub fn resumed(&self, now: Timestamp) -> Result<Self, InvalidTransition> {
        if self.state != ScheduleState::Paused {
            return Err(InvalidTransition::new(
                "schedule",
                self.state,
                ScheduleState::Active,
            ));
        }
        Ok(Self {
            state: ScheduleState::Active,
            pause_time: None,
            next_activation: self.activation_after(now),
            ..self.clone()
        })
    }
}
