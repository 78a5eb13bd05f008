//! Error types for repair orchestration.

use mender_types::{RingRange, RunState, ScheduleState, SegmentState};

/// Errors that can occur while orchestrating repairs.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    /// Failed to access the repair store.
    #[error("metadata error: {0}")]
    Meta(#[from] mender_meta::MetaError),

    /// Failed to talk to the cluster.
    #[error("cluster error: {0}")]
    Cluster(#[from] mender_cluster::ClusterError),

    /// The ring could not be segmented.
    #[error("segmentation error: {0}")]
    Range(#[from] mender_ring::RangeError),

    /// A request was rejected before anything was changed.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A referenced record does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of record.
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The caller does not own the record it tries to change.
    #[error("{kind} {id} is owned by {owner}")]
    NotOwner {
        /// Kind of record.
        kind: &'static str,
        /// Identifier of the record.
        id: String,
        /// The actual owner.
        owner: String,
    },

    /// The run is not in a state that allows the operation.
    #[error("run is {state}: {operation} not possible")]
    RunState {
        /// Current state.
        state: RunState,
        /// What was attempted.
        operation: &'static str,
    },

    /// The schedule is not in a state that allows the operation.
    #[error("schedule is {state}: {operation} not possible")]
    ScheduleState {
        /// Current state.
        state: ScheduleState,
        /// What was attempted.
        operation: &'static str,
    },

    /// No replica owns the whole token range of a segment.
    #[error("No coordinators for range {0}")]
    NoCoordinators(RingRange),

    /// A segment was in a state its runner cannot handle.
    #[error("unexpected segment state {0}")]
    UnexpectedSegmentState(SegmentState),

    /// A coordinator reported a status that has no transition from the
    /// segment's current state.
    #[error("no transition for status {status} from segment state {state}")]
    UnmappedTransition {
        /// Segment state when the status arrived.
        state: SegmentState,
        /// Reported status.
        status: String,
    },

    /// A segment task ended abnormally.
    #[error("segment task failed: {0}")]
    Task(String),
}

impl RepairError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the failure may resolve by itself, so the work is retried
    /// instead of failing the run.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cluster(e) => e.is_transient(),
            _ => false,
        }
    }
}
