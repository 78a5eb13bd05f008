//! One repair attempt of one segment.
//!
//! The runner connects to a coordinator, triggers the repair and follows the
//! coordinator's notifications. Every notification goes through
//! [`next_segment_state`]; a status with no transition from the segment's
//! current state fails the whole run. A segment that is still not finished
//! when the timeout expires is put back to `NOT_STARTED` and the
//! coordinator is told to drop all its repairs.

use std::time::Duration;

use chrono::Utc;
use mender_cluster::{ClusterClient, RepairRequest, RepairStatus};
use mender_types::{RepairParallelism, RepairUnit, RunId, RunState, SegmentId, SegmentState};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::RepairError;
use crate::context::{RepairContext, SegmentClaim};

/// Everything one attempt needs.
#[derive(Debug)]
pub struct SegmentAttempt {
    /// Owning run.
    pub run_id: RunId,
    /// Segment to repair.
    pub segment_id: SegmentId,
    /// Replicas that may coordinate the repair.
    pub coordinators: Vec<String>,
    /// Scope of the repair.
    pub unit: RepairUnit,
    /// Validation parallelism.
    pub parallelism: RepairParallelism,
    /// Run intensity, used to throttle after a successful repair.
    pub intensity: f64,
    /// How long to wait for the repair before declaring it hung.
    pub timeout: Duration,
    /// Exclusive claim on the segment, released when the attempt ends.
    pub claim: SegmentClaim,
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentReport {
    /// Segment state when the attempt ended.
    pub state: SegmentState,
    /// Time between triggering the repair and the end of the attempt.
    pub active: Duration,
}

impl SegmentReport {
    fn postponed(active: Duration) -> Self {
        Self {
            state: SegmentState::NotStarted,
            active,
        }
    }
}

/// Segment state after receiving `status` in state `current`.
///
/// `None` means the combination is not expected from a coordinator.
pub fn next_segment_state(current: SegmentState, status: RepairStatus) -> Option<SegmentState> {
    use RepairStatus::{Finished, SessionFailed, SessionSuccess, Started};
    use SegmentState::{Done, NotStarted, Running};

    match (current, status) {
        (NotStarted, Started) => Some(Running),
        (NotStarted, SessionFailed | Finished) => Some(NotStarted),
        (Running, SessionSuccess) => Some(Done),
        (Running, SessionFailed | Finished) => Some(NotStarted),
        (Done, Finished) => Some(Done),
        _ => None,
    }
}

/// Run one attempt. Returns the segment state it ended in.
///
/// Unreachable coordinators and rejected commands leave the segment
/// `NOT_STARTED`; only store failures and unmapped notifications are errors.
#[tracing::instrument(skip_all, fields(run_id = %attempt.run_id, segment_id = %attempt.segment_id))]
pub async fn repair_segment(
    ctx: &RepairContext,
    attempt: SegmentAttempt,
) -> Result<SegmentReport, RepairError> {
    let SegmentAttempt {
        run_id,
        segment_id,
        coordinators,
        unit,
        parallelism,
        timeout,
        claim: _claim,
        ..
    } = attempt;

    let segment = ctx
        .store
        .get_repair_segment(segment_id)?
        .ok_or_else(|| RepairError::not_found("segment", segment_id))?;
    if segment.state != SegmentState::NotStarted {
        return Err(RepairError::UnexpectedSegmentState(segment.state));
    }
    match ctx.store.get_repair_run(run_id)? {
        Some(run) if run.state == RunState::Running => {}
        _ => {
            debug!("run no longer running, segment left untouched");
            return Ok(SegmentReport::postponed(Duration::ZERO));
        }
    }

    let client = match ctx.connector.connect_any(&coordinators).await {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "no coordinator reachable, segment postponed");
            return Ok(SegmentReport::postponed(Duration::ZERO));
        }
    };
    let host = client.host().to_string();

    // Subscribe first so the Started notification cannot be missed.
    let mut notifications = client.subscribe();
    let request = RepairRequest {
        keyspace: unit.keyspace.clone(),
        tables: unit.tables.clone(),
        range: segment.range.clone(),
        parallelism,
        incremental: unit.incremental,
    };
    let triggered_at = Instant::now();
    let command_id = match client.trigger_repair(&request).await {
        Ok(id) => id,
        Err(e) => {
            warn!(%host, error = %e, "coordinator refused repair, segment postponed");
            return Ok(SegmentReport::postponed(Duration::ZERO));
        }
    };
    debug!(%host, command_id, range = %segment.range, "repair triggered");
    ctx.store.update_last_event(
        run_id,
        &format!("Triggered repair of segment {segment_id} via host {host}"),
    )?;

    let deadline = triggered_at + timeout;
    let mut state = SegmentState::NotStarted;
    loop {
        let notification = match tokio::time::timeout_at(deadline, notifications.recv()).await {
            Ok(Ok(notification)) => notification,
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "missed repair notifications");
                continue;
            }
            Ok(Err(RecvError::Closed)) => {
                warn!(%host, "notification stream closed, segment postponed");
                ctx.store.modify_repair_segment(segment_id, &|s| Ok(s.postponed()))?;
                return Ok(SegmentReport::postponed(triggered_at.elapsed()));
            }
            Err(_) => {
                return recover_hang(ctx, client.as_ref(), run_id, segment_id, timeout)
                    .await
                    .map(|()| SegmentReport::postponed(triggered_at.elapsed()));
            }
        };
        if notification.command_id != command_id {
            continue;
        }

        let status = notification.status;
        let next = next_segment_state(state, status).ok_or_else(|| {
            RepairError::UnmappedTransition {
                state,
                status: format!("{status:?}"),
            }
        })?;
        debug!(?status, from = %state, to = %next, "repair notification");

        match (state, next) {
            (SegmentState::NotStarted, SegmentState::Running) => {
                let now = Utc::now();
                ctx.store
                    .modify_repair_segment(segment_id, &|s| Ok(s.started(&host, command_id, now)))?;
            }
            (SegmentState::Running, SegmentState::Done) => {
                let now = Utc::now();
                ctx.store
                    .modify_repair_segment(segment_id, &|s| Ok(s.done(now)))?;
            }
            (_, SegmentState::NotStarted) => {
                ctx.store
                    .modify_repair_segment(segment_id, &|s| Ok(s.postponed()))?;
                info!(?status, "repair session failed, segment postponed");
                return Ok(SegmentReport::postponed(triggered_at.elapsed()));
            }
            _ => {}
        }

        state = next;
        if state == SegmentState::Done {
            let active = triggered_at.elapsed();
            info!(?active, "segment repaired");
            return Ok(SegmentReport {
                state: SegmentState::Done,
                active,
            });
        }
    }
}

/// Put a hung segment back in the pool and stop whatever its coordinator is doing.
async fn recover_hang(
    ctx: &RepairContext,
    client: &dyn ClusterClient,
    run_id: RunId,
    segment_id: SegmentId,
    timeout: Duration,
) -> Result<(), RepairError> {
    warn!(
        host = client.host(),
        ?timeout,
        "repair hangs, forcing segment back to NOT_STARTED"
    );
    ctx.store
        .modify_repair_segment(segment_id, &|s| Ok(s.postponed()))?;
    if let Err(e) = client.cancel_all_repairs().await {
        warn!(host = client.host(), error = %e, "failed to cancel repairs on coordinator");
    }
    ctx.store.update_last_event(
        run_id,
        &format!("Segment {segment_id} timed out after {}s", timeout.as_secs()),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use RepairStatus::*;
        use SegmentState::*;

        let cases = [
            (NotStarted, Started, Some(Running)),
            (NotStarted, SessionFailed, Some(NotStarted)),
            (NotStarted, Finished, Some(NotStarted)),
            (NotStarted, SessionSuccess, None),
            (Running, SessionSuccess, Some(Done)),
            (Running, SessionFailed, Some(NotStarted)),
            (Running, Finished, Some(NotStarted)),
            (Running, Started, None),
            (Done, Finished, Some(Done)),
            (Done, Started, None),
            (Done, SessionSuccess, None),
            (Done, SessionFailed, None),
        ];
        for (current, status, expected) in cases {
            assert_eq!(
                next_segment_state(current, status),
                expected,
                "{current} + {status:?}"
            );
        }
    }
}
