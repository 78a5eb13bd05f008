//! Per-run controller.
//!
//! A [`RepairRunner`] owns the dispatch of one run. At construction it
//! splits the run's segments into parallel slots, one per group of
//! `replication_factor` token ranges, so that slots touch disjoint replica
//! sets most of the time. Each dispatch fills every idle slot with the next
//! `NOT_STARTED` segment inside the slot's range.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use mender_cluster::{ClusterClient, EndpointMap, coordinators_for};
use mender_types::{
    RepairRun, RepairUnit, RingRange, RunId, RunState, SegmentId, SegmentState,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::RepairError;
use crate::context::RepairContext;
use crate::manager::RepairManager;
use crate::segment_runner::SegmentAttempt;

/// Slot marker value of an idle slot.
const FREE: i64 = -1;
/// Slot marker value while a dispatcher looks for a segment for the slot.
const CLAIMING: i64 = -2;

/// Number of segments that can be repaired at the same time.
///
/// This is the number of token ranges divided by the replication factor,
/// taken as the replica count of the first range.
pub fn parallel_slots(map: &EndpointMap) -> Result<usize, RepairError> {
    let Some(replicas) = map.values().next() else {
        return Err(RepairError::Validation("repairing a zero-sized cluster".into()));
    };
    if replicas.is_empty() {
        return Err(RepairError::Validation("token range without replicas".into()));
    }
    match map.len() / replicas.len() {
        0 => Err(RepairError::Validation("repairing a zero-sized cluster".into())),
        slots => Ok(slots),
    }
}

/// Split the ring into `slots` contiguous ranges over the given segments.
///
/// Segments are sorted by start; range `i` runs from the start of segment
/// `i * n / slots` to the start of segment `(i + 1) * n / slots`, and the
/// last range wraps back to the start of the first segment. With fewer
/// segments than slots, every segment gets a slot of its own.
pub fn parallel_ranges(
    slots: usize,
    mut segments: Vec<RingRange>,
) -> Result<Vec<RingRange>, RepairError> {
    if slots == 0 {
        return Err(RepairError::Validation("cannot repair with 0 parallel slots".into()));
    }
    if segments.is_empty() {
        return Err(RepairError::Validation("run has no segments".into()));
    }
    segments.sort();

    let n = segments.len();
    // Never more slots than segments, or two slots would share a start.
    let slots = slots.min(n);
    let start = |i: usize| segments[i * n / slots].start().clone();
    let mut ranges: Vec<RingRange> = (0..slots - 1)
        .map(|i| RingRange::new(start(i), start(i + 1)))
        .collect();
    ranges.push(RingRange::new(start(slots - 1), segments[0].start().clone()));
    Ok(ranges)
}

/// Controller of one repair run.
pub struct RepairRunner {
    run_id: RunId,
    cluster_name: String,
    seed_hosts: Vec<String>,
    unit: RepairUnit,
    parallel_ranges: Vec<RingRange>,
    /// Per slot: [`FREE`], [`CLAIMING`] or the id of the segment in flight.
    slots: Vec<AtomicI64>,
    client: Mutex<Option<Arc<dyn ClusterClient>>>,
}

impl std::fmt::Debug for RepairRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairRunner")
            .field("run_id", &self.run_id)
            .field("cluster", &self.cluster_name)
            .field("slots", &self.parallel_ranges.len())
            .finish()
    }
}

impl RepairRunner {
    /// Load the run, its unit and cluster, and compute its parallel slots.
    pub async fn new(ctx: &RepairContext, run_id: RunId) -> Result<Self, RepairError> {
        let run = ctx
            .store
            .get_repair_run(run_id)?
            .ok_or_else(|| RepairError::not_found("run", run_id))?;
        let cluster = ctx
            .store
            .get_cluster(&run.cluster_name)?
            .ok_or_else(|| RepairError::not_found("cluster", &run.cluster_name))?;
        let unit = ctx
            .store
            .get_repair_unit(run.unit_id)?
            .ok_or_else(|| RepairError::not_found("repair unit", run.unit_id))?;

        let seed_hosts: Vec<String> = cluster.seed_hosts.iter().cloned().collect();
        let client = ctx.connector.connect_any(&seed_hosts).await?;
        let map = client.range_to_endpoint_map(&unit.keyspace).await?;
        let slot_count = parallel_slots(&map)?;

        let segments = ctx
            .store
            .list_repair_segments(run_id)?
            .into_iter()
            .map(|seg| seg.range)
            .collect();
        let parallel_ranges = parallel_ranges(slot_count, segments)?;
        debug!(%run_id, slots = slot_count, ?parallel_ranges, "computed parallel ranges");

        Ok(Self {
            run_id,
            cluster_name: cluster.name,
            seed_hosts,
            unit,
            slots: (0..parallel_ranges.len()).map(|_| AtomicI64::new(FREE)).collect(),
            parallel_ranges,
            client: Mutex::new(Some(client)),
        })
    }

    /// The run this runner drives.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Token range of every parallel slot.
    pub fn parallel_ranges(&self) -> &[RingRange] {
        &self.parallel_ranges
    }

    /// Segments currently held by this runner's slots.
    pub fn segments_in_flight(&self) -> Vec<SegmentId> {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::SeqCst))
            .filter(|marker| *marker >= 0)
            .map(|marker| SegmentId::new(marker as u64))
            .collect()
    }

    /// Advance the run one step. Safe to call any number of times.
    pub(crate) async fn run(self: &Arc<Self>, manager: &Arc<RepairManager>) {
        if let Err(e) = self.step(manager).await {
            if e.is_transient() {
                warn!(run_id = %self.run_id, error = %e, "transient failure, retrying later");
                manager.schedule_retry(self);
            } else {
                self.fail(manager, &e);
            }
        }
    }

    async fn step(self: &Arc<Self>, manager: &Arc<RepairManager>) -> Result<(), RepairError> {
        let ctx = manager.context();
        let run = match ctx.store.get_repair_run(self.run_id)? {
            Some(run) if !run.state.is_terminated() => run,
            _ => {
                warn!(run_id = %self.run_id, "run is gone or terminated, dropping its runner");
                manager.remove_runner(self.run_id);
                return Ok(());
            }
        };
        debug!(run_id = %self.run_id, state = %run.state, "runner step");

        match run.state {
            RunState::NotStarted => {
                let now = Utc::now();
                let run = ctx.store.modify_repair_run(self.run_id, &|r| {
                    Ok(r.transition(RunState::Running, now)?)
                })?;
                info!(run_id = %self.run_id, cluster = %self.cluster_name, "repair run started");
                self.dispatch(manager, &run).await
            }
            RunState::Running => self.dispatch(manager, &run).await,
            RunState::Paused => {
                manager.schedule_retry(self);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Give every idle slot its next free segment.
    async fn dispatch(
        self: &Arc<Self>,
        manager: &Arc<RepairManager>,
        run: &RepairRun,
    ) -> Result<(), RepairError> {
        let ctx = manager.context();
        let mut map: Option<EndpointMap> = None;
        let mut dispatched = 0usize;

        for (index, range) in self.parallel_ranges.iter().enumerate() {
            let slot = &self.slots[index];
            if slot
                .compare_exchange(FREE, CLAIMING, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!(run_id = %self.run_id, slot = index, "slot busy");
                continue;
            }

            match self
                .claim_segment(ctx, run, index, range, &mut map)
                .await
            {
                Ok(Some(attempt)) => {
                    slot.store(attempt.segment_id.get() as i64, Ordering::SeqCst);
                    manager.submit_segment(Arc::clone(self), index, attempt);
                    dispatched += 1;
                }
                Ok(None) => slot.store(FREE, Ordering::SeqCst),
                Err(e) => {
                    slot.store(FREE, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        if dispatched > 0 {
            return Ok(());
        }
        let done = ctx
            .store
            .segment_count_in_state(self.run_id, SegmentState::Done)?;
        let total = ctx.store.segment_count(self.run_id)?;
        if done == total {
            self.end(manager)?;
        } else {
            debug!(run_id = %self.run_id, done, total, "nothing to dispatch yet");
            manager.schedule_retry(self);
        }
        Ok(())
    }

    /// Find, claim and prepare the next segment of one slot.
    async fn claim_segment(
        &self,
        ctx: &RepairContext,
        run: &RepairRun,
        index: usize,
        range: &RingRange,
        map: &mut Option<EndpointMap>,
    ) -> Result<Option<SegmentAttempt>, RepairError> {
        let Some(segment) = ctx.store.next_free_segment_in_range(self.run_id, range)? else {
            debug!(run_id = %self.run_id, slot = index, %range, "no free segment in slot");
            return Ok(None);
        };
        let Some(claim) = ctx.segments.try_claim(segment.id) else {
            debug!(run_id = %self.run_id, segment_id = %segment.id, "segment already claimed");
            return Ok(None);
        };

        if map.is_none() {
            *map = Some(self.endpoint_map(ctx).await?);
        }
        let coordinators = map
            .as_ref()
            .map(|m| coordinators_for(m, &segment.range))
            .unwrap_or_default();
        if coordinators.is_empty() {
            return Err(RepairError::NoCoordinators(segment.range));
        }

        debug!(run_id = %self.run_id, slot = index, segment_id = %segment.id, "segment claimed");
        Ok(Some(SegmentAttempt {
            run_id: self.run_id,
            segment_id: segment.id,
            coordinators,
            unit: self.unit.clone(),
            parallelism: run.parallelism,
            intensity: run.intensity,
            timeout: ctx.config.hanging_repair_timeout,
            claim,
        }))
    }

    /// Current replica map, reconnecting to a seed if the connection died.
    async fn endpoint_map(&self, ctx: &RepairContext) -> Result<EndpointMap, RepairError> {
        let mut client = self.client.lock().await;
        let alive = match client.as_ref() {
            Some(c) => c.is_connected().await,
            None => false,
        };
        if !alive {
            debug!(run_id = %self.run_id, "reconnecting to cluster");
            *client = None;
            *client = Some(ctx.connector.connect_any(&self.seed_hosts).await?);
        }
        match client.as_ref() {
            Some(c) => Ok(c.range_to_endpoint_map(&self.unit.keyspace).await?),
            None => Err(RepairError::Validation("no cluster connection".into())),
        }
    }

    /// Handle the end of a segment attempt that held slot `index`.
    pub(crate) async fn handle_result(
        self: &Arc<Self>,
        manager: &Arc<RepairManager>,
        index: usize,
        segment_id: SegmentId,
        outcome: Result<(), RepairError>,
    ) {
        self.slots[index].store(FREE, Ordering::SeqCst);
        let ctx = manager.context();

        match ctx.store.get_repair_run(self.run_id) {
            Ok(Some(run)) if !run.state.is_terminated() => {}
            Ok(_) => {
                debug!(run_id = %self.run_id, %segment_id, "run ended while segment was in flight");
                manager.remove_runner(self.run_id);
                return;
            }
            Err(e) => {
                error!(run_id = %self.run_id, error = %e, "cannot load run after segment attempt");
                manager.schedule_retry(self);
                return;
            }
        }

        if let Err(e) = outcome {
            if e.is_transient() {
                warn!(run_id = %self.run_id, %segment_id, error = %e, "segment attempt failed, retrying later");
                manager.schedule_retry(self);
            } else {
                self.fail(manager, &e);
            }
            return;
        }

        let state = match ctx.store.get_repair_segment(segment_id) {
            Ok(Some(segment)) => segment.state,
            Ok(None) => {
                manager.remove_runner(self.run_id);
                return;
            }
            Err(e) => {
                error!(run_id = %self.run_id, error = %e, "cannot load segment after attempt");
                manager.schedule_retry(self);
                return;
            }
        };
        debug!(run_id = %self.run_id, %segment_id, %state, "segment attempt ended");
        match state {
            SegmentState::Done => manager.spawn_run(Arc::clone(self)),
            SegmentState::NotStarted => manager.schedule_retry(self),
            SegmentState::Running => {
                self.fail(manager, &RepairError::UnexpectedSegmentState(state));
            }
        }
    }

    /// Move the run to DONE and unregister.
    ///
    /// Two dispatches can both find every segment done; the one that comes
    /// second sees the run already DONE and only unregisters.
    fn end(&self, manager: &RepairManager) -> Result<(), RepairError> {
        let now = Utc::now();
        let finished = Cell::new(false);
        manager.context().store.modify_repair_run(self.run_id, &|r| {
            if r.state == RunState::Done {
                return Ok(r.clone());
            }
            finished.set(true);
            Ok(r.transition_with_event(RunState::Done, now, "All done")?)
        })?;
        if finished.get() {
            info!(run_id = %self.run_id, cluster = %self.cluster_name, "repair run done");
        } else {
            debug!(run_id = %self.run_id, "run already done");
        }
        manager.remove_runner(self.run_id);
        Ok(())
    }

    /// Record a fatal error on the run and unregister.
    fn fail(&self, manager: &RepairManager, cause: &RepairError) {
        error!(run_id = %self.run_id, error = %cause, "repair run failed");
        let message = cause.to_string();
        let now = Utc::now();
        let store = &manager.context().store;
        let result = store.modify_repair_run(self.run_id, &|r| {
            if r.state.can_transition_to(RunState::Error) {
                Ok(r.transition_with_event(RunState::Error, now, message.clone())?)
            } else if r.state.is_terminated() {
                Ok(r.clone())
            } else {
                Ok(r.with_last_event(message.clone()))
            }
        });
        if let Err(e) = result {
            error!(run_id = %self.run_id, error = %e, "cannot record run failure");
        }
        manager.remove_runner(self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_segments() -> Vec<RingRange> {
        let generator = mender_ring::SegmentGenerator::new(0, 299);
        let tokens: Vec<_> = [0, 50, 100, 150, 200, 250]
            .into_iter()
            .map(num_bigint::BigInt::from)
            .collect();
        generator.generate_segments(32, &tokens).unwrap()
    }

    fn endpoints(ranges: usize, rf: usize) -> EndpointMap {
        (0..ranges)
            .map(|i| {
                let range = RingRange::new(i as i64 * 10, (i as i64 + 1) * 10);
                let replicas = (0..rf).map(|r| format!("node-{}", (i + r) % ranges)).collect();
                (range, replicas)
            })
            .collect()
    }

    #[test]
    fn test_parallel_slots() {
        assert_eq!(parallel_slots(&endpoints(6, 3)).unwrap(), 2);
        assert_eq!(parallel_slots(&endpoints(6, 1)).unwrap(), 6);
        assert!(parallel_slots(&endpoints(2, 3)).is_err());
    }

    #[test]
    fn test_parallel_slots_on_empty_cluster() {
        let err = parallel_slots(&EndpointMap::new()).unwrap_err();
        assert!(err.to_string().contains("zero-sized cluster"));
    }

    #[test]
    fn test_parallel_ranges_two_slots() {
        let ranges = parallel_ranges(2, ring_segments()).unwrap();
        assert_eq!(ranges, vec![RingRange::new(0, 150), RingRange::new(150, 0)]);
    }

    #[test]
    fn test_parallel_ranges_cover_every_segment_once() {
        let segments = ring_segments();
        for slots in 1..=6 {
            let ranges = parallel_ranges(slots, segments.clone()).unwrap();
            assert_eq!(ranges.len(), slots);
            for segment in &segments {
                let owners = ranges.iter().filter(|r| r.encloses(segment)).count();
                assert_eq!(owners, 1, "{slots} slots: {segment} in {owners} ranges");
            }
        }
    }

    #[test]
    fn test_parallel_ranges_unsorted_input() {
        let mut segments = ring_segments();
        segments.reverse();
        let ranges = parallel_ranges(3, segments).unwrap();
        assert_eq!(ranges[0].start(), &num_bigint::BigInt::from(0));
        assert_eq!(ranges[2].end(), &num_bigint::BigInt::from(0));
    }

    #[test]
    fn test_parallel_ranges_rejects_zero_slots() {
        assert!(parallel_ranges(0, ring_segments()).is_err());
        assert!(parallel_ranges(2, Vec::new()).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ntest::timeout(30000)]
    async fn test_ending_a_done_run_is_a_no_op() {
        use crate::tests::helpers::{test_cluster, test_config, wait_for_run_state};

        let c = test_cluster(3, 1, test_config()).await;
        let run = c.create_run().await;
        c.service.start_run(run.id).await.unwrap();
        let done = wait_for_run_state(c.store.as_ref(), run.id, RunState::Done).await;

        // A late dispatch that also found every segment done.
        let manager = c.service.manager();
        let late = RepairRunner::new(manager.context(), run.id).await.unwrap();
        late.end(manager).unwrap();

        let after = c.store.get_repair_run(run.id).unwrap().unwrap();
        assert_eq!(after, done);
        assert!(manager.runner(run.id).is_none());
    }
}
