//! Process-wide owner of repair run controllers.
//!
//! The manager holds one [`RepairRunner`] per active run, the bounded pool
//! that segment attempts run on, and the retry timer. Every piece of work is
//! spawned from a plain (non-async) method here, so runners and segment
//! attempts never have to await each other.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use mender_meta::RunFilter;
use mender_types::{RepairRun, RunId, RunState, SegmentState};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::RepairError;
use crate::context::RepairContext;
use crate::runner::RepairRunner;
use crate::segment_runner::{self, SegmentAttempt};
use crate::throttle::intensity_delay;

/// Registry of run controllers plus the segment worker pool.
pub struct RepairManager {
    ctx: Arc<RepairContext>,
    /// Permits for concurrently running segment attempts.
    workers: Arc<Semaphore>,
    runners: Mutex<HashMap<RunId, Arc<RepairRunner>>>,
    /// Runs with a retry tick already scheduled.
    pending_retries: Mutex<HashSet<RunId>>,
}

impl RepairManager {
    /// Create a manager with `repair_run_threads` worker permits.
    pub fn new(ctx: Arc<RepairContext>) -> Arc<Self> {
        let threads = ctx.config.repair_run_threads.max(1);
        Arc::new(Self {
            ctx,
            workers: Arc::new(Semaphore::new(threads)),
            runners: Mutex::new(HashMap::new()),
            pending_retries: Mutex::new(HashSet::new()),
        })
    }

    /// Shared state of the engine.
    pub fn context(&self) -> &Arc<RepairContext> {
        &self.ctx
    }

    /// Start a `NOT_STARTED` run, or resume a `PAUSED` one.
    ///
    /// The runner is built before the run changes state, so a cluster that
    /// cannot be read leaves the run untouched.
    pub async fn start_repair_run(self: &Arc<Self>, run_id: RunId) -> Result<RepairRun, RepairError> {
        let run = self.load_run(run_id)?;
        match run.state {
            RunState::NotStarted => {}
            RunState::Paused => return self.resume_run(run_id).await,
            state => {
                return Err(RepairError::RunState {
                    state,
                    operation: "start",
                });
            }
        }

        let runner = Arc::new(RepairRunner::new(&self.ctx, run_id).await?);
        let now = Utc::now();
        let run = self.ctx.store.modify_repair_run(run_id, &|r| {
            Ok(r.transition(RunState::Running, now)?)
        })?;
        info!(%run_id, cluster = %run.cluster_name, "starting repair run");
        self.register_and_spawn(runner);
        Ok(run)
    }

    /// PAUSED → RUNNING, creating a runner if none is registered.
    pub async fn resume_run(self: &Arc<Self>, run_id: RunId) -> Result<RepairRun, RepairError> {
        let run = self.load_run(run_id)?;
        if run.state != RunState::Paused {
            return Err(RepairError::RunState {
                state: run.state,
                operation: "resume",
            });
        }

        let runner = match self.runner(run_id) {
            Some(runner) => runner,
            None => {
                self.reset_orphaned_segments(run_id)?;
                Arc::new(RepairRunner::new(&self.ctx, run_id).await?)
            }
        };
        let now = Utc::now();
        let run = self.ctx.store.modify_repair_run(run_id, &|r| {
            Ok(r.transition(RunState::Running, now)?)
        })?;
        info!(%run_id, "repair run resumed");
        self.register_and_spawn(runner);
        Ok(run)
    }

    /// RUNNING → PAUSED. Segments in flight finish; no new ones start.
    pub fn pause_run(&self, run_id: RunId) -> Result<RepairRun, RepairError> {
        let run = self.load_run(run_id)?;
        if run.state != RunState::Running {
            return Err(RepairError::RunState {
                state: run.state,
                operation: "pause",
            });
        }
        let now = Utc::now();
        let run = self.ctx.store.modify_repair_run(run_id, &|r| {
            Ok(r.transition(RunState::Paused, now)?)
        })?;
        info!(%run_id, "repair run paused");
        Ok(run)
    }

    /// Recover from a restart: give every `RUNNING` run a runner again.
    ///
    /// Returns the number of runs resumed.
    pub async fn resume_running_runs(self: &Arc<Self>) -> Result<usize, RepairError> {
        let runs = self
            .ctx
            .store
            .list_repair_runs(&RunFilter::state(RunState::Running))?;
        let mut resumed = 0;

        for run in runs {
            if self.runner(run.id).is_some() {
                continue;
            }
            self.reset_orphaned_segments(run.id)?;
            match RepairRunner::new(&self.ctx, run.id).await {
                Ok(runner) => {
                    self.register_and_spawn(Arc::new(runner));
                    resumed += 1;
                }
                Err(e) => {
                    // Left RUNNING so the next restart tries again.
                    warn!(run_id = %run.id, error = %e, "could not resume repair run");
                }
            }
        }

        info!(resumed, "resumed running repair runs");
        Ok(resumed)
    }

    /// Drop the runner of `run_id`, if any.
    pub fn remove_runner(&self, run_id: RunId) {
        let removed = self
            .runners
            .lock()
            .expect("lock poisoned")
            .remove(&run_id);
        if removed.is_some() {
            debug!(%run_id, "runner removed");
        }
    }

    /// Ids of the runs with a registered runner.
    pub fn active_runs(&self) -> Vec<RunId> {
        let mut ids: Vec<_> = self
            .runners
            .lock()
            .expect("lock poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    /// The registered runner of `run_id`.
    pub fn runner(&self, run_id: RunId) -> Option<Arc<RepairRunner>> {
        self.runners
            .lock()
            .expect("lock poisoned")
            .get(&run_id)
            .cloned()
    }

    /// Number of worker permits currently free.
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Put back to `NOT_STARTED` the `RUNNING` segments of a run that no
    /// attempt of this process follows, e.g. after a restart.
    fn reset_orphaned_segments(&self, run_id: RunId) -> Result<(), RepairError> {
        for segment in self.ctx.store.list_repair_segments(run_id)? {
            if segment.state == SegmentState::Running && !self.ctx.segments.is_claimed(segment.id) {
                debug!(%run_id, segment_id = %segment.id, "resetting orphaned segment");
                self.ctx
                    .store
                    .modify_repair_segment(segment.id, &|s| Ok(s.postponed()))?;
            }
        }
        Ok(())
    }

    fn load_run(&self, run_id: RunId) -> Result<RepairRun, RepairError> {
        self.ctx
            .store
            .get_repair_run(run_id)?
            .ok_or_else(|| RepairError::not_found("run", run_id))
    }

    /// Whether `runner` is still the registered runner of its run.
    fn is_current(&self, runner: &Arc<RepairRunner>) -> bool {
        self.runners
            .lock()
            .expect("lock poisoned")
            .get(&runner.run_id())
            .is_some_and(|current| Arc::ptr_eq(current, runner))
    }

    fn register_and_spawn(self: &Arc<Self>, runner: Arc<RepairRunner>) {
        self.runners
            .lock()
            .expect("lock poisoned")
            .entry(runner.run_id())
            .or_insert_with(|| Arc::clone(&runner));
        self.spawn_run(runner);
    }

    /// Run one dispatch step of `runner` in its own task.
    pub(crate) fn spawn_run(self: &Arc<Self>, runner: Arc<RepairRunner>) {
        if !self.is_current(&runner) {
            debug!(run_id = %runner.run_id(), "runner no longer registered, not dispatching");
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            runner.run(&manager).await;
        });
    }

    /// Dispatch the run of `runner` again after `retry_delay`.
    ///
    /// At most one retry is pending per run; extra requests are dropped.
    /// When the timer fires the retry goes to whichever runner is then
    /// registered for the run, so a runner replaced in the meantime does
    /// not swallow the retry of its successor.
    pub(crate) fn schedule_retry(self: &Arc<Self>, runner: &Arc<RepairRunner>) {
        let run_id = runner.run_id();
        if !self
            .pending_retries
            .lock()
            .expect("lock poisoned")
            .insert(run_id)
        {
            return;
        }

        let delay = self.ctx.config.retry_delay;
        debug!(%run_id, ?delay, "retry scheduled");
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager
                .pending_retries
                .lock()
                .expect("lock poisoned")
                .remove(&run_id);
            match manager.runner(run_id) {
                Some(current) => manager.spawn_run(current),
                None => debug!(%run_id, "no runner registered, retry dropped"),
            }
        });
    }

    /// Run a segment attempt on the worker pool and report back to `runner`.
    ///
    /// After a successful repair the slot stays busy for the intensity
    /// delay, so a run at intensity `i` keeps its slots working a fraction
    /// `i` of the time.
    pub(crate) fn submit_segment(
        self: &Arc<Self>,
        runner: Arc<RepairRunner>,
        slot: usize,
        attempt: SegmentAttempt,
    ) {
        let segment_id = attempt.segment_id;
        let intensity = attempt.intensity;
        let ctx = Arc::clone(&self.ctx);
        let workers = Arc::clone(&self.workers);

        let job = tokio::spawn(async move {
            let report = {
                let _permit = workers
                    .acquire_owned()
                    .await
                    .map_err(|e| RepairError::Task(e.to_string()))?;
                segment_runner::repair_segment(&ctx, attempt).await?
            };
            if report.state == SegmentState::Done {
                let delay = intensity_delay(report.active, intensity);
                if !delay.is_zero() {
                    debug!(%segment_id, ?delay, "throttling after segment");
                    tokio::time::sleep(delay).await;
                }
            }
            Ok::<_, RepairError>(report)
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match job.await {
                Ok(result) => result.map(|_| ()),
                Err(e) => {
                    error!(%segment_id, error = %e, "segment task aborted");
                    Err(RepairError::Task(e.to_string()))
                }
            };
            runner
                .handle_result(&manager, slot, segment_id, outcome)
                .await;
        });
    }
}

impl std::fmt::Debug for RepairManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairManager")
            .field("active_runs", &self.active_runs())
            .field("idle_workers", &self.idle_workers())
            .finish()
    }
}
