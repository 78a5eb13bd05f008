//! Shared test harness for Mender integration tests.
//!
//! Provides [`IntegrationCluster`]: a simulated cluster registered with a
//! [`RepairService`], backed by either an in-memory store or a Fjall store
//! in a temporary directory.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mender_cluster::sim::{SimConnector, SimulatedCluster};
use mender_meta::{FjallStore, MemoryStore, RepairStore};
use mender_repair::{NewRunRequest, RepairContext, RepairService};
use mender_types::{Cluster, RepairConfig, RepairRun, RunId, RunState, SegmentState};
use tempfile::TempDir;

/// Keyspace created on every test cluster.
pub const KEYSPACE: &str = "inventory";
/// Owner of runs and schedules created by the harness.
pub const OWNER: &str = "integration";

/// Engine settings with every timer shortened.
pub fn fast_config() -> RepairConfig {
    RepairConfig {
        segment_count: 24,
        intensity: 1.0,
        repair_run_threads: 8,
        hanging_repair_timeout: Duration::from_millis(400),
        retry_delay: Duration::from_millis(25),
        scheduling_poll_interval: Duration::from_millis(50),
        ..RepairConfig::default()
    }
}

/// A simulated cluster wired to a repair service.
pub struct IntegrationCluster {
    pub sim: Arc<SimulatedCluster>,
    pub store: Arc<dyn RepairStore>,
    pub service: RepairService,
    pub cluster: Cluster,
    /// Keeps the Fjall directory alive.
    dir: Option<TempDir>,
}

impl IntegrationCluster {
    /// `nodes` nodes, keyspace [`KEYSPACE`] at replication factor `rf`,
    /// in-memory store.
    pub async fn new(nodes: usize, rf: usize, config: RepairConfig) -> Self {
        let sim = new_sim(nodes, rf);
        let store: Arc<dyn RepairStore> = Arc::new(MemoryStore::new());
        Self::register(sim, store, config, None).await
    }

    /// Same as [`new`](Self::new) with a Fjall store in a temporary directory.
    pub async fn with_fjall(nodes: usize, rf: usize, config: RepairConfig) -> Self {
        let sim = new_sim(nodes, rf);
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn RepairStore> = Arc::new(FjallStore::open(dir.path()).unwrap());
        Self::register(sim, store, config, Some(dir)).await
    }

    /// Reopen the Fjall store left in `dir` by an earlier instance, as a
    /// restarted daemon would. The cluster is not registered again.
    pub fn reopen(sim: Arc<SimulatedCluster>, dir: TempDir, config: RepairConfig) -> Self {
        let store: Arc<dyn RepairStore> = Arc::new(FjallStore::open(dir.path()).unwrap());
        let service = service_over(Arc::clone(&store), Arc::clone(&sim), config);
        let cluster = store.get_cluster(sim.name()).unwrap().unwrap();
        Self {
            sim,
            store,
            service,
            cluster,
            dir: Some(dir),
        }
    }

    async fn register(
        sim: Arc<SimulatedCluster>,
        store: Arc<dyn RepairStore>,
        config: RepairConfig,
        dir: Option<TempDir>,
    ) -> Self {
        let service = service_over(Arc::clone(&store), Arc::clone(&sim), config);
        let seeds: BTreeSet<String> = sim.hosts().iter().take(3).cloned().collect();
        let cluster = service.register_cluster(seeds).await.unwrap();
        Self {
            sim,
            store,
            service,
            cluster,
            dir,
        }
    }

    /// Directory of the Fjall store, if any.
    pub fn data_dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    /// Split into the parts that survive a daemon restart.
    pub fn into_parts(self) -> (Arc<SimulatedCluster>, Option<TempDir>) {
        (self.sim, self.dir)
    }

    /// Create and start a run of [`KEYSPACE`].
    pub async fn start_run(&self) -> RepairRun {
        let run = self
            .service
            .create_run(NewRunRequest::new(&self.cluster.name, KEYSPACE, OWNER))
            .await
            .unwrap();
        self.service.start_run(run.id).await.unwrap()
    }

    /// Wait for `id` to reach `state`.
    pub async fn wait_for(&self, id: RunId, state: RunState) -> RepairRun {
        wait_for_run_state(self.store.as_ref(), id, state).await
    }

    /// Number of `DONE` segments of a run.
    pub fn done_segments(&self, id: RunId) -> usize {
        self.store
            .segment_count_in_state(id, SegmentState::Done)
            .unwrap()
    }
}

fn new_sim(nodes: usize, rf: usize) -> Arc<SimulatedCluster> {
    let sim = SimulatedCluster::new("it", nodes, Duration::from_millis(5));
    sim.add_keyspace(KEYSPACE, rf, &["items", "stock", "prices"]);
    Arc::new(sim)
}

/// A repair service over an existing store and simulated cluster.
pub fn service_over(
    store: Arc<dyn RepairStore>,
    sim: Arc<SimulatedCluster>,
    config: RepairConfig,
) -> RepairService {
    let connector = Arc::new(SimConnector::new().with_cluster(sim));
    RepairService::new(RepairContext::new(store, connector, config))
}

/// Poll until the run reaches `state`.
pub async fn wait_for_run_state(store: &dyn RepairStore, id: RunId, state: RunState) -> RepairRun {
    loop {
        let run = store.get_repair_run(id).unwrap().unwrap();
        if run.state == state {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
