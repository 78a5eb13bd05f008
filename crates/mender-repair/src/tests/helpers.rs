//! Shared test utilities for mender-repair tests.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use mender_cluster::sim::{SimConnector, SimulatedCluster};
use mender_meta::{MemoryStore, RepairStore};
use mender_types::{Cluster, RepairConfig, RepairRun, RunId, RunState};

use crate::{NewRunRequest, RepairContext, RepairService};

pub const KEYSPACE: &str = "shop";
pub const OWNER: &str = "tester";

/// Engine settings with every timer shortened for tests.
pub fn test_config() -> RepairConfig {
    RepairConfig {
        segment_count: 12,
        intensity: 1.0,
        repair_run_threads: 4,
        hanging_repair_timeout: Duration::from_millis(300),
        retry_delay: Duration::from_millis(20),
        scheduling_poll_interval: Duration::from_millis(50),
        ..RepairConfig::default()
    }
}

/// A registered simulated cluster and a service to drive it.
pub struct TestCluster {
    pub sim: Arc<SimulatedCluster>,
    pub store: Arc<dyn RepairStore>,
    pub service: RepairService,
    pub cluster: Cluster,
}

impl TestCluster {
    /// A second service over the same store and cluster, as after a restart.
    pub fn restarted(&self, config: RepairConfig) -> RepairService {
        service_over(Arc::clone(&self.store), Arc::clone(&self.sim), config)
    }

    /// Create a run of the test keyspace with the test defaults.
    pub async fn create_run(&self) -> RepairRun {
        self.service
            .create_run(NewRunRequest::new(&self.cluster.name, KEYSPACE, OWNER))
            .await
            .unwrap()
    }
}

pub fn service_over(
    store: Arc<dyn RepairStore>,
    sim: Arc<SimulatedCluster>,
    config: RepairConfig,
) -> RepairService {
    let connector = Arc::new(SimConnector::new().with_cluster(sim));
    RepairService::new(RepairContext::new(store, connector, config))
}

/// A `nodes`-node cluster with keyspace `shop` at replication factor `rf`,
/// registered with a fresh in-memory store.
pub async fn test_cluster(nodes: usize, rf: usize, config: RepairConfig) -> TestCluster {
    let sim = Arc::new(SimulatedCluster::new(
        "test",
        nodes,
        Duration::from_millis(5),
    ));
    sim.add_keyspace(KEYSPACE, rf, &["orders", "carts"]);

    let store: Arc<dyn RepairStore> = Arc::new(MemoryStore::new());
    let service = service_over(Arc::clone(&store), Arc::clone(&sim), config);
    let seeds: BTreeSet<String> = sim.hosts().iter().take(2).cloned().collect();
    let cluster = service.register_cluster(seeds).await.unwrap();

    TestCluster {
        sim,
        store,
        service,
        cluster,
    }
}

/// Poll until `check` holds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    while !check() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the run reaches `state`, and return it.
pub async fn wait_for_run_state(store: &dyn RepairStore, id: RunId, state: RunState) -> RepairRun {
    loop {
        let run = store.get_repair_run(id).unwrap().unwrap();
        if run.state == state {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
