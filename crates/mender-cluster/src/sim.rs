//! An in-process simulated cluster.
//!
//! [`SimulatedCluster`] models a ring of nodes with evenly spaced Murmur3
//! tokens, a set of keyspaces with a replication factor, and nodes that
//! answer repair commands after a configurable delay. [`SimConnector`]
//! hands out [`ClusterClient`]s for its hosts. Hosts can be marked down and
//! repairs can be made to fail or hang, which is enough to drive the repair
//! engine end to end without a real database.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mender_ring::Partitioner;
use mender_types::{RingRange, Token};
use num_bigint::BigInt;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    ClusterClient, ClusterConnector, ClusterError, EndpointMap, RepairNotification,
    RepairRequest, RepairStatus,
};

const PARTITIONER: &str = "org.apache.cassandra.dht.Murmur3Partitioner";
const NOTIFICATION_BUFFER: usize = 1024;

/// How simulated coordinators answer repair commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimBehavior {
    /// Started, then SessionSuccess and Finished.
    Succeed,
    /// Started, then SessionFailed and Finished.
    Fail,
    /// Started, then nothing.
    Hang,
}

/// One repair command received by a simulated node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggeredRepair {
    /// Coordinator host.
    pub host: String,
    /// Command id handed back.
    pub command_id: u32,
    /// The request.
    pub request: RepairRequest,
}

#[derive(Debug, Clone)]
struct SimKeyspace {
    replication_factor: usize,
    tables: BTreeSet<String>,
}

struct SimState {
    keyspaces: BTreeMap<String, SimKeyspace>,
    down: HashSet<String>,
    behavior: SimBehavior,
    /// Behaviors queued for upcoming commands, consumed before `behavior`.
    scripted: Vec<SimBehavior>,
    triggered: Vec<TriggeredRepair>,
    cancelled: Vec<String>,
}

/// A simulated cluster of `n` nodes.
pub struct SimulatedCluster {
    name: String,
    hosts: Vec<String>,
    tokens: Vec<Token>,
    channels: HashMap<String, broadcast::Sender<RepairNotification>>,
    repair_delay: Duration,
    next_command: AtomicU32,
    state: Mutex<SimState>,
}

impl SimulatedCluster {
    /// Cluster `name` with hosts `{name}-node-{i}`, one token per node.
    ///
    /// Tokens are spread evenly over the Murmur3 ring. A system keyspace
    /// is always present.
    pub fn new(name: &str, node_count: usize, repair_delay: Duration) -> Self {
        let hosts: Vec<String> = (0..node_count)
            .map(|i| format!("{name}-node-{i}"))
            .collect();
        Self::with_hosts(name, hosts, repair_delay)
    }

    /// Cluster `name` over the given hosts.
    pub fn with_hosts(name: &str, hosts: Vec<String>, repair_delay: Duration) -> Self {
        let partitioner = Partitioner::Murmur3;
        let min = partitioner.min_token();
        let ring_size = partitioner.max_token() - &min + 1;
        let count = hosts.len().max(1);
        let tokens = (0..hosts.len())
            .map(|i| &min + &ring_size * BigInt::from(i) / BigInt::from(count))
            .collect();

        let channels = hosts
            .iter()
            .map(|host| (host.clone(), broadcast::channel(NOTIFICATION_BUFFER).0))
            .collect();

        let mut keyspaces = BTreeMap::new();
        keyspaces.insert(
            "system".to_string(),
            SimKeyspace {
                replication_factor: 1,
                tables: BTreeSet::from(["local".to_string(), "peers".to_string()]),
            },
        );

        Self {
            name: name.to_string(),
            hosts,
            tokens,
            channels,
            repair_delay,
            next_command: AtomicU32::new(1),
            state: Mutex::new(SimState {
                keyspaces,
                down: HashSet::new(),
                behavior: SimBehavior::Succeed,
                scripted: Vec::new(),
                triggered: Vec::new(),
                cancelled: Vec::new(),
            }),
        }
    }

    /// Cluster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All hosts of the cluster.
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Ring tokens, one per host, in host order.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Add (or replace) a keyspace.
    pub fn add_keyspace(&self, keyspace: &str, replication_factor: usize, tables: &[&str]) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.keyspaces.insert(
            keyspace.to_string(),
            SimKeyspace {
                replication_factor: replication_factor.clamp(1, self.hosts.len().max(1)),
                tables: tables.iter().map(|t| t.to_string()).collect(),
            },
        );
    }

    /// Drop a keyspace.
    pub fn remove_keyspace(&self, keyspace: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.keyspaces.remove(keyspace);
    }

    /// Mark a host unreachable (or reachable again).
    pub fn set_host_down(&self, host: &str, down: bool) {
        let mut state = self.state.lock().expect("lock poisoned");
        if down {
            state.down.insert(host.to_string());
        } else {
            state.down.remove(host);
        }
    }

    /// Set how future repair commands behave.
    pub fn set_behavior(&self, behavior: SimBehavior) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.behavior = behavior;
    }

    /// Queue behaviors for the next commands, in order.
    pub fn script(&self, behaviors: &[SimBehavior]) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.scripted.extend(behaviors.iter().copied());
    }

    /// Every repair command received so far.
    pub fn triggered(&self) -> Vec<TriggeredRepair> {
        self.state.lock().expect("lock poisoned").triggered.clone()
    }

    /// Hosts that received a cancel-all request, in order.
    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().expect("lock poisoned").cancelled.clone()
    }

    fn is_down(&self, host: &str) -> bool {
        self.state.lock().expect("lock poisoned").down.contains(host)
    }

    fn owns(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h == host)
    }

    fn endpoint_map(&self, keyspace: &str) -> Result<EndpointMap, ClusterError> {
        let state = self.state.lock().expect("lock poisoned");
        let ks = state
            .keyspaces
            .get(keyspace)
            .ok_or_else(|| ClusterError::UnknownKeyspace(keyspace.to_string()))?;

        let n = self.hosts.len();
        let mut map = EndpointMap::new();
        for i in 0..n {
            let range = RingRange::new(self.tokens[i].clone(), self.tokens[(i + 1) % n].clone());
            let replicas = (0..ks.replication_factor)
                .map(|r| self.hosts[(i + 1 + r) % n].clone())
                .collect();
            map.insert(range, replicas);
        }
        Ok(map)
    }

    fn start_repair(&self, host: &str, request: &RepairRequest) -> (u32, SimBehavior) {
        let command_id = self.next_command.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().expect("lock poisoned");
        let behavior = if state.scripted.is_empty() {
            state.behavior
        } else {
            state.scripted.remove(0)
        };
        state.triggered.push(TriggeredRepair {
            host: host.to_string(),
            command_id,
            request: request.clone(),
        });
        (command_id, behavior)
    }
}

/// A [`ClusterClient`] bound to one host of a [`SimulatedCluster`].
pub struct SimClient {
    cluster: Arc<SimulatedCluster>,
    host: String,
}

impl SimClient {
    fn check_up(&self) -> Result<(), ClusterError> {
        if self.cluster.is_down(&self.host) {
            return Err(ClusterError::Unreachable {
                host: self.host.clone(),
                reason: "host is down".into(),
            });
        }
        Ok(())
    }

    fn sender(&self) -> Result<broadcast::Sender<RepairNotification>, ClusterError> {
        self.cluster
            .channels
            .get(&self.host)
            .cloned()
            .ok_or_else(|| ClusterError::Request(format!("unknown host {}", self.host)))
    }
}

#[async_trait::async_trait]
impl ClusterClient for SimClient {
    fn host(&self) -> &str {
        &self.host
    }

    async fn cluster_name(&self) -> Result<String, ClusterError> {
        self.check_up()?;
        Ok(self.cluster.name.clone())
    }

    async fn partitioner(&self) -> Result<String, ClusterError> {
        self.check_up()?;
        Ok(PARTITIONER.to_string())
    }

    async fn keyspaces(&self) -> Result<Vec<String>, ClusterError> {
        self.check_up()?;
        let state = self.cluster.state.lock().expect("lock poisoned");
        Ok(state.keyspaces.keys().cloned().collect())
    }

    async fn tables(&self, keyspace: &str) -> Result<BTreeSet<String>, ClusterError> {
        self.check_up()?;
        let state = self.cluster.state.lock().expect("lock poisoned");
        state
            .keyspaces
            .get(keyspace)
            .map(|ks| ks.tables.clone())
            .ok_or_else(|| ClusterError::UnknownKeyspace(keyspace.to_string()))
    }

    async fn tokens(&self) -> Result<Vec<Token>, ClusterError> {
        self.check_up()?;
        Ok(self.cluster.tokens.clone())
    }

    async fn range_to_endpoint_map(&self, keyspace: &str) -> Result<EndpointMap, ClusterError> {
        self.check_up()?;
        self.cluster.endpoint_map(keyspace)
    }

    fn subscribe(&self) -> broadcast::Receiver<RepairNotification> {
        match self.cluster.channels.get(&self.host) {
            Some(tx) => tx.subscribe(),
            // Hosts always have a channel; a detached receiver just never fires.
            None => broadcast::channel(1).1,
        }
    }

    async fn trigger_repair(&self, request: &RepairRequest) -> Result<u32, ClusterError> {
        self.check_up()?;
        let tx = self.sender()?;
        let (command_id, behavior) = self.cluster.start_repair(&self.host, request);
        debug!(host = %self.host, command_id, range = %request.range, ?behavior, "simulated repair triggered");

        let delay = self.cluster.repair_delay;
        tokio::spawn(async move {
            let send = |status| {
                let _ = tx.send(RepairNotification {
                    command_id,
                    status,
                    message: None,
                });
            };
            send(RepairStatus::Started);
            let outcome = match behavior {
                SimBehavior::Succeed => RepairStatus::SessionSuccess,
                SimBehavior::Fail => RepairStatus::SessionFailed,
                SimBehavior::Hang => return,
            };
            tokio::time::sleep(delay).await;
            send(outcome);
            send(RepairStatus::Finished);
        });
        Ok(command_id)
    }

    async fn cancel_all_repairs(&self) -> Result<(), ClusterError> {
        self.check_up()?;
        let mut state = self.cluster.state.lock().expect("lock poisoned");
        state.cancelled.push(self.host.clone());
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.cluster.is_down(&self.host)
    }
}

/// Hands out [`SimClient`]s for a set of simulated clusters.
#[derive(Default)]
pub struct SimConnector {
    clusters: Vec<Arc<SimulatedCluster>>,
}

impl SimConnector {
    /// Connector with no clusters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cluster whose hosts this connector can reach.
    pub fn with_cluster(mut self, cluster: Arc<SimulatedCluster>) -> Self {
        self.clusters.push(cluster);
        self
    }
}

#[async_trait::async_trait]
impl ClusterConnector for SimConnector {
    async fn connect(&self, host: &str) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.owns(host))
            .ok_or_else(|| ClusterError::Unreachable {
                host: host.to_string(),
                reason: "unknown host".into(),
            })?;
        let client = SimClient {
            cluster: Arc::clone(cluster),
            host: host.to_string(),
        };
        client.check_up()?;
        Ok(Arc::new(client))
    }
}
