//! Cluster control interface.
//!
//! The repair engine never speaks a node protocol directly. It goes through
//! two traits:
//!
//! - [`ClusterConnector`] opens a [`ClusterClient`] to a host, or to any
//!   reachable host of a list ([`ClusterConnector::connect_any`]).
//! - [`ClusterClient`] reads topology (tokens, keyspaces, replica map),
//!   triggers repair sessions and streams their [`RepairNotification`]s.
//!
//! [`sim`] provides an in-process simulated cluster implementing both.

mod error;
pub mod sim;
#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use mender_types::{RepairParallelism, RingRange, Token};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub use error::ClusterError;

/// Token range → replica hosts, as reported by a node for one keyspace.
pub type EndpointMap = BTreeMap<RingRange, Vec<String>>;

/// Progress codes a coordinator reports for a repair command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepairStatus {
    /// The coordinator accepted the command and began work.
    Started,
    /// The repair session completed successfully.
    SessionSuccess,
    /// The repair session failed.
    SessionFailed,
    /// The command is over, whatever the outcome.
    Finished,
}

/// A status update for one repair command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairNotification {
    /// Command id returned by [`ClusterClient::trigger_repair`].
    pub command_id: u32,
    /// Reported status.
    pub status: RepairStatus,
    /// Optional free-form detail from the node.
    pub message: Option<String>,
}

/// What to repair in one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRequest {
    /// Keyspace to repair.
    pub keyspace: String,
    /// Tables to repair; empty means all.
    pub tables: BTreeSet<String>,
    /// Token range to repair.
    pub range: RingRange,
    /// Validation parallelism.
    pub parallelism: RepairParallelism,
    /// Whether the repair is incremental.
    pub incremental: bool,
}

/// A connection to one node of a cluster.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Host this client is connected to.
    fn host(&self) -> &str;

    /// Name the cluster reports for itself.
    async fn cluster_name(&self) -> Result<String, ClusterError>;

    /// Fully qualified partitioner class name.
    async fn partitioner(&self) -> Result<String, ClusterError>;

    /// All keyspaces, including system ones.
    async fn keyspaces(&self) -> Result<Vec<String>, ClusterError>;

    /// Tables of a keyspace.
    async fn tables(&self, keyspace: &str) -> Result<BTreeSet<String>, ClusterError>;

    /// Every token of the ring.
    async fn tokens(&self) -> Result<Vec<Token>, ClusterError>;

    /// Replica hosts of every token range of a keyspace.
    async fn range_to_endpoint_map(&self, keyspace: &str) -> Result<EndpointMap, ClusterError>;

    /// Subscribe to repair notifications emitted by this node.
    ///
    /// Subscribe before [`trigger_repair`](Self::trigger_repair) to not miss
    /// the first updates.
    fn subscribe(&self) -> broadcast::Receiver<RepairNotification>;

    /// Ask this node to coordinate a repair. Returns the command id.
    async fn trigger_repair(&self, request: &RepairRequest) -> Result<u32, ClusterError>;

    /// Abort every repair this node coordinates.
    async fn cancel_all_repairs(&self) -> Result<(), ClusterError>;

    /// Whether the node still answers.
    async fn is_connected(&self) -> bool;
}

/// Opens [`ClusterClient`]s.
#[async_trait::async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect to a specific host.
    async fn connect(&self, host: &str) -> Result<Arc<dyn ClusterClient>, ClusterError>;

    /// Connect to the first reachable host, trying them in random order.
    async fn connect_any(&self, hosts: &[String]) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        let mut candidates = hosts.to_vec();
        candidates.shuffle(&mut rand::rng());
        for host in &candidates {
            match self.connect(host).await {
                Ok(client) => {
                    debug!(%host, "connected");
                    return Ok(client);
                }
                Err(e) => warn!(%host, error = %e, "connection attempt failed"),
            }
        }
        Err(ClusterError::NoReachableHost(hosts.to_vec()))
    }
}

/// Replicas able to coordinate a repair of `range`.
///
/// These are the replicas of the token ranges that enclose `range`. An
/// empty result means no node owns the whole range.
pub fn coordinators_for(map: &EndpointMap, range: &RingRange) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    for endpoints in map
        .iter()
        .filter(|(owned, _)| owned.encloses(range))
        .map(|(_, endpoints)| endpoints)
    {
        for host in endpoints {
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }
    }
    hosts
}
