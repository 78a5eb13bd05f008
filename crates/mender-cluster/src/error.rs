//! Error types for cluster control operations.

/// Errors that can occur while talking to cluster nodes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// A single host could not be reached.
    #[error("cannot reach {host}: {reason}")]
    Unreachable {
        /// The host that was tried.
        host: String,
        /// Why the connection failed.
        reason: String,
    },

    /// None of the given hosts could be reached.
    #[error("no reachable host among {0:?}")]
    NoReachableHost(Vec<String>),

    /// The keyspace does not exist on the cluster.
    #[error("unknown keyspace: {0}")]
    UnknownKeyspace(String),

    /// The node rejected or failed a request.
    #[error("request failed: {0}")]
    Request(String),
}

impl ClusterError {
    /// Whether retrying later (possibly on another host) may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::NoReachableHost(_))
    }
}
