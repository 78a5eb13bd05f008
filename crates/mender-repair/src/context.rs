//! Shared process state injected into every repair component.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use mender_cluster::ClusterConnector;
use mender_meta::RepairStore;
use mender_types::{RepairConfig, SegmentId};

/// Everything the repair components share.
pub struct RepairContext {
    /// Durable state.
    pub store: Arc<dyn RepairStore>,
    /// Opens connections to cluster nodes.
    pub connector: Arc<dyn ClusterConnector>,
    /// Engine tunables.
    pub config: RepairConfig,
    /// Segments currently being repaired by this process.
    pub segments: SegmentRegistry,
}

impl RepairContext {
    /// Build a context with an empty segment registry.
    pub fn new(
        store: Arc<dyn RepairStore>,
        connector: Arc<dyn ClusterConnector>,
        config: RepairConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            connector,
            config,
            segments: SegmentRegistry::default(),
        })
    }
}

/// Process-wide set of in-flight segment ids.
///
/// A segment can be claimed by at most one holder at a time; a second claim
/// is refused rather than queued.
#[derive(Clone, Default)]
pub struct SegmentRegistry {
    claimed: Arc<Mutex<HashSet<SegmentId>>>,
}

impl SegmentRegistry {
    /// Claim `id`, or `None` if someone already holds it.
    pub fn try_claim(&self, id: SegmentId) -> Option<SegmentClaim> {
        let mut claimed = self.claimed.lock().expect("lock poisoned");
        if !claimed.insert(id) {
            return None;
        }
        Some(SegmentClaim {
            id,
            claimed: Arc::clone(&self.claimed),
        })
    }

    /// Whether `id` is currently claimed.
    pub fn is_claimed(&self, id: SegmentId) -> bool {
        self.claimed.lock().expect("lock poisoned").contains(&id)
    }

    /// Number of claimed segments.
    pub fn len(&self) -> usize {
        self.claimed.lock().expect("lock poisoned").len()
    }

    /// Whether no segment is claimed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive right to repair one segment. Released on drop.
pub struct SegmentClaim {
    id: SegmentId,
    claimed: Arc<Mutex<HashSet<SegmentId>>>,
}

impl SegmentClaim {
    /// The claimed segment.
    pub fn segment_id(&self) -> SegmentId {
        self.id
    }
}

impl std::fmt::Debug for SegmentClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SegmentClaim").field(&self.id).finish()
    }
}

impl Drop for SegmentClaim {
    fn drop(&mut self) {
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let registry = SegmentRegistry::default();
        let id = SegmentId::new(4);

        let claim = registry.try_claim(id).unwrap();
        assert!(registry.try_claim(id).is_none());
        assert!(registry.is_claimed(id));
        assert!(registry.try_claim(SegmentId::new(5)).is_some());

        drop(claim);
        assert!(!registry.is_claimed(id));
        assert!(registry.try_claim(id).is_some());
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let registry = SegmentRegistry::default();
        let id = SegmentId::new(1);
        let winners: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| registry.try_claim(id)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(winners.iter().filter(|c| c.is_some()).count(), 1);
    }
}
