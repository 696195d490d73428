//! Cluster-wide agreement as seen by the discovery service.

use crate::{ClusterId, MemberId};

/// Point-in-time view of the cluster from the discovery service.
///
/// Recomputed on every call to [`TopologyService::current_topology`];
/// never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    /// Cluster id the visible members have agreed on, if any.
    pub cluster_id: Option<ClusterId>,
    /// Whether the visible members may originate a brand-new cluster,
    /// typically because enough of the configured founding members are
    /// present.
    pub can_be_bootstrapped: bool,
    /// Members currently visible.
    pub members: Vec<MemberId>,
}

impl ClusterTopology {
    /// A topology where the cluster has already agreed on `id`.
    pub fn bound(id: ClusterId) -> Self {
        Self {
            cluster_id: Some(id),
            ..Self::default()
        }
    }

    /// A topology with no agreed id where the visible members may
    /// bootstrap.
    pub fn bootstrappable() -> Self {
        Self {
            can_be_bootstrapped: true,
            ..Self::default()
        }
    }

    pub fn cluster_id(&self) -> Option<ClusterId> {
        self.cluster_id
    }

    pub fn can_be_bootstrapped(&self) -> bool {
        self.can_be_bootstrapped
    }
}

/// Discovery collaborator.
pub trait TopologyService: Send + Sync {
    /// Returns the current view of the cluster.
    fn current_topology(&self) -> ClusterTopology;

    /// Tries to make `id` the agreed cluster id. Returns `false` if the
    /// id could not be published.
    fn publish_cluster_id(&self, id: ClusterId) -> bool;
}
