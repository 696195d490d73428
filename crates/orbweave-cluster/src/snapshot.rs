//! Full-state snapshots used to catch up a node that fell too far behind.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::SnapshotError;
use crate::MemberId;

/// The pieces of replicated core state carried in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CoreStateKind {
    LockToken,
    SessionTracker,
    IdAllocation,
    RaftCoreState,
}

impl CoreStateKind {
    pub fn name(self) -> &'static str {
        match self {
            CoreStateKind::LockToken => "lock-token",
            CoreStateKind::SessionTracker => "session-tracker",
            CoreStateKind::IdAllocation => "id-allocation",
            CoreStateKind::RaftCoreState => "raft-core-state",
        }
    }
}

impl std::fmt::Display for CoreStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to resume application after `prev_index`.
///
/// Installed as a unit: either every part is handed to the state machine
/// or none is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreSnapshot {
    pub prev_index: i64,
    pub prev_term: u64,
    parts: BTreeMap<CoreStateKind, Bytes>,
}

impl CoreSnapshot {
    pub fn new(prev_index: i64, prev_term: u64) -> Self {
        Self {
            prev_index,
            prev_term,
            parts: BTreeMap::new(),
        }
    }

    /// Starting state of a freshly bootstrapped cluster.
    pub fn seed() -> Self {
        Self::new(0, 0)
    }

    pub fn with_parts(prev_index: i64, prev_term: u64, parts: BTreeMap<CoreStateKind, Bytes>) -> Self {
        Self {
            prev_index,
            prev_term,
            parts,
        }
    }

    /// Adds or replaces one part.
    pub fn add(&mut self, kind: CoreStateKind, data: impl Into<Bytes>) {
        self.parts.insert(kind, data.into());
    }

    pub fn get(&self, kind: CoreStateKind) -> Option<&Bytes> {
        self.parts.get(&kind)
    }

    pub fn parts(&self) -> impl Iterator<Item = (CoreStateKind, &Bytes)> {
        self.parts.iter().map(|(kind, data)| (*kind, data))
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Fetches a snapshot from a peer.
pub trait SnapshotDownloader: Send + Sync {
    fn download(&self, source: MemberId) -> Result<CoreSnapshot, SnapshotError>;
}
