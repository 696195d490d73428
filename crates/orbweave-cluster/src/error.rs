//! Error types for the cluster control layer.

use std::io;
use std::time::Duration;

use orbweave_persistence::{FormatError, StateError};

use crate::ClusterId;

/// Errors that prevent a node from binding to a cluster.
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    /// The locally stored cluster id disagrees with the one the cluster
    /// agreed on. This is a configuration error and is not retried.
    #[error("cluster id mismatch: local {local}, discovered {discovered}")]
    Mismatch {
        local: ClusterId,
        discovered: ClusterId,
    },

    /// The topology never settled before the deadline.
    #[error("failed to bind to a cluster within {0:?}")]
    Timeout(Duration),

    /// This node may bootstrap but could not publish its cluster id.
    #[error("failed to publish cluster id {0}")]
    PublishFailed(ClusterId),

    #[error("cluster id storage: {0}")]
    Storage(#[from] FormatError),
}

/// Errors reading committed log entries.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The cursor produced an entry other than the one requested. Readers
    /// must ask for contiguous, increasing indices once on the slow path.
    #[error("log cursor at index {actual}, expected {expected}")]
    CursorMismatch { expected: i64, actual: i64 },

    #[error("log io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors reported by the consensus engine.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("consensus io error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Failed(String),
}

/// Errors transferring a snapshot from a peer.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot transfer from {source_member} failed: {reason}")]
    Transfer {
        source_member: crate::MemberId,
        reason: String,
    },

    #[error("snapshot io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the local database lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("database io error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Failed(String),
}

/// Failure reported by the local state machine.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StateMachineError(pub String);

/// Errors applying committed commands to the local state machine.
#[derive(Debug, thiserror::Error)]
pub enum ApplicationError {
    /// A committed index could not be found in the cache or the log.
    #[error("committed entry {0} is missing from the log")]
    MissingEntry(i64),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("state machine failed at index {index}: {source}")]
    StateMachine {
        index: i64,
        #[source]
        source: StateMachineError,
    },

    /// The state machine could not produce or install a snapshot.
    #[error("state machine snapshot: {0}")]
    Snapshot(#[source] StateMachineError),

    #[error(transparent)]
    Storage(#[from] StateError),

    /// The applier worker thread could not be spawned.
    #[error("applier worker: {0}")]
    Worker(#[from] io::Error),
}

/// Errors from the core state lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum CoreStateError {
    #[error(transparent)]
    Binding(#[from] BindingError),

    /// No local state existed and no snapshot arrived in time.
    #[error("no snapshot installed within {0:?}; cannot start without state")]
    NoSnapshot(Duration),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Application(#[from] ApplicationError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}
