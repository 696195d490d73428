//! Interface to the consensus engine.
//!
//! Leader election, replication and commit are implemented elsewhere. This
//! layer only feeds inbound messages to the engine and reacts to what it
//! reports back.

use bytes::Bytes;

use crate::error::ConsensusError;
use crate::MemberId;

/// An inbound consensus message. Only the sender is meaningful here;
/// the payload is passed to the engine untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftMessage {
    pub from: MemberId,
    pub payload: Bytes,
}

impl RaftMessage {
    pub fn new(from: MemberId, payload: impl Into<Bytes>) -> Self {
        Self {
            from,
            payload: payload.into(),
        }
    }
}

/// Result of handing one message to the consensus engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusOutcome {
    /// Highest index known to be committed.
    pub commit_index: i64,
    /// The node has fallen so far behind that the entries it needs are
    /// gone from the leader's log; only a full snapshot can catch it up.
    pub needs_fresh_snapshot: bool,
}

impl ConsensusOutcome {
    pub fn committed(commit_index: i64) -> Self {
        Self {
            commit_index,
            needs_fresh_snapshot: false,
        }
    }

    pub fn snapshot_needed(commit_index: i64) -> Self {
        Self {
            commit_index,
            needs_fresh_snapshot: true,
        }
    }
}

/// Consensus collaborator.
pub trait ConsensusEngine: Send + Sync {
    /// Processes one inbound message.
    fn handle(&self, message: RaftMessage) -> Result<ConsensusOutcome, ConsensusError>;

    /// Stops election and heartbeat timers; the node stops taking part in
    /// leadership and voting.
    fn stop_timers(&self);

    /// Current term.
    fn term(&self) -> u64;

    /// Index of the last entry appended to the local log.
    fn append_index(&self) -> i64;
}
