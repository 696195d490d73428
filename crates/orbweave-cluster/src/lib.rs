//! orbweave-cluster: node-local control of a replicated graph database.
//!
//! This crate sits between the consensus engine and the local database.
//! It doesn't implement consensus, discovery or storage itself; those are
//! collaborators behind traits. What it does:
//!
//! - **Binding**: agree on a single cluster id before trusting replicated data
//! - **Outcome handling**: apply committed commands or fetch a full snapshot
//! - **Durable control state**: term, vote, flushed index and friends, stored
//!   through `orbweave-persistence` so they survive a crash mid-write
//! - **Background application**: a cancellable single-worker applier keeps
//!   slow command application off the consensus thread
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use orbweave_cluster::{CoreConfig, CoreState, CoreStateParts};
//!
//! let core = CoreState::new(&CoreConfig::default(), parts)?;
//! core.start()?;
//! // on the consensus thread, for every inbound message:
//! core.handle(message);
//! ```

mod applier;
mod application;
mod binding;
mod config;
mod consensus;
mod core_state;
mod database;
mod error;
mod ids;
mod log;
mod snapshot;
pub mod state;
mod topology;

pub use applier::{CoreStateApplier, Status};
pub use application::{ApplicationParts, CommandApplicationProcess, StateMachine};
pub use binding::{BindingProcess, BindingService, Clock, RetryWait, SleepRetry, SystemClock};
pub use config::{ConfigError, CoreConfig};
pub use consensus::{ConsensusEngine, ConsensusOutcome, RaftMessage};
pub use core_state::{CoreState, CoreStateParts, Lifecycle};
pub use database::LocalDatabase;
pub use error::{
    ApplicationError, BindingError, ConsensusError, CoreStateError, DatabaseError, LogError,
    SnapshotError, StateMachineError,
};
pub use ids::{load_or_create_member_id, ClusterId, MemberId};
pub use log::{
    InFlightCache, InFlightLogEntryReader, InMemoryRaftLog, LogCursor, LogEntry, RaftLog,
};
pub use snapshot::{CoreSnapshot, CoreStateKind, SnapshotDownloader};
pub use state::StateKind;
pub use topology::{ClusterTopology, TopologyService};
