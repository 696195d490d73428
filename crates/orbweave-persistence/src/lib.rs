//! orbweave-persistence: crash-safe storage for control state.
//!
//! Small values that must survive a crash at any point (raft term, vote,
//! last flushed index, id allocation windows) are kept in pairs of
//! alternating append-only files. Write-once identities use a single
//! atomically replaced file.

pub mod durable;
pub mod format;
pub mod simple;
pub mod state_log;

pub use durable::{DurableState, DurableStateStorage, RecoveredState, Side, StateError};
pub use format::{FormatError, Marshal};
pub use simple::SimpleStorage;
