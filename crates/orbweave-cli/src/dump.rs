//! Reads every control value in a cluster state directory.
//!
//! Strictly read-only: recovery reads the state files in place without
//! writing to them, and nothing is created, truncated or rotated.

use std::fmt::Write as _;
use std::path::Path;

use colored::Colorize;
use orbweave_cluster::state::{
    IdAllocationState, LastFlushedState, LockTokenState, MembershipState, SessionTrackerState,
    TermState, VoteState,
};
use orbweave_cluster::{ClusterId, MemberId, StateKind};
use orbweave_persistence::durable::{recover, state_files};
use orbweave_persistence::{DurableState, Marshal, SimpleStorage, StateError};

/// What was found on disk for one kind of state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Value(String),
    Absent,
    Error(String),
}

/// Reads every kind of state under `state_dir`, in a fixed order.
pub fn collect(state_dir: &Path) -> Vec<(StateKind, Entry)> {
    StateKind::ALL
        .iter()
        .map(|&kind| (kind, read_kind(state_dir, kind)))
        .collect()
}

fn read_kind(dir: &Path, kind: StateKind) -> Entry {
    match kind {
        StateKind::MemberId => simple::<MemberId>(dir, kind, |id| id.0.to_string()),
        StateKind::ClusterId => simple::<ClusterId>(dir, kind, |id| id.to_string()),
        StateKind::LastFlushed => {
            durable::<LastFlushedState>(dir, kind, |s| format!("index {}", s.index))
        }
        StateKind::LockToken => durable::<LockTokenState>(dir, kind, |s| {
            let owner = s.owner.map_or_else(|| "none".to_string(), |m| m.0.to_string());
            format!("log index {}, owner {owner}, token {}", s.log_index, s.token_id)
        }),
        StateKind::IdAllocation => durable::<IdAllocationState>(dir, kind, |s| {
            let mut out = format!("log index {}", s.log_index);
            for (id_type, first) in &s.first_unallocated {
                let _ = write!(out, ", {id_type}={first}");
            }
            out
        }),
        StateKind::SessionTracker => durable::<SessionTrackerState>(dir, kind, |s| {
            format!("log index {}, {} sessions", s.log_index, s.sessions.len())
        }),
        StateKind::Membership => durable::<MembershipState>(dir, kind, |s| {
            let members: Vec<String> = s.members.iter().map(|m| m.to_string()).collect();
            format!("ordinal {}, members [{}]", s.ordinal, members.join(", "))
        }),
        StateKind::Term => durable::<TermState>(dir, kind, |s| format!("term {}", s.term)),
        StateKind::Vote => durable::<VoteState>(dir, kind, |s| match s.voted_for {
            Some(member) => format!("term {}, voted for {}", s.term, member.0),
            None => format!("term {}, no vote", s.term),
        }),
    }
}

fn simple<T: Marshal>(dir: &Path, kind: StateKind, describe: impl Fn(&T) -> String) -> Entry {
    match SimpleStorage::<T>::new(dir, kind.name()).read() {
        Ok(Some(value)) => Entry::Value(describe(&value)),
        Ok(None) => Entry::Absent,
        Err(e) => Entry::Error(e.to_string()),
    }
}

fn durable<S: DurableState>(dir: &Path, kind: StateKind, describe: impl Fn(&S) -> String) -> Entry {
    let (a, b) = state_files(dir, kind.name());
    match recover::<S>(&a, &b) {
        Ok(recovered) => Entry::Value(describe(&recovered.state)),
        Err(StateError::NothingRecovered { .. }) => Entry::Absent,
        Err(e) => Entry::Error(e.to_string()),
    }
}

/// Formats one line of dump output for the terminal.
pub fn format_entry(kind: StateKind, entry: &Entry) -> String {
    let name = format!("{:<16}", kind.name()).bold();
    match entry {
        Entry::Value(value) => format!("{name} {}", value.green()),
        Entry::Absent => format!("{name} {}", "(absent)".dimmed()),
        Entry::Error(e) => format!("{name} {} {}", "(error)".red(), e.red()),
    }
}
