//! Persisted control values.
//!
//! Each kind lives in its own directory under the cluster state directory
//! and is stored through [`DurableStateStorage`](orbweave_persistence::DurableStateStorage),
//! except the two write-once identities which use
//! [`SimpleStorage`](orbweave_persistence::SimpleStorage).

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read};

use orbweave_persistence::format::{self, FormatError};
use orbweave_persistence::{DurableState, Marshal};

use crate::ids::{read_uuid, write_uuid};
use crate::MemberId;

/// The kinds of control state kept in a cluster state directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    MemberId,
    ClusterId,
    LastFlushed,
    LockToken,
    IdAllocation,
    SessionTracker,
    Membership,
    Term,
    Vote,
}

impl StateKind {
    /// Every kind, in the order the dump utility prints them.
    pub const ALL: [StateKind; 9] = [
        StateKind::MemberId,
        StateKind::ClusterId,
        StateKind::LastFlushed,
        StateKind::LockToken,
        StateKind::IdAllocation,
        StateKind::SessionTracker,
        StateKind::Membership,
        StateKind::Term,
        StateKind::Vote,
    ];

    /// Name used for the state directory and file names.
    pub fn name(self) -> &'static str {
        match self {
            StateKind::MemberId => "member-id",
            StateKind::ClusterId => "cluster-id",
            StateKind::LastFlushed => "last-flushed",
            StateKind::LockToken => "lock-token",
            StateKind::IdAllocation => "id-allocation",
            StateKind::SessionTracker => "session-tracker",
            StateKind::Membership => "membership",
            StateKind::Term => "term",
            StateKind::Vote => "vote",
        }
    }

    /// True for the write-once identities stored in a single file.
    pub fn is_simple(self) -> bool {
        matches!(self, StateKind::MemberId | StateKind::ClusterId)
    }
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Highest log index whose effects have been applied and flushed.
///
/// `-1` means nothing has been applied yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastFlushedState {
    pub index: i64,
}

impl Marshal for LastFlushedState {
    fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        format::write_i64(buf, self.index)
    }

    fn decode(r: &mut impl Read) -> Result<Self, FormatError> {
        Ok(Self {
            index: format::read_i64(r)?,
        })
    }
}

impl DurableState for LastFlushedState {
    fn start_state() -> Self {
        Self { index: -1 }
    }

    fn ordinal(&self) -> i64 {
        self.index
    }
}

/// Current raft term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermState {
    pub term: u64,
}

impl Marshal for TermState {
    fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        format::write_u64(buf, self.term)
    }

    fn decode(r: &mut impl Read) -> Result<Self, FormatError> {
        Ok(Self {
            term: format::read_u64(r)?,
        })
    }
}

impl DurableState for TermState {
    fn start_state() -> Self {
        Self { term: 0 }
    }

    fn ordinal(&self) -> i64 {
        ordinal_of_term(self.term)
    }
}

/// Vote cast in a term, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteState {
    pub term: u64,
    pub voted_for: Option<MemberId>,
}

impl Marshal for VoteState {
    fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        format::write_u64(buf, self.term)?;
        write_optional_member(buf, self.voted_for.as_ref())
    }

    fn decode(r: &mut impl Read) -> Result<Self, FormatError> {
        let term = format::read_u64(r)?;
        let voted_for = read_optional_member(r)?;
        Ok(Self { term, voted_for })
    }
}

impl DurableState for VoteState {
    fn start_state() -> Self {
        Self {
            term: 0,
            voted_for: None,
        }
    }

    fn ordinal(&self) -> i64 {
        ordinal_of_term(self.term)
    }
}

/// First unallocated id per id type, as of a log index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdAllocationState {
    pub log_index: i64,
    pub first_unallocated: BTreeMap<String, i64>,
}

impl Marshal for IdAllocationState {
    fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        format::write_i64(buf, self.log_index)?;
        format::write_len(buf, self.first_unallocated.len())?;
        for (id_type, next) in &self.first_unallocated {
            format::write_bytes(buf, id_type.as_bytes())?;
            format::write_i64(buf, *next)?;
        }
        Ok(())
    }

    fn decode(r: &mut impl Read) -> Result<Self, FormatError> {
        let log_index = format::read_i64(r)?;
        let count = format::read_len(r)?;
        let mut first_unallocated = BTreeMap::new();
        for _ in 0..count {
            let id_type = format::read_string(r)?;
            let next = format::read_i64(r)?;
            first_unallocated.insert(id_type, next);
        }
        Ok(Self {
            log_index,
            first_unallocated,
        })
    }
}

impl DurableState for IdAllocationState {
    fn start_state() -> Self {
        Self {
            log_index: -1,
            first_unallocated: BTreeMap::new(),
        }
    }

    fn ordinal(&self) -> i64 {
        self.log_index
    }
}

/// Holder of the cluster-wide lock token, as of a log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTokenState {
    pub log_index: i64,
    pub owner: Option<MemberId>,
    pub token_id: i32,
}

impl Marshal for LockTokenState {
    fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        format::write_i64(buf, self.log_index)?;
        write_optional_member(buf, self.owner.as_ref())?;
        format::write_i32(buf, self.token_id)
    }

    fn decode(r: &mut impl Read) -> Result<Self, FormatError> {
        let log_index = format::read_i64(r)?;
        let owner = read_optional_member(r)?;
        let token_id = format::read_i32(r)?;
        Ok(Self {
            log_index,
            owner,
            token_id,
        })
    }
}

impl DurableState for LockTokenState {
    fn start_state() -> Self {
        Self {
            log_index: -1,
            owner: None,
            token_id: -1,
        }
    }

    fn ordinal(&self) -> i64 {
        self.log_index
    }
}

/// Highest operation sequence seen per session owner, as of a log index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTrackerState {
    pub log_index: i64,
    pub sessions: BTreeMap<MemberId, i64>,
}

impl Marshal for SessionTrackerState {
    fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        format::write_i64(buf, self.log_index)?;
        format::write_len(buf, self.sessions.len())?;
        for (owner, sequence) in &self.sessions {
            write_uuid(buf, &owner.0);
            format::write_i64(buf, *sequence)?;
        }
        Ok(())
    }

    fn decode(r: &mut impl Read) -> Result<Self, FormatError> {
        let log_index = format::read_i64(r)?;
        let count = format::read_len(r)?;
        let mut sessions = BTreeMap::new();
        for _ in 0..count {
            let owner = MemberId(read_uuid(r)?);
            sessions.insert(owner, format::read_i64(r)?);
        }
        Ok(Self {
            log_index,
            sessions,
        })
    }
}

impl DurableState for SessionTrackerState {
    fn start_state() -> Self {
        Self {
            log_index: -1,
            sessions: BTreeMap::new(),
        }
    }

    fn ordinal(&self) -> i64 {
        self.log_index
    }
}

/// Committed raft membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipState {
    pub ordinal: i64,
    pub members: BTreeSet<MemberId>,
}

impl Marshal for MembershipState {
    fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        format::write_i64(buf, self.ordinal)?;
        format::write_len(buf, self.members.len())?;
        for member in &self.members {
            write_uuid(buf, &member.0);
        }
        Ok(())
    }

    fn decode(r: &mut impl Read) -> Result<Self, FormatError> {
        let ordinal = format::read_i64(r)?;
        let count = format::read_len(r)?;
        let mut members = BTreeSet::new();
        for _ in 0..count {
            members.insert(MemberId(read_uuid(r)?));
        }
        Ok(Self { ordinal, members })
    }
}

impl DurableState for MembershipState {
    fn start_state() -> Self {
        Self {
            ordinal: -1,
            members: BTreeSet::new(),
        }
    }

    fn ordinal(&self) -> i64 {
        self.ordinal
    }
}

/// Terms are unsigned; anything past `i64::MAX` saturates.
fn ordinal_of_term(term: u64) -> i64 {
    i64::try_from(term).unwrap_or(i64::MAX)
}

fn write_optional_member(buf: &mut Vec<u8>, member: Option<&MemberId>) -> io::Result<()> {
    match member {
        Some(id) => {
            format::write_u8(buf, 1)?;
            write_uuid(buf, &id.0);
        }
        None => format::write_u8(buf, 0)?,
    }
    Ok(())
}

fn read_optional_member(r: &mut impl Read) -> Result<Option<MemberId>, FormatError> {
    match format::read_u8(r)? {
        0 => Ok(None),
        1 => Ok(Some(MemberId(read_uuid(r)?))),
        other => Err(FormatError::InvalidData(format!(
            "invalid presence flag {other}"
        ))),
    }
}
