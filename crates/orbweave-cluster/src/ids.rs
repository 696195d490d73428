//! Identifiers for clusters and their members.

use std::io::{self, Read};
use std::path::Path;

use orbweave_persistence::format::{self, FormatError};
use orbweave_persistence::{Marshal, SimpleStorage};
use tracing::info;
use uuid::Uuid;

use crate::state::StateKind;

/// Identity of one logical cluster instance.
///
/// Minted exactly once, by the node that bootstraps the cluster, and
/// persisted by every member that binds to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterId(pub Uuid);

impl ClusterId {
    /// Generates a new random cluster ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a cluster ID from a UUID string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for ClusterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId(pub Uuid);

impl MemberId {
    /// Generates a new random member ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a member ID from a UUID string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // first 8 chars, like a short git hash
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

pub(crate) fn write_uuid(buf: &mut Vec<u8>, id: &Uuid) {
    buf.extend_from_slice(id.as_bytes());
}

pub(crate) fn read_uuid(r: &mut impl Read) -> Result<Uuid, FormatError> {
    let mut raw = [0u8; 16];
    format::read_exact(r, &mut raw)?;
    Ok(Uuid::from_bytes(raw))
}

impl Marshal for ClusterId {
    fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        write_uuid(buf, &self.0);
        Ok(())
    }

    fn decode(r: &mut impl Read) -> Result<Self, FormatError> {
        Ok(Self(read_uuid(r)?))
    }
}

impl Marshal for MemberId {
    fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        write_uuid(buf, &self.0);
        Ok(())
    }

    fn decode(r: &mut impl Read) -> Result<Self, FormatError> {
        Ok(Self(read_uuid(r)?))
    }
}

/// Returns this node's member id, minting and storing one on first use.
pub fn load_or_create_member_id(state_dir: &Path) -> Result<MemberId, FormatError> {
    let storage = SimpleStorage::<MemberId>::new(state_dir, StateKind::MemberId.name());
    if let Some(id) = storage.read()? {
        return Ok(id);
    }
    let id = MemberId::new();
    storage.write(&id)?;
    info!(member_id = %id.0, "created new member id");
    Ok(id)
}
