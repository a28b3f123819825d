//! Core types used throughout the consensus layer

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a member within the fixed membership list
///
/// The same identity doubles as the transport address of the member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for NodeId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Election term number
///
/// Terms are used to detect stale leaders and ensure safety.
/// Each time a node starts an election, it increments its term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Term(pub u64);

impl Term {
    pub fn increment(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index into the replicated log. The first entry has index 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn increment(&mut self) {
        self.0 += 1;
    }

    /// The preceding index, saturating at zero
    pub fn prev(self) -> LogIndex {
        LogIndex(self.0.saturating_sub(1))
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u64> for LogIndex {
    type Output = LogIndex;

    fn add(self, rhs: u64) -> Self::Output {
        LogIndex(self.0 + rhs)
    }
}

impl std::ops::Sub<u64> for LogIndex {
    type Output = LogIndex;

    fn sub(self, rhs: u64) -> Self::Output {
        LogIndex(self.0.saturating_sub(rhs))
    }
}

/// What an entry carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A client command, delivered to the state machine when applied
    Command,
    /// Appended by a freshly elected leader; never reaches the state machine
    Noop,
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// The term when this entry was created
    pub term: Term,

    /// The log index for this entry
    pub index: LogIndex,

    pub kind: EntryKind,

    /// Opaque command payload
    pub command: Bytes,
}

impl Entry {
    pub fn new(term: Term, index: LogIndex, command: impl Into<Bytes>) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Command,
            command: command.into(),
        }
    }

    pub fn noop(term: Term, index: LogIndex) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Noop,
            command: Bytes::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.kind == EntryKind::Noop
    }
}

/// Durable vote record
///
/// Must be persisted before the node acts on it, so a restarted node never
/// votes twice in the same term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// Latest term this server has seen
    pub current_term: Term,

    /// Candidate that received our vote in `current_term`
    pub voted_for: Option<NodeId>,
}

/// Snapshot metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Index of the last entry included in the snapshot
    pub last_included_index: LogIndex,

    /// Term of the last entry included in the snapshot
    pub last_included_term: Term,

    /// Membership at the time of the snapshot
    pub configuration: Vec<NodeId>,
}

/// A complete snapshot of the state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Bytes,
}
