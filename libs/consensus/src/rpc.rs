//! Protocol messages exchanged between members

use crate::types::{Entry, LogIndex, NodeId, Term};
use crate::{RaftError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// RequestVote - sent by candidates to gather votes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting vote
    pub candidate_id: NodeId,

    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for candidate to update itself
    pub term: Term,

    /// True if candidate received vote
    pub vote_granted: bool,
}

/// AppendEntries - sent by leader to replicate log and provide heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// So follower can redirect clients
    pub leader_id: NodeId,

    /// Index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,

    /// Term of prev_log_index entry
    pub prev_log_term: Term,

    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<Entry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Create a heartbeat message (no entries)
    pub fn heartbeat(
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        leader_commit: LogIndex,
    ) -> Self {
        Self {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries: vec![],
            leader_commit,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry carried, or the preceding index for heartbeats
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.prev_log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for leader to update itself
    pub term: Term,

    /// True if follower contained entry matching prev_log_index and prev_log_term
    pub success: bool,

    /// On success, the highest index known to match the leader's log
    pub match_index: LogIndex,

    /// The follower's last log position, used by the leader to pick an
    /// earlier starting point after a mismatch
    pub last_log_index: LogIndex,
    pub last_log_term: Term,

    /// The follower's current commit index (for monitoring)
    pub commit_index: LogIndex,
}

/// A client write forwarded by a non-leader to the leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRequest {
    /// Correlates the response with the waiting caller on the forwarding node
    pub request_id: u64,
    pub command: Bytes,
}

/// Why a forwarded write did not produce a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardFailure {
    NotLeader(Option<NodeId>),
    EntryOverwritten(LogIndex),
    Failed(String),
}

impl From<ForwardFailure> for RaftError {
    fn from(failure: ForwardFailure) -> Self {
        match failure {
            ForwardFailure::NotLeader(Some(leader)) => RaftError::NotLeader(Some(leader)),
            ForwardFailure::NotLeader(None) => RaftError::NoLeader,
            ForwardFailure::EntryOverwritten(index) => RaftError::EntryOverwritten(index),
            ForwardFailure::Failed(reason) => RaftError::Rpc(reason),
        }
    }
}

impl From<&RaftError> for ForwardFailure {
    fn from(err: &RaftError) -> Self {
        match err {
            RaftError::NotLeader(leader) => ForwardFailure::NotLeader(leader.clone()),
            RaftError::NoLeader => ForwardFailure::NotLeader(None),
            RaftError::EntryOverwritten(index) => ForwardFailure::EntryOverwritten(*index),
            other => ForwardFailure::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub request_id: u64,
    pub result: std::result::Result<Bytes, ForwardFailure>,
}

/// Everything a member sends to another member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    Forward(ForwardRequest),
    ForwardResponse(ForwardResponse),
}

impl RaftMessage {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(payload)?)
    }

    /// Term carried by protocol messages; forwarded writes carry none
    pub fn term(&self) -> Option<Term> {
        match self {
            RaftMessage::RequestVote(req) => Some(req.term),
            RaftMessage::RequestVoteResponse(resp) => Some(resp.term),
            RaftMessage::AppendEntries(req) => Some(req.term),
            RaftMessage::AppendEntriesResponse(resp) => Some(resp.term),
            RaftMessage::Forward(_) | RaftMessage::ForwardResponse(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote(_) => "request_vote",
            RaftMessage::RequestVoteResponse(_) => "request_vote_response",
            RaftMessage::AppendEntries(_) => "append_entries",
            RaftMessage::AppendEntriesResponse(_) => "append_entries_response",
            RaftMessage::Forward(_) => "forward",
            RaftMessage::ForwardResponse(_) => "forward_response",
        }
    }
}
