//! Log replication
//!
//! [`Replication`] is the seam where a node's replication behavior can be
//! specialized. The provided methods implement the standard algorithm, so a
//! variant only overrides what it extends and delegates the rest.

use crate::log::RaftLog;
use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse};
use crate::state::LeaderState;
use crate::types::{Entry, EntryKind, LogIndex, NodeId, Term};
use crate::{RaftError, Result};
use bytes::Bytes;
use tracing::debug;

/// Result of checking an append-entries request against the local log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The log now agrees with the leader's up to `match_index`
    Matched { match_index: LogIndex },
    /// No entry at the preceding index with the preceding term
    Mismatch,
}

/// Capabilities a replication component provides to the node
pub trait Replication: Send + 'static {
    /// Leader: append a new entry of `term` at the end of the local log
    fn append(&mut self, log: &RaftLog, term: Term, kind: EntryKind, command: Bytes) -> Result<Entry> {
        log.append_next(term, kind, command)
    }

    /// Follower: run the log-matching check and store the carried entries
    fn match_check(&mut self, log: &RaftLog, req: &AppendEntriesRequest) -> Result<MatchOutcome> {
        match_and_append(log, req)
    }

    /// Leader: the new commit index, if a quorum stores a newer entry of `term`
    fn commit_advance(
        &mut self,
        log: &RaftLog,
        term: Term,
        progress: &LeaderState,
        commit_index: LogIndex,
        quorum: usize,
    ) -> Result<Option<LogIndex>> {
        quorum_commit_index(log, term, progress, commit_index, quorum)
    }

    /// Called after an entry has been applied to the state machine
    fn apply_callback(&mut self, _entry: &Entry, _output: &[u8]) {}
}

/// The standard replication component
#[derive(Debug, Default, Clone, Copy)]
pub struct RaftReplication;

impl Replication for RaftReplication {}

/// Check `req` against the log and append its entries
///
/// An existing entry with the same index but a different term is a conflict:
/// it and everything after it are discarded before the leader's entries are
/// appended. Entries already present with the same term are left alone, so
/// duplicated or reordered retransmissions are harmless.
pub fn match_and_append(log: &RaftLog, req: &AppendEntriesRequest) -> Result<MatchOutcome> {
    let first_index = log.first_index();

    // Entries below the first retained one were compacted, hence committed,
    // hence identical to the leader's
    if req.prev_log_index >= first_index.prev() {
        match log.get_term(req.prev_log_index)? {
            Some(term) if term == req.prev_log_term => {}
            _ => return Ok(MatchOutcome::Mismatch),
        }
    }

    let mut pending = req
        .entries
        .iter()
        .filter(|e| e.index >= first_index)
        .peekable();

    while let Some(entry) = pending.peek() {
        match log.get_term(entry.index)? {
            Some(term) if term == entry.term => {
                pending.next();
            }
            Some(term) => {
                debug!(
                    index = %entry.index,
                    existing_term = %term,
                    leader_term = %entry.term,
                    "Truncating conflicting suffix"
                );
                log.truncate_from(entry.index)?;
                break;
            }
            None => break,
        }
    }

    let rest: Vec<Entry> = pending.cloned().collect();
    if !rest.is_empty() {
        log.append(rest)?;
    }

    Ok(MatchOutcome::Matched {
        match_index: req.last_index(),
    })
}

/// Highest index stored on a quorum (leader included), if it is newer than
/// `commit_index` and belongs to `term`
///
/// Entries of earlier terms are never committed by counting replicas; they
/// become committed when a later entry of the current term does.
pub fn quorum_commit_index(
    log: &RaftLog,
    term: Term,
    progress: &LeaderState,
    commit_index: LogIndex,
    quorum: usize,
) -> Result<Option<LogIndex>> {
    let mut indices: Vec<LogIndex> = progress.match_indices().collect();
    indices.push(log.last_index());
    indices.sort_unstable_by(|a, b| b.cmp(a));

    let candidate = match quorum.checked_sub(1).and_then(|i| indices.get(i)) {
        Some(index) => *index,
        None => return Ok(None),
    };
    if candidate <= commit_index {
        return Ok(None);
    }

    match log.get_term(candidate)? {
        Some(t) if t == term => Ok(Some(candidate)),
        _ => Ok(None),
    }
}

/// Build the append-entries request for a follower whose next index is `next_index`
///
/// Fails with [`RaftError::SnapshotRequired`] if the entries the follower
/// needs were compacted away.
pub fn build_append_request(
    log: &RaftLog,
    term: Term,
    leader_id: &NodeId,
    next_index: LogIndex,
    leader_commit: LogIndex,
    max_entries: usize,
) -> Result<AppendEntriesRequest> {
    let first_index = log.first_index();
    if next_index < first_index {
        return Err(RaftError::SnapshotRequired(first_index.prev()));
    }

    let prev_log_index = next_index.prev();
    let prev_log_term = log
        .get_term(prev_log_index)?
        .ok_or(RaftError::SnapshotRequired(first_index.prev()))?;
    let entries = log.get_range(next_index, next_index + max_entries as u64)?;

    Ok(AppendEntriesRequest {
        term,
        leader_id: leader_id.clone(),
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit,
    })
}

/// Heartbeat anchored at the compaction boundary, for a follower that needs
/// compacted entries
///
/// It carries the leader's term, so the follower keeps recognizing the leader
/// instead of starting elections it cannot win.
pub fn build_compacted_heartbeat(
    log: &RaftLog,
    term: Term,
    leader_id: &NodeId,
    leader_commit: LogIndex,
) -> Result<AppendEntriesRequest> {
    let boundary = log.first_index().prev();
    let boundary_term = log
        .get_term(boundary)?
        .ok_or(RaftError::LogIndexOutOfRange(boundary))?;
    Ok(AppendEntriesRequest::heartbeat(
        term,
        leader_id.clone(),
        boundary,
        boundary_term,
        leader_commit,
    ))
}

/// Next index to try after a follower rejected the request sent at `next_index`
pub fn next_index_after_mismatch(next_index: LogIndex, resp: &AppendEntriesResponse) -> LogIndex {
    next_index
        .prev()
        .min(resp.last_log_index + 1)
        .max(LogIndex(1))
}
