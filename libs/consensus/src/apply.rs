//! Commit/apply pipeline
//!
//! Committed entries are handed to the state machine strictly in index order,
//! each exactly once. A caller waiting on an index is released only after that
//! index was applied.

use crate::log::RaftLog;
use crate::replication::Replication;
use crate::state::NodeState;
use crate::types::{LogIndex, NodeId, Snapshot, SnapshotMetadata, Term};
use crate::{RaftError, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Trait for state machines that can be replicated
///
/// Implement this trait to build a distributed application on top of the log
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a committed command to the state machine
    ///
    /// This is called in log order for all committed commands
    fn apply(&mut self, command: &[u8]) -> Vec<u8>;

    /// Create a snapshot of the current state machine state
    fn snapshot(&self) -> Vec<u8>;

    /// Restore state machine from a snapshot
    fn restore(&mut self, snapshot: &[u8]);
}

/// Where the result of an applied entry goes
pub(crate) enum Completion {
    /// A caller on this node
    Local(oneshot::Sender<Result<Bytes>>),
    /// A caller on another node that forwarded its write here
    Remote { to: NodeId, request_id: u64 },
}

struct Waiter {
    /// Term the entry was appended in; a different term at apply time means
    /// the entry was replaced by another leader's
    term: Term,
    completion: Completion,
}

/// A remote caller to notify
pub(crate) struct RemoteResult {
    pub to: NodeId,
    pub request_id: u64,
    pub result: Result<Bytes>,
}

pub(crate) struct ApplyPipeline<SM> {
    state_machine: SM,
    waiters: BTreeMap<LogIndex, Waiter>,
    snapshot_threshold: u64,
    snapshot_trailing_logs: u64,
}

impl<SM: StateMachine> ApplyPipeline<SM> {
    pub fn new(state_machine: SM, snapshot_threshold: u64, snapshot_trailing_logs: u64) -> Self {
        Self {
            state_machine,
            waiters: BTreeMap::new(),
            snapshot_threshold,
            snapshot_trailing_logs,
        }
    }

    /// Load the stored snapshot, if any, into the state machine
    pub fn restore(&mut self, log: &RaftLog, state: &mut NodeState) {
        if let Some(snapshot) = log.get_snapshot() {
            let index = snapshot.metadata.last_included_index;
            self.state_machine.restore(&snapshot.data);
            state.volatile.last_applied = index;
            state.volatile.commit_index = state.volatile.commit_index.max(index);
            info!(node = %state.id, %index, "Restored state machine from snapshot");
        }
    }

    /// Wait for the entry appended at `index` in `term`
    ///
    /// A waiter still registered at `index` belongs to an entry that was
    /// truncated away, so it fails with `EntryOverwritten`. Returns the result
    /// owed to a remote caller in that case.
    pub fn register(
        &mut self,
        index: LogIndex,
        term: Term,
        completion: Completion,
    ) -> Option<RemoteResult> {
        let replaced = self.waiters.insert(index, Waiter { term, completion })?;
        debug!(
            %index,
            old_term = %replaced.term,
            new_term = %term,
            "Replacing waiter of an overwritten entry"
        );
        let result = Err(RaftError::EntryOverwritten(index));
        match replaced.completion {
            Completion::Local(tx) => {
                let _ = tx.send(result);
                None
            }
            Completion::Remote { to, request_id } => Some(RemoteResult {
                to,
                request_id,
                result,
            }),
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }

    /// Forget local callers that stopped waiting
    pub fn prune_abandoned(&mut self) {
        self.waiters.retain(|_, w| match &w.completion {
            Completion::Local(tx) => !tx.is_closed(),
            Completion::Remote { .. } => true,
        });
    }

    /// Apply everything between `last_applied` and `commit_index`
    ///
    /// Returns the results that must be sent to remote callers.
    pub fn apply_committed(
        &mut self,
        log: &RaftLog,
        state: &mut NodeState,
        replication: &mut dyn Replication,
    ) -> Result<Vec<RemoteResult>> {
        let mut remote = Vec::new();

        while state.volatile.last_applied < state.volatile.commit_index {
            let index = state.volatile.last_applied + 1;
            let entry = log.get(index)?.ok_or_else(|| {
                RaftError::Internal(format!("committed entry {} missing from the log", index))
            })?;

            let output = if entry.is_noop() {
                Bytes::new()
            } else {
                Bytes::from(self.state_machine.apply(&entry.command))
            };
            replication.apply_callback(&entry, &output);
            state.volatile.last_applied = index;

            debug!(node = %state.id, %index, term = %entry.term, "Applied entry");

            if let Some(waiter) = self.waiters.remove(&index) {
                let result = if waiter.term == entry.term {
                    Ok(output)
                } else {
                    Err(RaftError::EntryOverwritten(index))
                };
                match waiter.completion {
                    Completion::Local(tx) => {
                        let _ = tx.send(result);
                    }
                    Completion::Remote { to, request_id } => remote.push(RemoteResult {
                        to,
                        request_id,
                        result,
                    }),
                }
            }
        }

        self.maybe_snapshot(log, state)?;
        Ok(remote)
    }

    /// Snapshot and compact once enough applied entries accumulated
    fn maybe_snapshot(&mut self, log: &RaftLog, state: &NodeState) -> Result<()> {
        if self.snapshot_threshold == 0 {
            return Ok(());
        }
        let last_applied = state.volatile.last_applied;
        let first_index = log.first_index();
        if last_applied < first_index || last_applied.0 - first_index.0 + 1 < self.snapshot_threshold {
            return Ok(());
        }

        let term = log
            .get_term(last_applied)?
            .ok_or(RaftError::LogIndexOutOfRange(last_applied))?;
        let data = self.state_machine.snapshot();
        log.set_snapshot(Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: last_applied,
                last_included_term: term,
                configuration: state.members.clone(),
            },
            data: Bytes::from(data),
        })?;

        let compact_through = last_applied - self.snapshot_trailing_logs;
        if compact_through >= first_index {
            log.compact(compact_through)?;
        }
        info!(
            node = %state.id,
            snapshot_index = %last_applied,
            %compact_through,
            "Took snapshot"
        );
        Ok(())
    }

    /// Fail every waiter, local ones with `ShuttingDown`
    pub fn fail_all(&mut self) {
        for (_, waiter) in std::mem::take(&mut self.waiters) {
            if let Completion::Local(tx) = waiter.completion {
                let _ = tx.send(Err(RaftError::ShuttingDown));
            }
        }
    }

    pub fn state_machine(&self) -> &SM {
        &self.state_machine
    }
}
