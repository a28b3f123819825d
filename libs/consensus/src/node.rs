//! Core Raft node implementation
//!
//! A [`RaftNode`] is a handle to a spawned event loop. The loop is the only
//! writer of the node's protocol state: client commands, transport deliveries
//! and both timers are serialized through one `tokio::select!`.

use crate::apply::{ApplyPipeline, Completion, RemoteResult, StateMachine};
use crate::config::RaftConfig;
use crate::election::Election;
use crate::log::RaftLog;
use crate::redirect::{Redirector, ResultSender};
use crate::replication::{
    build_append_request, build_compacted_heartbeat, next_index_after_mismatch, MatchOutcome,
    RaftReplication, Replication,
};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, ForwardFailure, ForwardRequest, ForwardResponse,
    RaftMessage,
};
use crate::state::{NodeState, RaftRole};
use crate::transport::{Envelope, Inbox, Transport};
use crate::types::{EntryKind, LogIndex, NodeId, Term};
use crate::{RaftError, Result};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Commands sent to the Raft node
enum RaftCommand {
    /// Propose a new command; redirected to the leader on other nodes
    Propose {
        command: Bytes,
        response: ResultSender,
    },

    /// Start the election timer
    StartElectionTimer,
}

/// Snapshot of a node's state, refreshed after every event the node handles
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RaftRole,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
}

impl NodeStatus {
    fn capture(state: &NodeState, log: &RaftLog) -> Self {
        Self {
            id: state.id.clone(),
            role: state.role,
            term: state.current_term(),
            leader: state.leader_id.clone(),
            commit_index: state.volatile.commit_index,
            last_applied: state.volatile.last_applied,
            last_log_index: log.last_index(),
        }
    }
}

/// Handle to a running Raft node
pub struct RaftNode {
    id: NodeId,
    command_tx: mpsc::UnboundedSender<RaftCommand>,
    status: Arc<RwLock<NodeStatus>>,
    no_elections: Arc<AtomicBool>,
    log: RaftLog,
    request_timeout: Duration,
    shutdown: CancellationToken,
    stopped: CancellationToken,
}

impl RaftNode {
    /// Create a node and spawn its event loop on the current tokio runtime
    pub fn new<SM: StateMachine>(
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
        state_machine: SM,
    ) -> Result<Self> {
        Self::with_replication(config, transport, inbox, state_machine, RaftReplication)
    }

    /// Like [`RaftNode::new`], with a specialized replication component
    pub fn with_replication<SM: StateMachine, R: Replication>(
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
        state_machine: SM,
        replication: R,
    ) -> Result<Self> {
        config.validate()?;
        let log = RaftLog::open(&config)?;
        Self::with_log(config, transport, inbox, state_machine, replication, log)
    }

    /// Start on an already opened log, ignoring `config.log`
    pub fn with_log<SM: StateMachine, R: Replication>(
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
        state_machine: SM,
        replication: R,
        log: RaftLog,
    ) -> Result<Self> {
        config.validate()?;
        if *transport.local_id() != config.raft_id {
            return Err(RaftError::Config(format!(
                "transport address ({}) does not match raft_id ({})",
                transport.local_id(),
                config.raft_id
            )));
        }

        let election = Election::new(config.election.clone())?;

        let mut state = NodeState::new(config.raft_id.clone(), config.members.clone());
        state.hard = log.hard_state();
        state.volatile.commit_index = log.commit_index();

        let mut apply = ApplyPipeline::new(
            state_machine,
            config.snapshot_threshold,
            config.snapshot_trailing_logs,
        );
        apply.restore(&log, &mut state);

        info!(
            node = %state.id,
            term = %state.current_term(),
            commit_index = %state.volatile.commit_index,
            last_log_index = %log.last_index(),
            members = ?state.members,
            "Starting node"
        );

        let status = Arc::new(RwLock::new(NodeStatus::capture(&state, &log)));
        let no_elections = election.no_elections_flag();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let stopped = CancellationToken::new();
        let request_timeout = config.request_timeout;
        let id = config.raft_id.clone();

        let inner = RaftNodeInner {
            config,
            state,
            log: log.clone(),
            election,
            replication: Box::new(replication),
            apply,
            redirector: Redirector::new(),
            transport,
            status: Arc::clone(&status),
            compacted_warned: HashMap::new(),
        };

        tokio::spawn(run_node(
            inner,
            command_rx,
            inbox,
            shutdown.clone(),
            stopped.clone(),
        ));

        Ok(RaftNode {
            id,
            command_tx,
            status,
            no_elections,
            log,
            request_timeout,
            shutdown,
            stopped,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Propose a command to the cluster, waiting up to the configured request timeout
    ///
    /// On success, returns the result of applying the command to the state machine.
    pub async fn propose(&self, command: impl Into<Bytes>) -> Result<Bytes> {
        self.propose_timeout(command, self.request_timeout).await
    }

    /// Propose a command, waiting at most `timeout` for it to be applied
    ///
    /// A timeout only releases the caller: the entry stays in the log and may
    /// still be committed and applied later.
    pub async fn propose_timeout(&self, command: impl Into<Bytes>, timeout: Duration) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Propose {
                command: command.into(),
                response: tx,
            })
            .map_err(|_| RaftError::ShuttingDown)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(result) => result.map_err(|_| RaftError::ShuttingDown)?,
            Err(_) => Err(RaftError::Timeout(timeout)),
        }
    }

    pub fn status(&self) -> NodeStatus {
        self.status.read().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status.read().role == RaftRole::Leader
    }

    /// The leader as currently known to this node
    pub fn leader(&self) -> Option<NodeId> {
        self.status.read().leader.clone()
    }

    pub fn term(&self) -> Term {
        self.status.read().term
    }

    pub fn role(&self) -> RaftRole {
        self.status.read().role
    }

    pub fn no_elections(&self) -> bool {
        self.no_elections.load(Ordering::Acquire)
    }

    /// Enable or disable elections at runtime
    ///
    /// Disabling stops the next election timeout from starting an election.
    pub fn set_no_elections(&self, flag: bool) {
        self.no_elections.store(flag, Ordering::Release);
    }

    /// Clear `no_elections` and start the election timer
    pub fn start_elections(&self) {
        self.set_no_elections(false);
        self.start_election_timer();
    }

    pub(crate) fn start_election_timer(&self) {
        let _ = self.command_tx.send(RaftCommand::StartElectionTimer);
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    /// Discard the persisted log; meant for environment teardown
    pub fn delete_log(&self) -> Result<()> {
        self.log.delete()
    }

    pub fn delete_snapshot(&self) -> Result<()> {
        self.log.delete_snapshot()
    }

    /// Stop the event loop and wait until it has exited
    ///
    /// Callers still waiting for results fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.stopped.cancelled().await;
    }
}

/// Inner state of a Raft node, owned by its event loop
struct RaftNodeInner<SM> {
    config: RaftConfig,
    state: NodeState,
    log: RaftLog,
    election: Election,
    replication: Box<dyn Replication>,
    apply: ApplyPipeline<SM>,
    redirector: Redirector,
    transport: Arc<dyn Transport>,
    status: Arc<RwLock<NodeStatus>>,
    /// Term in which each follower was last reported as needing compacted entries
    compacted_warned: HashMap<NodeId, Term>,
}

impl<SM: StateMachine> RaftNodeInner<SM> {
    fn publish_status(&self) {
        *self.status.write() = NodeStatus::capture(&self.state, &self.log);
    }

    /// Send a message to one member; delivery failures are left to retries
    fn send(&self, to: &NodeId, message: RaftMessage) -> Result<()> {
        let kind = message.kind();
        if let Err(e) = self.transport.send(to, message.encode()?) {
            trace!(node = %self.state.id, %to, kind, error = %e, "Send failed");
        }
        Ok(())
    }

    fn handle_command(&mut self, cmd: RaftCommand) -> Result<()> {
        match cmd {
            RaftCommand::Propose { command, response } => {
                if !self.state.is_leader() {
                    self.redirector.forward(
                        self.transport.as_ref(),
                        self.state.leader_id.as_ref(),
                        command,
                        response,
                    );
                    return Ok(());
                }
                self.append_command(command, Completion::Local(response))
            }
            RaftCommand::StartElectionTimer => {
                self.election.start_election_timer();
                Ok(())
            }
        }
    }

    /// Leader: append a client command and start replicating it
    fn append_command(&mut self, command: Bytes, completion: Completion) -> Result<()> {
        let term = self.state.current_term();
        let entry = match self
            .replication
            .append(&self.log, term, EntryKind::Command, command)
        {
            Ok(entry) => entry,
            Err(e) => {
                match completion {
                    Completion::Local(tx) => {
                        let _ = tx.send(Err(RaftError::Internal(format!("append failed: {}", e))));
                    }
                    Completion::Remote { to, request_id } => {
                        self.send(
                            &to,
                            RaftMessage::ForwardResponse(ForwardResponse {
                                request_id,
                                result: Err(ForwardFailure::from(&e)),
                            }),
                        )?;
                    }
                }
                return Err(e);
            }
        };

        debug!(node = %self.state.id, index = %entry.index, %term, "Appended client command");
        if let Some(done) = self.apply.register(entry.index, entry.term, completion) {
            self.send_forward_result(done)?;
        }
        self.replicate_all()?;
        self.advance_commit()
    }

    fn handle_envelope(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope { from, payload } = envelope;
        if !self.state.members.contains(&from) {
            trace!(node = %self.state.id, %from, "Ignoring message from non-member");
            return Ok(());
        }

        let message = match RaftMessage::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(node = %self.state.id, %from, error = %e, "Dropping undecodable message");
                return Ok(());
            }
        };
        trace!(node = %self.state.id, %from, kind = message.kind(), "Received message");

        match message {
            RaftMessage::RequestVote(req) => {
                let resp = self
                    .election
                    .handle_vote_request(&mut self.state, &self.log, &req)?;
                self.send(&from, RaftMessage::RequestVoteResponse(resp))
            }
            RaftMessage::RequestVoteResponse(resp) => {
                let quorum = self.config.quorum();
                if self
                    .election
                    .handle_vote_response(&mut self.state, &self.log, &from, &resp, quorum)?
                {
                    self.on_election_won()?;
                }
                Ok(())
            }
            RaftMessage::AppendEntries(req) => self.handle_append_entries(&from, req),
            RaftMessage::AppendEntriesResponse(resp) => self.handle_append_response(&from, resp),
            RaftMessage::Forward(req) => self.handle_forward(&from, req),
            RaftMessage::ForwardResponse(resp) => {
                self.redirector.complete(resp);
                Ok(())
            }
        }
    }

    fn handle_election_timeout(&mut self) -> Result<()> {
        let req = match self.election.on_timeout(&mut self.state, &self.log)? {
            Some(req) => req,
            None => return Ok(()),
        };

        if self.election.has_won(&self.state, self.config.quorum()) {
            return self.on_election_won();
        }
        self.transport
            .broadcast(RaftMessage::RequestVote(req).encode()?)
    }

    fn on_election_won(&mut self) -> Result<()> {
        self.election.become_leader(&mut self.state, &self.log);

        // Entries of earlier terms commit once this entry does
        let term = self.state.current_term();
        let noop = self
            .replication
            .append(&self.log, term, EntryKind::Noop, Bytes::new())?;
        debug!(node = %self.state.id, index = %noop.index, %term, "Appended no-op entry");

        self.replicate_all()?;
        self.advance_commit()
    }

    fn handle_heartbeat_tick(&mut self) -> Result<()> {
        self.apply.prune_abandoned();
        self.redirector.sweep();
        if self.state.is_leader() {
            self.replicate_all()?;
        }
        Ok(())
    }

    /// Leader: send every follower what it is missing, or a heartbeat
    fn replicate_all(&mut self) -> Result<()> {
        let followers: Vec<NodeId> = match self.state.leader_state.as_ref() {
            Some(leader) => leader.followers().cloned().collect(),
            None => return Ok(()),
        };
        for follower in &followers {
            self.send_append(follower)?;
        }
        Ok(())
    }

    fn send_append(&mut self, follower: &NodeId) -> Result<()> {
        let next_index = match self
            .state
            .leader_state
            .as_ref()
            .and_then(|l| l.get_next_index(follower))
        {
            Some(next_index) => next_index,
            None => return Ok(()),
        };

        match build_append_request(
            &self.log,
            self.state.current_term(),
            &self.state.id,
            next_index,
            self.state.volatile.commit_index,
            self.config.max_append_entries,
        ) {
            Ok(req) => self.send(follower, RaftMessage::AppendEntries(req)),
            Err(RaftError::SnapshotRequired(compacted)) => {
                let term = self.state.current_term();
                if self.compacted_warned.insert(follower.clone(), term) != Some(term) {
                    warn!(
                        node = %self.state.id,
                        %follower,
                        %next_index,
                        %compacted,
                        "Follower needs compacted entries, sending heartbeats only"
                    );
                }
                let heartbeat = build_compacted_heartbeat(
                    &self.log,
                    term,
                    &self.state.id,
                    self.state.volatile.commit_index,
                )?;
                self.send(follower, RaftMessage::AppendEntries(heartbeat))
            }
            Err(e) => Err(e),
        }
    }

    fn append_response(&self, success: bool, match_index: LogIndex) -> RaftMessage {
        let (last_log_index, last_log_term) = self.log.last_log_info();
        RaftMessage::AppendEntriesResponse(AppendEntriesResponse {
            term: self.state.current_term(),
            success,
            match_index,
            last_log_index,
            last_log_term,
            commit_index: self.state.volatile.commit_index,
        })
    }

    fn handle_append_entries(&mut self, from: &NodeId, req: AppendEntriesRequest) -> Result<()> {
        // Reject if term is old
        if req.term < self.state.current_term() {
            return self.send(from, self.append_response(false, LogIndex::ZERO));
        }

        self.election
            .observe_term(&mut self.state, &self.log, req.term, Some(req.leader_id.clone()))?;
        match self.state.role {
            RaftRole::Leader => {
                error!(
                    node = %self.state.id,
                    other = %req.leader_id,
                    term = %req.term,
                    "Another leader claims the current term"
                );
                return Ok(());
            }
            RaftRole::Candidate => {
                info!(node = %self.state.id, leader = %req.leader_id, "Lost election");
                self.state.become_follower(req.term, Some(req.leader_id.clone()));
            }
            RaftRole::Follower => {}
        }

        // Valid leader contact
        self.state.leader_id = Some(req.leader_id.clone());
        self.election.arm();

        match self.replication.match_check(&self.log, &req)? {
            MatchOutcome::Matched { match_index } => {
                let commit = req.leader_commit.min(match_index);
                if commit > self.state.volatile.commit_index {
                    self.state.volatile.commit_index = commit;
                    self.log.set_commit_index(commit)?;
                    self.apply_committed()?;
                }
                self.send(from, self.append_response(true, match_index))
            }
            MatchOutcome::Mismatch => {
                debug!(
                    node = %self.state.id,
                    prev_log_index = %req.prev_log_index,
                    prev_log_term = %req.prev_log_term,
                    "Log does not match leader's"
                );
                self.send(from, self.append_response(false, LogIndex::ZERO))
            }
        }
    }

    fn handle_append_response(&mut self, from: &NodeId, resp: AppendEntriesResponse) -> Result<()> {
        if self
            .election
            .observe_term(&mut self.state, &self.log, resp.term, None)?
        {
            return Ok(());
        }
        if !self.state.is_leader() || resp.term != self.state.current_term() {
            return Ok(());
        }

        let last_index = self.log.last_index();
        let resend = match self.state.leader_state.as_mut() {
            Some(leader) if resp.success => {
                leader.acknowledge(from, resp.match_index);
                leader
                    .get_next_index(from)
                    .map(|next| next <= last_index)
                    .unwrap_or(false)
            }
            Some(leader) => match leader.get_next_index(from) {
                Some(next) => {
                    let next = next_index_after_mismatch(next, &resp);
                    leader.set_next_index(from, next);
                    // Below the compaction point only heartbeat ticks reach it
                    next >= self.log.first_index()
                }
                None => false,
            },
            None => return Ok(()),
        };

        if resp.success {
            self.advance_commit()?;
        }
        if resend {
            self.send_append(from)?;
        }
        Ok(())
    }

    fn handle_forward(&mut self, from: &NodeId, req: ForwardRequest) -> Result<()> {
        if !self.state.is_leader() {
            let failure = ForwardFailure::NotLeader(self.state.leader_id.clone());
            return self.send(
                from,
                RaftMessage::ForwardResponse(ForwardResponse {
                    request_id: req.request_id,
                    result: Err(failure),
                }),
            );
        }

        self.append_command(
            req.command,
            Completion::Remote {
                to: from.clone(),
                request_id: req.request_id,
            },
        )
    }

    /// Leader: advance the commit index if a quorum stores a newer entry
    fn advance_commit(&mut self) -> Result<()> {
        let progress = match self.state.leader_state.as_ref() {
            Some(progress) => progress,
            None => return Ok(()),
        };
        let committed = self.replication.commit_advance(
            &self.log,
            self.state.hard.current_term,
            progress,
            self.state.volatile.commit_index,
            self.config.quorum(),
        )?;

        if let Some(index) = committed {
            debug!(node = %self.state.id, commit_index = %index, "Advanced commit index");
            self.state.volatile.commit_index = index;
            self.log.set_commit_index(index)?;
            self.apply_committed()?;
        }
        Ok(())
    }

    fn apply_committed(&mut self) -> Result<()> {
        let remote =
            self.apply
                .apply_committed(&self.log, &mut self.state, self.replication.as_mut())?;
        for done in remote {
            self.send_forward_result(done)?;
        }
        Ok(())
    }

    fn send_forward_result(&self, done: RemoteResult) -> Result<()> {
        self.send(
            &done.to,
            RaftMessage::ForwardResponse(ForwardResponse {
                request_id: done.request_id,
                result: done.result.map_err(|e| ForwardFailure::from(&e)),
            }),
        )
    }

    fn stop(&mut self) {
        self.apply.fail_all();
        self.redirector.fail_all();
        self.publish_status();
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Main node event loop
async fn run_node<SM: StateMachine>(
    mut inner: RaftNodeInner<SM>,
    mut command_rx: mpsc::UnboundedReceiver<RaftCommand>,
    inbox: Inbox,
    shutdown: CancellationToken,
    stopped: CancellationToken,
) {
    let id = inner.state.id.clone();

    inner.election.start_election_timer();
    if let Err(e) = inner.apply_committed() {
        error!(node = %id, error = %e, "Failed to apply committed entries at startup");
    }
    inner.publish_status();

    let mut heartbeat_timer = interval(inner.election.heartbeat_interval());
    heartbeat_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = inner.election.deadline();

        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(node = %id, "Node shutting down");
                break;
            }

            // Handle client commands
            cmd = command_rx.recv() => match cmd {
                Some(cmd) => inner.handle_command(cmd),
                None => {
                    debug!(node = %id, "All handles dropped");
                    break;
                }
            },

            // Handle protocol messages
            envelope = inbox.recv() => match envelope {
                Ok(envelope) => inner.handle_envelope(envelope),
                Err(_) => {
                    info!(node = %id, "Left the group");
                    break;
                }
            },

            _ = sleep_until_deadline(deadline) => inner.handle_election_timeout(),

            _ = heartbeat_timer.tick() => inner.handle_heartbeat_tick(),
        };

        if let Err(e) = result {
            if e.is_fatal() {
                error!(node = %id, error = %e, "Storage failure, stopping node");
                break;
            }
            warn!(node = %id, error = %e, "Failed to handle event");
        }
        inner.publish_status();
    }

    inner.stop();
    stopped.cancel();
}
