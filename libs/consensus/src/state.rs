//! Node role and per-node protocol state

use crate::types::{HardState, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// The role a node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    /// Follower - accepts log entries from leader
    Follower,
    /// Candidate - attempting to become leader
    Candidate,
    /// Leader - accepts client requests and replicates log
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "Follower"),
            RaftRole::Candidate => write!(f, "Candidate"),
            RaftRole::Leader => write!(f, "Leader"),
        }
    }
}

/// Volatile state on all servers
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    /// Index of highest log entry known to be committed
    pub commit_index: LogIndex,

    /// Index of highest log entry applied to state machine
    pub last_applied: LogIndex,
}

/// Replication progress of one follower, tracked by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Index of the next log entry to send
    pub next_index: LogIndex,

    /// Highest index known to be stored on the follower
    pub match_index: LogIndex,
}

/// Volatile state on leaders (reinitialized after election)
#[derive(Debug, Clone)]
pub struct LeaderState {
    progress: HashMap<NodeId, Progress>,
}

impl LeaderState {
    pub fn new<'a>(peers: impl IntoIterator<Item = &'a NodeId>, last_log_index: LogIndex) -> Self {
        Self {
            progress: peers
                .into_iter()
                .map(|id| {
                    (
                        id.clone(),
                        Progress {
                            next_index: last_log_index + 1,
                            match_index: LogIndex::ZERO,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn get_next_index(&self, node: &NodeId) -> Option<LogIndex> {
        self.progress.get(node).map(|p| p.next_index)
    }

    pub fn set_next_index(&mut self, node: &NodeId, index: LogIndex) {
        if let Some(p) = self.progress.get_mut(node) {
            p.next_index = index.max(LogIndex(1));
        }
    }

    pub fn get_match_index(&self, node: &NodeId) -> Option<LogIndex> {
        self.progress.get(node).map(|p| p.match_index)
    }

    /// Record an acknowledgement; match indices never move backwards
    pub fn acknowledge(&mut self, node: &NodeId, match_index: LogIndex) {
        if let Some(p) = self.progress.get_mut(node) {
            p.match_index = p.match_index.max(match_index);
            p.next_index = p.next_index.max(p.match_index + 1);
        }
    }

    /// Match indices of all followers
    pub fn match_indices(&self) -> impl Iterator<Item = LogIndex> + '_ {
        self.progress.values().map(|p| p.match_index)
    }

    pub fn followers(&self) -> impl Iterator<Item = &NodeId> {
        self.progress.keys()
    }
}

/// Candidate-specific state
#[derive(Debug, Clone, Default)]
pub struct CandidateState {
    /// Nodes that granted their vote in this election, self included
    pub votes_received: HashSet<NodeId>,
}

impl CandidateState {
    pub fn new(self_id: &NodeId) -> Self {
        let mut votes_received = HashSet::new();
        votes_received.insert(self_id.clone());
        Self { votes_received }
    }

    pub fn add_vote(&mut self, node: NodeId) {
        self.votes_received.insert(node);
    }

    pub fn has_quorum(&self, quorum: usize) -> bool {
        self.votes_received.len() >= quorum
    }
}

/// Complete protocol state of one node
#[derive(Debug)]
pub struct NodeState {
    /// Current role of this node
    pub role: RaftRole,

    /// This node's ID
    pub id: NodeId,

    /// Current leader (if known)
    pub leader_id: Option<NodeId>,

    /// Term and vote; mirrored to the log before being acted upon
    pub hard: HardState,

    pub volatile: VolatileState,

    /// Leader-specific state (only valid when role == Leader)
    pub leader_state: Option<LeaderState>,

    /// Candidate-specific state (only valid when role == Candidate)
    pub candidate_state: Option<CandidateState>,

    /// All nodes in the cluster (including self)
    pub members: Vec<NodeId>,
}

impl NodeState {
    pub fn new(id: NodeId, members: Vec<NodeId>) -> Self {
        Self {
            role: RaftRole::Follower,
            id,
            leader_id: None,
            hard: HardState::default(),
            volatile: VolatileState::default(),
            leader_state: None,
            candidate_state: None,
            members,
        }
    }

    pub fn current_term(&self) -> Term {
        self.hard.current_term
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    /// Transition to follower state
    ///
    /// Adopting a newer term clears the vote cast in the old one.
    pub fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.hard.current_term {
            self.hard.current_term = term;
            self.hard.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.leader_id = leader;
        self.leader_state = None;
        self.candidate_state = None;
    }

    /// Transition to candidate state, voting for self
    ///
    /// The new term is above both the current term and `floor`, the highest
    /// term found in the local log.
    pub fn become_candidate(&mut self, floor: Term) {
        self.role = RaftRole::Candidate;
        self.hard.current_term = self.hard.current_term.max(floor);
        self.hard.current_term.increment();
        self.hard.voted_for = Some(self.id.clone());
        self.leader_id = None;
        self.candidate_state = Some(CandidateState::new(&self.id));
        self.leader_state = None;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id.clone());

        let peers: Vec<NodeId> = self.other_peers().cloned().collect();
        self.leader_state = Some(LeaderState::new(&peers, last_log_index));
        self.candidate_state = None;
    }

    /// Get other peers (excluding self)
    pub fn other_peers(&self) -> impl Iterator<Item = &NodeId> {
        self.members.iter().filter(move |p| **p != self.id)
    }
}
