//! Leader election
//!
//! The election component owns the randomized election timer and every
//! decision about terms and votes. It never touches the network: callers pass
//! in the node state and log, and send whatever it returns.

use crate::config::ElectionConfig;
use crate::log::RaftLog;
use crate::rpc::{RequestVoteRequest, RequestVoteResponse};
use crate::state::{NodeState, RaftRole};
use crate::types::{LogIndex, NodeId, Term};
use crate::Result;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Majority of a membership of `members` nodes
pub fn quorum_size(members: usize) -> usize {
    members / 2 + 1
}

/// Whether a candidate's log is at least as up to date as ours
///
/// A higher last term wins; with equal last terms the longer log wins.
pub fn is_log_up_to_date(
    candidate_last_index: LogIndex,
    candidate_last_term: Term,
    own_last_index: LogIndex,
    own_last_term: Term,
) -> bool {
    candidate_last_term > own_last_term
        || (candidate_last_term == own_last_term && candidate_last_index >= own_last_index)
}

pub struct Election {
    config: ElectionConfig,
    /// Shared with the node handle so it can be flipped while running
    no_elections: Arc<AtomicBool>,
    /// Set once the timer was started explicitly or at startup
    started: bool,
    deadline: Option<Instant>,
}

impl Election {
    /// Validate the configuration and create an idle election component
    pub fn new(config: ElectionConfig) -> Result<Self> {
        config.validate()?;
        let no_elections = Arc::new(AtomicBool::new(config.no_elections));
        Ok(Self {
            config,
            no_elections,
            started: false,
            deadline: None,
        })
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    pub fn no_elections(&self) -> bool {
        self.no_elections.load(Ordering::Acquire)
    }

    pub fn set_no_elections(&self, flag: bool) {
        self.no_elections.store(flag, Ordering::Release);
    }

    pub(crate) fn no_elections_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.no_elections)
    }

    /// When the armed timer fires, if it is armed
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Uniformly random duration in `[election_min_interval, election_max_interval]`
    pub fn random_timeout(&self) -> Duration {
        let min = self.config.election_min_interval.as_millis() as u64;
        let max = self.config.election_max_interval.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Start the election timer
    ///
    /// Used at startup and by harnesses that hold a cluster quiescent with
    /// `no_elections` and release it later. Has no effect while
    /// `no_elections` is set.
    pub(crate) fn start_election_timer(&mut self) {
        if self.no_elections() {
            debug!("Not starting election timer: elections are disabled");
            return;
        }
        self.started = true;
        self.arm();
    }

    /// Re-arm the timer with a fresh random timeout, if it was started
    pub(crate) fn arm(&mut self) {
        self.deadline = if self.started && !self.no_elections() {
            Some(Instant::now() + self.random_timeout())
        } else {
            None
        };
    }

    pub(crate) fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Persist the vote record before anything is sent that depends on it
    fn persist(state: &NodeState, log: &RaftLog) -> Result<()> {
        log.set_hard_state(&state.hard)
    }

    /// Step down if `term` is newer than ours
    ///
    /// Returns true if the node adopted `term`.
    pub(crate) fn observe_term(
        &mut self,
        state: &mut NodeState,
        log: &RaftLog,
        term: Term,
        leader: Option<NodeId>,
    ) -> Result<bool> {
        if term <= state.current_term() {
            return Ok(false);
        }

        if state.role != RaftRole::Follower {
            info!(
                node = %state.id,
                role = %state.role,
                old_term = %state.current_term(),
                new_term = %term,
                "Stepping down after observing a newer term"
            );
        }
        state.become_follower(term, leader);
        Self::persist(state, log)?;
        // A newer term alone does not restart a running timer; a former
        // leader has none and needs one
        if self.deadline.is_none() {
            self.arm();
        }
        Ok(true)
    }

    /// Election timeout: become candidate and build the vote request
    ///
    /// Returns `None` if elections were disabled in the meantime or the node
    /// is leading.
    pub(crate) fn on_timeout(
        &mut self,
        state: &mut NodeState,
        log: &RaftLog,
    ) -> Result<Option<RequestVoteRequest>> {
        if self.no_elections() || state.role == RaftRole::Leader {
            self.disarm();
            return Ok(None);
        }

        let (last_log_index, last_log_term) = log.last_log_info();
        state.become_candidate(last_log_term);
        Self::persist(state, log)?;
        // Re-armed so a split vote is retried after another random timeout
        self.arm();

        info!(
            node = %state.id,
            term = %state.current_term(),
            %last_log_index,
            %last_log_term,
            "Starting election"
        );

        Ok(Some(RequestVoteRequest {
            term: state.current_term(),
            candidate_id: state.id.clone(),
            last_log_index,
            last_log_term,
        }))
    }

    /// Decide on a vote request
    pub(crate) fn handle_vote_request(
        &mut self,
        state: &mut NodeState,
        log: &RaftLog,
        req: &RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let is_member = state.members.contains(&req.candidate_id);
        if is_member {
            self.observe_term(state, log, req.term, None)?;
        }

        let mut vote_granted = false;

        // Grant vote if:
        // 1. Candidate's term equals ours (after adopting a newer one)
        // 2. We haven't voted for anyone else this term
        // 3. Candidate's log is at least as up-to-date as ours
        if is_member && req.term == state.current_term() {
            let already_voted = state
                .hard
                .voted_for
                .as_ref()
                .map(|v| *v != req.candidate_id)
                .unwrap_or(false);

            if !already_voted {
                let (our_last_index, our_last_term) = log.last_log_info();
                if is_log_up_to_date(
                    req.last_log_index,
                    req.last_log_term,
                    our_last_index,
                    our_last_term,
                ) {
                    vote_granted = true;
                    state.hard.voted_for = Some(req.candidate_id.clone());
                    Self::persist(state, log)?;
                    self.arm();
                }
            }
        }

        debug!(
            node = %state.id,
            candidate = %req.candidate_id,
            term = %req.term,
            vote_granted,
            "Handled vote request"
        );

        Ok(RequestVoteResponse {
            term: state.current_term(),
            vote_granted,
        })
    }

    /// Count a vote response; returns true once the candidate holds a quorum
    pub(crate) fn handle_vote_response(
        &mut self,
        state: &mut NodeState,
        log: &RaftLog,
        from: &NodeId,
        resp: &RequestVoteResponse,
        quorum: usize,
    ) -> Result<bool> {
        if self.observe_term(state, log, resp.term, None)? {
            return Ok(false);
        }
        if state.role != RaftRole::Candidate || resp.term != state.current_term() {
            return Ok(false);
        }
        if resp.vote_granted && state.members.contains(from) {
            if let Some(candidate) = state.candidate_state.as_mut() {
                candidate.add_vote(from.clone());
            }
        }
        Ok(self.has_won(state, quorum))
    }

    /// Whether a candidate already holds a quorum (single-member clusters win at once)
    pub(crate) fn has_won(&self, state: &NodeState, quorum: usize) -> bool {
        state.role == RaftRole::Candidate
            && state
                .candidate_state
                .as_ref()
                .map(|c| c.has_quorum(quorum))
                .unwrap_or(false)
    }

    /// Take over leadership; the election timer stays disarmed while leading
    pub(crate) fn become_leader(&mut self, state: &mut NodeState, log: &RaftLog) {
        state.become_leader(log.last_index());
        self.disarm();
        info!(
            node = %state.id,
            term = %state.current_term(),
            "Became leader"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Entry;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn election() -> Election {
        Election::new(
            ElectionConfig::default()
                .election_min_interval(ms(100))
                .election_max_interval(ms(200))
                .heartbeat_interval(ms(20)),
        )
        .unwrap()
    }

    fn node(id: &str) -> NodeState {
        NodeState::new(
            NodeId::from(id),
            ["A", "B", "C"].iter().map(|n| NodeId::from(*n)).collect(),
        )
    }

    fn log_with_terms(terms: &[u64]) -> RaftLog {
        let log = RaftLog::new_memory();
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, t)| Entry::new(Term(*t), LogIndex(i as u64 + 1), &b""[..]))
            .collect();
        log.append(entries).unwrap();
        log
    }

    fn vote_request(candidate: &str, term: u64, last_index: u64, last_term: u64) -> RequestVoteRequest {
        RequestVoteRequest {
            term: Term(term),
            candidate_id: NodeId::from(candidate),
            last_log_index: LogIndex(last_index),
            last_log_term: Term(last_term),
        }
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let err = Election::new(
            ElectionConfig::default()
                .no_elections(true)
                .election_max_interval(ms(500))
                .election_min_interval(ms(1000))
                .heartbeat_interval(ms(100)),
        )
        .err()
        .unwrap();
        assert_eq!(
            err.to_string(),
            "election_min_interval (1000) needs to be smaller than election_max_interval (500)"
        );
    }

    #[test]
    fn test_quorum_size() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }

    #[test]
    fn test_log_recency() {
        // Higher last term wins even with a shorter log
        assert!(is_log_up_to_date(LogIndex(1), Term(3), LogIndex(5), Term(2)));
        // Same term, longer or equal log wins
        assert!(is_log_up_to_date(LogIndex(5), Term(2), LogIndex(5), Term(2)));
        assert!(!is_log_up_to_date(LogIndex(4), Term(2), LogIndex(5), Term(2)));
        // Lower last term never wins
        assert!(!is_log_up_to_date(LogIndex(9), Term(1), LogIndex(1), Term(2)));
        // Empty logs
        assert!(is_log_up_to_date(LogIndex(0), Term(0), LogIndex(0), Term(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_arming_respects_no_elections() {
        let mut election = Election::new(
            ElectionConfig::default()
                .election_min_interval(ms(100))
                .election_max_interval(ms(200))
                .heartbeat_interval(ms(20))
                .no_elections(true),
        )
        .unwrap();

        election.start_election_timer();
        assert!(election.deadline().is_none());

        election.set_no_elections(false);
        election.start_election_timer();
        let remaining = election.deadline().unwrap() - Instant::now();
        assert!(remaining >= ms(100) && remaining <= ms(200));

        election.disarm();
        assert!(election.deadline().is_none());
    }

    #[tokio::test]
    async fn test_timeout_starts_election() {
        let mut election = election();
        let mut state = node("A");
        let log = log_with_terms(&[1, 1, 2]);

        let req = election.on_timeout(&mut state, &log).unwrap().unwrap();
        assert_eq!(state.role, RaftRole::Candidate);
        // New term is above the highest term found in the log
        assert_eq!(req.term, Term(3));
        assert_eq!(req.last_log_index, LogIndex(3));
        assert_eq!(req.last_log_term, Term(2));
        assert_eq!(log.hard_state().voted_for, Some(NodeId::from("A")));
        assert!(!election.has_won(&state, 2));
    }

    #[tokio::test]
    async fn test_timeout_ignored_when_disabled_or_leading() {
        let mut election = election();
        let mut state = node("A");
        let log = RaftLog::new_memory();

        election.set_no_elections(true);
        assert!(election.on_timeout(&mut state, &log).unwrap().is_none());
        assert_eq!(state.role, RaftRole::Follower);

        election.set_no_elections(false);
        state.role = RaftRole::Leader;
        assert!(election.on_timeout(&mut state, &log).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_grant_vote_once_per_term() {
        let mut election = election();
        let mut state = node("A");
        let log = RaftLog::new_memory();

        let resp = election
            .handle_vote_request(&mut state, &log, &vote_request("B", 1, 0, 0))
            .unwrap();
        assert!(resp.vote_granted);
        assert_eq!(resp.term, Term(1));

        // Same candidate may ask again
        let resp = election
            .handle_vote_request(&mut state, &log, &vote_request("B", 1, 0, 0))
            .unwrap();
        assert!(resp.vote_granted);

        // A different candidate in the same term is refused
        let resp = election
            .handle_vote_request(&mut state, &log, &vote_request("C", 1, 0, 0))
            .unwrap();
        assert!(!resp.vote_granted);

        // A newer term clears the vote
        let resp = election
            .handle_vote_request(&mut state, &log, &vote_request("C", 2, 0, 0))
            .unwrap();
        assert!(resp.vote_granted);
        assert_eq!(
            log.hard_state().voted_for,
            Some(NodeId::from("C")),
            "vote must be persisted"
        );
    }

    #[tokio::test]
    async fn test_reject_stale_term_and_outdated_log() {
        let mut election = election();
        let mut state = node("A");
        let log = log_with_terms(&[1, 1, 2]);
        state.hard.current_term = Term(3);

        let resp = election
            .handle_vote_request(&mut state, &log, &vote_request("B", 2, 3, 2))
            .unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, Term(3));

        // Newer term but shorter log: term adopted, vote refused
        let resp = election
            .handle_vote_request(&mut state, &log, &vote_request("B", 4, 0, 0))
            .unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(state.current_term(), Term(4));
        assert_eq!(state.hard.voted_for, None);

        // Unknown candidates never get a vote
        let resp = election
            .handle_vote_request(&mut state, &log, &vote_request("Z", 9, 9, 9))
            .unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(state.current_term(), Term(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_vote_keeps_the_timer_running() {
        let mut election = Election::new(
            ElectionConfig::default()
                .election_min_interval(ms(100))
                .election_max_interval(ms(101))
                .heartbeat_interval(ms(20)),
        )
        .unwrap();
        let mut state = node("A");
        let log = log_with_terms(&[1, 1, 2]);
        election.start_election_timer();
        let deadline = election.deadline().unwrap();

        // A candidate with a stale log bumps our term but must not delay our election
        tokio::time::advance(ms(50)).await;
        let resp = election
            .handle_vote_request(&mut state, &log, &vote_request("B", 5, 0, 0))
            .unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(state.current_term(), Term(5));
        assert_eq!(election.deadline(), Some(deadline));

        // Granting a vote does restart it
        let resp = election
            .handle_vote_request(&mut state, &log, &vote_request("C", 6, 3, 2))
            .unwrap();
        assert!(resp.vote_granted);
        assert!(election.deadline().unwrap() > deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deposed_leader_rearms_the_timer() {
        let mut election = election();
        let mut state = node("A");
        let log = RaftLog::new_memory();
        election.start_election_timer();
        election.on_timeout(&mut state, &log).unwrap();
        election.become_leader(&mut state, &log);
        assert!(election.deadline().is_none());

        election
            .observe_term(&mut state, &log, Term(9), Some(NodeId::from("B")))
            .unwrap();
        assert_eq!(state.role, RaftRole::Follower);
        assert!(election.deadline().is_some());
    }

    #[tokio::test]
    async fn test_vote_request_makes_leader_step_down() {
        let mut election = election();
        let mut state = node("A");
        let log = RaftLog::new_memory();
        election.on_timeout(&mut state, &log).unwrap();
        election.become_leader(&mut state, &log);
        assert!(state.is_leader());

        let resp = election
            .handle_vote_request(&mut state, &log, &vote_request("B", 5, 0, 0))
            .unwrap();
        assert!(resp.vote_granted);
        assert_eq!(state.role, RaftRole::Follower);
        assert!(state.leader_state.is_none());
    }

    #[tokio::test]
    async fn test_collect_votes_to_quorum() {
        let mut election = election();
        let mut state = node("A");
        let log = RaftLog::new_memory();
        election.on_timeout(&mut state, &log).unwrap();

        let granted = RequestVoteResponse {
            term: Term(1),
            vote_granted: true,
        };
        let refused = RequestVoteResponse {
            term: Term(1),
            vote_granted: false,
        };

        assert!(!election
            .handle_vote_response(&mut state, &log, &NodeId::from("C"), &refused, 2)
            .unwrap());
        assert!(election
            .handle_vote_response(&mut state, &log, &NodeId::from("B"), &granted, 2)
            .unwrap());

        election.become_leader(&mut state, &log);
        assert!(state.is_leader());
        assert!(election.deadline().is_none());
    }

    #[tokio::test]
    async fn test_newer_term_in_vote_response_ends_candidacy() {
        let mut election = election();
        let mut state = node("A");
        let log = RaftLog::new_memory();
        election.on_timeout(&mut state, &log).unwrap();

        let newer = RequestVoteResponse {
            term: Term(7),
            vote_granted: false,
        };
        assert!(!election
            .handle_vote_response(&mut state, &log, &NodeId::from("B"), &newer, 2)
            .unwrap());
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(log.hard_state().current_term, Term(7));
    }
}
