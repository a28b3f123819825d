//! Multi-node tests on an in-process network


use crate::{
    Entry, LogIndex, LocalNetwork, NodeId, NodeStatus, RaftConfig, RaftConfigBuilder, RaftNode,
    RaftReplication, RaftRole, Replication, StateMachine, Term,
};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const POLLS: usize = 200;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Records every applied command
#[derive(Clone, Default)]
pub(crate) struct Journal(Arc<RwLock<Vec<Bytes>>>);

impl Journal {
    pub fn entries(&self) -> Vec<String> {
        self.0
            .read()
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }
}

impl StateMachine for Journal {
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        let mut applied = self.0.write();
        applied.push(Bytes::copy_from_slice(command));
        format!("{}:{}", applied.len(), String::from_utf8_lossy(command)).into_bytes()
    }

    fn snapshot(&self) -> Vec<u8> {
        let applied: Vec<Vec<u8>> = self.0.read().iter().map(|c| c.to_vec()).collect();
        bincode::serialize(&applied).unwrap()
    }

    fn restore(&mut self, snapshot: &[u8]) {
        let applied: Vec<Vec<u8>> = bincode::deserialize(snapshot).unwrap();
        *self.0.write() = applied.into_iter().map(Bytes::from).collect();
    }
}

struct Member {
    node: RaftNode,
    journal: Journal,
    config: RaftConfig,
}

/// A cluster whose members start with elections disabled
pub(crate) struct Cluster {
    pub network: LocalNetwork,
    members: HashMap<String, Member>,
}

fn base_config(names: &[&str], name: &str) -> RaftConfigBuilder {
    RaftConfig::builder()
        .members(names.iter().copied())
        .raft_id(name)
        .election_interval(Duration::from_millis(150), Duration::from_millis(300))
        .heartbeat_interval(Duration::from_millis(30))
        .no_elections(true)
        .request_timeout(Duration::from_secs(5))
}

impl Cluster {
    pub fn start(names: &[&str]) -> Self {
        Self::start_with(names, |b| b, |_| RaftReplication)
    }

    pub fn start_with<R: Replication>(
        names: &[&str],
        configure: impl Fn(RaftConfigBuilder) -> RaftConfigBuilder,
        replication: impl Fn(&str) -> R,
    ) -> Self {
        init_tracing();
        let mut cluster = Self {
            network: LocalNetwork::new(),
            members: HashMap::new(),
        };
        for name in names.iter().copied() {
            let config = configure(base_config(names, name)).build().unwrap();
            cluster.launch(config, replication(name));
        }
        cluster
    }

    fn launch<R: Replication>(&mut self, config: RaftConfig, replication: R) {
        let journal = Journal::default();
        let (transport, inbox) = self.network.join(config.raft_id.clone());
        let node = RaftNode::with_replication(
            config.clone(),
            transport,
            inbox,
            journal.clone(),
            replication,
        )
        .unwrap();
        self.members.insert(
            config.raft_id.to_string(),
            Member {
                node,
                journal,
                config,
            },
        );
    }

    /// Stop a member and start it again from its log
    pub async fn restart(&mut self, name: &str) {
        let member = self.members.remove(name).unwrap();
        member.node.shutdown().await;
        let mut config = member.config;
        config.election.no_elections = false;
        self.launch(config, RaftReplication);
        self.node(name).start_elections();
    }

    pub fn node(&self, name: &str) -> &RaftNode {
        &self.members[name].node
    }

    pub fn applied(&self, name: &str) -> Vec<String> {
        self.members[name].journal.entries()
    }

    /// Preload a member's log with entries of the given terms
    pub fn set_log(&self, name: &str, terms: &[u64]) {
        let log = self.node(name).log();
        let first = log.last_index();
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, t)| Entry::new(Term(*t), first + (i as u64 + 1), Bytes::new()))
            .collect();
        log.append(entries).unwrap();
    }

    pub fn start_elections(&self) {
        for member in self.members.values() {
            member.node.start_elections();
        }
    }

    fn statuses(&self, among: &[&str]) -> Vec<NodeStatus> {
        among.iter().map(|n| self.node(n).status()).collect()
    }

    /// The single leader of `among`, if all of them agree on it
    fn agreed_leader(&self, among: &[&str]) -> Option<NodeId> {
        let statuses = self.statuses(among);
        let leaders: Vec<&NodeStatus> = statuses
            .iter()
            .filter(|s| s.role == RaftRole::Leader)
            .collect();
        if leaders.len() != 1 {
            return None;
        }
        let leader = leaders[0];
        statuses
            .iter()
            .all(|s| s.leader.as_ref() == Some(&leader.id) && s.term == leader.term)
            .then(|| leader.id.clone())
    }

    pub async fn wait_for_leader(&self, among: &[&str]) -> NodeId {
        for _ in 0..POLLS {
            if let Some(leader) = self.agreed_leader(among) {
                return leader;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        panic!("no agreed leader among {:?}: {:?}", among, self.statuses(among));
    }

    /// Wait until every member in `among` applied through `index`
    pub async fn wait_for_applied(&self, among: &[&str], index: LogIndex) {
        for _ in 0..POLLS {
            if self
                .statuses(among)
                .iter()
                .all(|s| s.last_applied >= index)
            {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        panic!("{:?} did not apply through {}: {:?}", among, index, self.statuses(among));
    }

    pub async fn shutdown(&self) {
        for member in self.members.values() {
            member.node.shutdown().await;
        }
    }
}

/// Poll `condition` until it holds
pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..POLLS {
        if condition() {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("timed out waiting for {}", what);
}
