//! Raft consensus as a layer over a group-communication transport
//!
//! This library lets a fixed set of members agree on a single, totally ordered,
//! durable log of commands. Entries are replicated to a majority before they are
//! applied, and members may crash, restart or be partitioned.
//!
//! # Features
//!
//! - Leader election with randomized timeouts and log-recency voting
//! - Log replication with conflict repair and quorum commit
//! - Sequential apply pipeline with per-index client waiters
//! - Write redirection from followers to the current leader
//! - Local snapshotting and log compaction
//! - A replicated key/value map built on top of the node
//!
//! # Example
//!
//! ```no_run
//! use raftstack_consensus::{LocalNetwork, RaftConfig, ReplicatedStateMachine};
//! use std::time::Duration;
//!
//! # async fn example() -> raftstack_consensus::Result<()> {
//! let network = LocalNetwork::new();
//! let config = RaftConfig::builder()
//!     .members(["A", "B", "C"])
//!     .raft_id("A")
//!     .build()?;
//!
//! let (transport, inbox) = network.join("A");
//! let map = ReplicatedStateMachine::<String, String>::start(config, transport, inbox)?;
//! map.set_timeout(Duration::from_secs(2));
//!
//! // Routed to the leader if this member is not leading
//! map.put("key".to_string(), "value".to_string()).await?;
//! # Ok(())
//! # }
//! ```

mod apply;
mod config;
mod election;
mod log;
mod node;
mod redirect;
mod replicated;
mod replication;
mod rpc;
mod state;
mod transport;
mod types;

#[cfg(test)]
mod tests;

pub use apply::StateMachine;
pub use config::{
    ElectionConfig, LogConfig, LogStorageKind, RaftConfig, RaftConfigBuilder, RaftConfigFile,
};
pub use election::{is_log_up_to_date, quorum_size, Election};
pub use log::{FileLogStorage, LogStorage, MemoryLogStorage, RaftLog};
pub use node::{NodeStatus, RaftNode};
pub use replicated::{MapCommand, MapItem, ReplicatedStateMachine};
pub use replication::{MatchOutcome, RaftReplication, Replication};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, ForwardFailure, ForwardRequest,
    ForwardResponse, RaftMessage, RequestVoteRequest, RequestVoteResponse,
};
pub use state::{NodeState, RaftRole};
pub use transport::{Envelope, Inbox, LocalNetwork, LocalTransport, Transport};
pub use types::{Entry, EntryKind, HardState, LogIndex, NodeId, Snapshot, SnapshotMetadata, Term};

use std::time::Duration;

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors that can occur during consensus operations
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// Invalid configuration; the message is the complete description
    #[error("{0}")]
    Config(String),

    #[error("Not the leader (current leader: {0:?})")]
    NotLeader(Option<NodeId>),

    #[error("No current leader")]
    NoLeader,

    #[error("Timed out after {0:?} waiting for the entry to be applied")]
    Timeout(Duration),

    #[error("Entry at index {0} was overwritten by a newer leader")]
    EntryOverwritten(LogIndex),

    #[error("Entries up to index {0} were compacted into a snapshot")]
    SnapshotRequired(LogIndex),

    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    #[error("Log index out of range: {0}")]
    LogIndexOutOfRange(LogIndex),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RaftError {
    /// Storage failures end the node's participation in the protocol
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Storage(_))
    }
}
