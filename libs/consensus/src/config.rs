//! Node configuration

use crate::types::NodeId;
use crate::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_ELECTION_MIN_MS: u64 = 150;
const DEFAULT_ELECTION_MAX_MS: u64 = 300;
const DEFAULT_HEARTBEAT_MS: u64 = 50;
const DEFAULT_MAX_APPEND_ENTRIES: usize = 100;
const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 10_000;
const DEFAULT_SNAPSHOT_TRAILING_LOGS: u64 = 1_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Timer configuration of the election component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionConfig {
    /// Lower bound of the randomized election timeout
    ///
    /// A follower waits a uniformly random time in
    /// `[election_min_interval, election_max_interval]` without hearing from a
    /// leader before it starts an election.
    pub election_min_interval: Duration,

    /// Upper bound of the randomized election timeout
    pub election_max_interval: Duration,

    /// How often a leader sends append-entries (heartbeats) to its followers
    pub heartbeat_interval: Duration,

    /// Never arm the election timer until released explicitly
    pub no_elections: bool,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_min_interval: Duration::from_millis(DEFAULT_ELECTION_MIN_MS),
            election_max_interval: Duration::from_millis(DEFAULT_ELECTION_MAX_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            no_elections: false,
        }
    }
}

impl ElectionConfig {
    pub fn no_elections(mut self, flag: bool) -> Self {
        self.no_elections = flag;
        self
    }

    pub fn election_min_interval(mut self, interval: Duration) -> Self {
        self.election_min_interval = interval;
        self
    }

    pub fn election_max_interval(mut self, interval: Duration) -> Self {
        self.election_max_interval = interval;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Check the interval ordering, reporting values in milliseconds
    pub fn validate(&self) -> Result<()> {
        validate_intervals(
            as_millis(self.election_min_interval),
            as_millis(self.election_max_interval),
            as_millis(self.heartbeat_interval),
        )
    }
}

fn as_millis(interval: Duration) -> i64 {
    i64::try_from(interval.as_millis()).unwrap_or(i64::MAX)
}

/// Interval checks on raw milliseconds, so negative values from
/// configuration files are reported like any other bad value
fn validate_intervals(min: i64, max: i64, heartbeat: i64) -> Result<()> {
    if min >= max {
        return Err(RaftError::Config(format!(
            "election_min_interval ({}) needs to be smaller than election_max_interval ({})",
            min, max
        )));
    }
    if heartbeat >= min {
        return Err(RaftError::Config(format!(
            "heartbeat_interval ({}) needs to be smaller than election_min_interval ({})",
            heartbeat, min
        )));
    }
    if heartbeat < 1 {
        return Err(RaftError::Config(format!(
            "heartbeat_interval ({}) must not be below one",
            heartbeat
        )));
    }
    Ok(())
}

/// Where a node keeps its log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogStorageKind {
    /// Volatile, for tests and demos
    Memory,
    /// Durable files under `dir/<log name>`
    File { dir: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Identifies the log instance; defaults to the raft id
    pub name: Option<String>,
    pub storage: LogStorageKind,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            name: None,
            storage: LogStorageKind::Memory,
        }
    }
}

/// Configuration for a consensus node
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub election: ElectionConfig,

    /// Fixed, ordered membership, agreed out of band
    pub members: Vec<NodeId>,

    /// This node's identity; must be one of `members`
    pub raft_id: NodeId,

    pub log: LogConfig,

    /// Maximum number of entries to send in a single append-entries message
    pub max_append_entries: usize,

    /// Snapshot once this many applied entries are retained in the log
    ///
    /// Set to 0 to disable automatic snapshotting
    pub snapshot_threshold: u64,

    /// Number of applied entries kept after a snapshot for follower catch-up
    pub snapshot_trailing_logs: u64,

    /// How long a client write waits for its entry to be applied
    pub request_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election: ElectionConfig::default(),
            members: Vec::new(),
            raft_id: NodeId(String::new()),
            log: LogConfig::default(),
            max_append_entries: DEFAULT_MAX_APPEND_ENTRIES,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            snapshot_trailing_logs: DEFAULT_SNAPSHOT_TRAILING_LOGS,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

impl RaftConfig {
    pub fn builder() -> RaftConfigBuilder {
        RaftConfigBuilder::new()
    }

    /// Name of the per-node log instance
    pub fn log_name(&self) -> String {
        self.log
            .name
            .clone()
            .unwrap_or_else(|| self.raft_id.to_string())
    }

    /// Number of acknowledgements (self included) needed to elect or commit
    pub fn quorum(&self) -> usize {
        crate::election::quorum_size(self.members.len())
    }

    /// Members other than this node
    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.members.iter().filter(move |m| **m != self.raft_id)
    }

    pub fn validate(&self) -> Result<()> {
        self.election.validate()?;

        if self.members.is_empty() {
            return Err(RaftError::Config("members must not be empty".to_string()));
        }
        let unique: HashSet<&NodeId> = self.members.iter().collect();
        if unique.len() != self.members.len() {
            return Err(RaftError::Config(format!(
                "members contains duplicates: {:?}",
                self.members
            )));
        }
        if !self.members.contains(&self.raft_id) {
            return Err(RaftError::Config(format!(
                "raft_id ({}) is not listed in members {:?}",
                self.raft_id, self.members
            )));
        }
        if self.max_append_entries == 0 {
            return Err(RaftError::Config(
                "max_append_entries must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: RaftConfigFile = serde_json::from_str(json)?;
        file.into_config()
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

/// On-disk form of [`RaftConfig`], with intervals in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfigFile {
    pub raft_id: String,
    pub members: Vec<String>,
    pub election_min_interval_ms: i64,
    pub election_max_interval_ms: i64,
    pub heartbeat_interval_ms: i64,
    pub no_elections: bool,
    pub log_name: Option<String>,
    /// Durable log directory; an in-memory log is used when absent
    pub log_dir: Option<PathBuf>,
    pub max_append_entries: usize,
    pub snapshot_threshold: u64,
    pub snapshot_trailing_logs: u64,
    pub request_timeout_ms: u64,
}

impl Default for RaftConfigFile {
    fn default() -> Self {
        Self {
            raft_id: String::new(),
            members: Vec::new(),
            election_min_interval_ms: DEFAULT_ELECTION_MIN_MS as i64,
            election_max_interval_ms: DEFAULT_ELECTION_MAX_MS as i64,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_MS as i64,
            no_elections: false,
            log_name: None,
            log_dir: None,
            max_append_entries: DEFAULT_MAX_APPEND_ENTRIES,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            snapshot_trailing_logs: DEFAULT_SNAPSHOT_TRAILING_LOGS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl RaftConfigFile {
    pub fn into_config(self) -> Result<RaftConfig> {
        validate_intervals(
            self.election_min_interval_ms,
            self.election_max_interval_ms,
            self.heartbeat_interval_ms,
        )?;
        // All three are positive past validation
        let millis = |ms: i64| Duration::from_millis(ms.unsigned_abs());

        let storage = match self.log_dir {
            Some(dir) => LogStorageKind::File { dir },
            None => LogStorageKind::Memory,
        };

        RaftConfigBuilder::new()
            .members(self.members)
            .raft_id(self.raft_id)
            .election_interval(
                millis(self.election_min_interval_ms),
                millis(self.election_max_interval_ms),
            )
            .heartbeat_interval(millis(self.heartbeat_interval_ms))
            .no_elections(self.no_elections)
            .log(LogConfig {
                name: self.log_name,
                storage,
            })
            .max_append_entries(self.max_append_entries)
            .snapshot_threshold(self.snapshot_threshold)
            .snapshot_trailing_logs(self.snapshot_trailing_logs)
            .request_timeout(Duration::from_millis(self.request_timeout_ms))
            .build()
    }
}

/// Builder for RaftConfig
pub struct RaftConfigBuilder {
    config: RaftConfig,
}

impl RaftConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RaftConfig::default(),
        }
    }

    pub fn election(mut self, election: ElectionConfig) -> Self {
        self.config.election = election;
        self
    }

    pub fn election_interval(mut self, min: Duration, max: Duration) -> Self {
        self.config.election.election_min_interval = min;
        self.config.election.election_max_interval = max;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.election.heartbeat_interval = interval;
        self
    }

    pub fn no_elections(mut self, flag: bool) -> Self {
        self.config.election.no_elections = flag;
        self
    }

    pub fn members<I, N>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        self.config.members = members.into_iter().map(Into::into).collect();
        self
    }

    pub fn raft_id(mut self, id: impl Into<NodeId>) -> Self {
        self.config.raft_id = id.into();
        self
    }

    pub fn log(mut self, log: LogConfig) -> Self {
        self.config.log = log;
        self
    }

    pub fn log_name(mut self, name: impl Into<String>) -> Self {
        self.config.log.name = Some(name.into());
        self
    }

    pub fn file_log(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log.storage = LogStorageKind::File { dir: dir.into() };
        self
    }

    pub fn max_append_entries(mut self, max: usize) -> Self {
        self.config.max_append_entries = max;
        self
    }

    pub fn snapshot_threshold(mut self, threshold: u64) -> Self {
        self.config.snapshot_threshold = threshold;
        self
    }

    pub fn snapshot_trailing_logs(mut self, trailing: u64) -> Self {
        self.config.snapshot_trailing_logs = trailing;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<RaftConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RaftConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
