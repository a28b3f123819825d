//! Log storage
//!
//! The log is the source of truth for all commands that have been proposed.
//! Besides the entries it keeps the vote record and the commit index, so a
//! restarted node resumes with the term and vote it had before the crash.

use crate::config::{LogStorageKind, RaftConfig};
use crate::types::{Entry, EntryKind, HardState, LogIndex, Snapshot, Term};
use crate::{RaftError, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Trait for log storage backends
///
/// Implementations must ensure durability of every successful write before
/// returning.
pub trait LogStorage: Send + Sync {
    /// Append entries to the end of the log
    ///
    /// Entries must continue the log contiguously and their terms must not be
    /// lower than the term of the last entry.
    fn append(&mut self, entries: Vec<Entry>) -> Result<()>;

    /// Get an entry at a specific index
    fn get(&self, index: LogIndex) -> Result<Option<Entry>>;

    /// Get a range of entries [start, end)
    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>>;

    /// Get all entries from start index onwards
    fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>>;

    /// Delete entries from index onwards (used when log conflicts are detected)
    fn truncate_from(&mut self, index: LogIndex) -> Result<()>;

    /// Index of the first entry still held (after compaction)
    fn first_index(&self) -> LogIndex;

    /// Get the index of the last entry
    fn last_index(&self) -> LogIndex;

    /// Get the term of the last entry
    fn last_term(&self) -> Term;

    /// Get the term of a specific entry; `None` if absent or compacted away
    fn get_term(&self, index: LogIndex) -> Result<Option<Term>>;

    fn hard_state(&self) -> HardState;

    fn set_hard_state(&mut self, state: &HardState) -> Result<()>;

    fn commit_index(&self) -> LogIndex;

    fn set_commit_index(&mut self, index: LogIndex) -> Result<()>;

    /// Set the current snapshot
    fn set_snapshot(&mut self, snapshot: Snapshot) -> Result<()>;

    /// Get the current snapshot
    fn get_snapshot(&self) -> Option<Snapshot>;

    /// Remove entries up to and including `through_index`
    fn compact(&mut self, through_index: LogIndex) -> Result<()>;

    /// Discard the whole log, vote record included
    fn delete(&mut self) -> Result<()>;

    fn delete_snapshot(&mut self) -> Result<()>;
}

/// Verify that `entries` continue a log ending at (`last_index`, `last_term`)
fn check_append(mut last_index: LogIndex, mut last_term: Term, entries: &[Entry]) -> Result<()> {
    for entry in entries {
        if entry.index != last_index + 1 {
            return Err(RaftError::InvalidAppend(format!(
                "expected index {}, got {}",
                last_index + 1,
                entry.index
            )));
        }
        if entry.term < last_term {
            return Err(RaftError::InvalidAppend(format!(
                "term {} of entry {} is below the last term {}",
                entry.term, entry.index, last_term
            )));
        }
        last_index = entry.index;
        last_term = entry.term;
    }
    Ok(())
}

/// In-memory log storage (for testing and development)
pub struct MemoryLogStorage {
    entries: Vec<Entry>,
    /// Index of `entries[0]`
    offset: LogIndex,
    /// Term of the entry at `offset - 1`
    prev_term: Term,
    snapshot: Option<Snapshot>,
    hard_state: HardState,
    commit_index: LogIndex,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self {
            entries: vec![],
            offset: LogIndex(1),
            prev_term: Term(0),
            snapshot: None,
            hard_state: HardState::default(),
            commit_index: LogIndex::ZERO,
        }
    }

    /// Convert a log index to an array index
    fn to_array_index(&self, index: LogIndex) -> Option<usize> {
        if index < self.offset {
            return None;
        }
        Some((index.0 - self.offset.0) as usize)
    }
}

impl Default for MemoryLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStorage for MemoryLogStorage {
    fn append(&mut self, entries: Vec<Entry>) -> Result<()> {
        check_append(self.last_index(), self.last_term(), &entries)?;
        self.entries.extend(entries);
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        Ok(self
            .to_array_index(index)
            .and_then(|idx| self.entries.get(idx).cloned()))
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        let start_idx = self
            .to_array_index(start)
            .ok_or(RaftError::LogIndexOutOfRange(start))?
            .min(self.entries.len());
        let end_idx = self
            .to_array_index(end)
            .unwrap_or(0)
            .min(self.entries.len());

        if start_idx >= end_idx {
            return Ok(vec![]);
        }
        Ok(self.entries[start_idx..end_idx].to_vec())
    }

    fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>> {
        let start_idx = self
            .to_array_index(start)
            .ok_or(RaftError::LogIndexOutOfRange(start))?
            .min(self.entries.len());

        Ok(self.entries[start_idx..].to_vec())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        match self.to_array_index(index) {
            Some(idx) => {
                self.entries.truncate(idx);
                Ok(())
            }
            None => Err(RaftError::LogIndexOutOfRange(index)),
        }
    }

    fn first_index(&self) -> LogIndex {
        self.offset
    }

    fn last_index(&self) -> LogIndex {
        self.offset + self.entries.len() as u64 - 1
    }

    fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.prev_term)
    }

    fn get_term(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == LogIndex::ZERO {
            return Ok(Some(Term(0)));
        }
        if index == self.offset.prev() {
            return Ok(Some(self.prev_term));
        }
        Ok(self.get(index)?.map(|e| e.term))
    }

    fn hard_state(&self) -> HardState {
        self.hard_state.clone()
    }

    fn set_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.hard_state = state.clone();
        Ok(())
    }

    fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    fn set_commit_index(&mut self, index: LogIndex) -> Result<()> {
        self.commit_index = index;
        Ok(())
    }

    fn set_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        self.snapshot = Some(snapshot);
        Ok(())
    }

    fn get_snapshot(&self) -> Option<Snapshot> {
        self.snapshot.clone()
    }

    fn compact(&mut self, through_index: LogIndex) -> Result<()> {
        if through_index < self.offset {
            return Ok(());
        }
        let term = self
            .get_term(through_index)?
            .ok_or(RaftError::LogIndexOutOfRange(through_index))?;
        if let Some(idx) = self.to_array_index(through_index) {
            // Remove entries up to through_index
            self.entries.drain(0..=idx);
        }
        self.offset = through_index + 1;
        self.prev_term = term;
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        *self = Self::new();
        Ok(())
    }

    fn delete_snapshot(&mut self) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }
}

const META_FILE: &str = "meta.bin";
const ENTRIES_FILE: &str = "entries.bin";
const SNAPSHOT_FILE: &str = "snapshot.bin";

/// Everything but the entries and the snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogMeta {
    hard_state: HardState,
    commit_index: LogIndex,
    first_index: LogIndex,
    prev_term: Term,
}

/// Durable log kept under `dir/<name>`
///
/// Entries are stored as length-prefixed bincode records and appended with an
/// fsync. Truncation and compaction rewrite the entry file through a temporary
/// file and a rename. All reads are served from an in-memory copy.
pub struct FileLogStorage {
    dir: PathBuf,
    cache: MemoryLogStorage,
}

impl FileLogStorage {
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = dir.as_ref().join(name);
        fs::create_dir_all(&dir)?;

        let mut cache = MemoryLogStorage::new();
        if let Some(meta) = read_file::<LogMeta>(&dir.join(META_FILE))? {
            cache.hard_state = meta.hard_state;
            cache.commit_index = meta.commit_index;
            cache.offset = meta.first_index.max(LogIndex(1));
            cache.prev_term = meta.prev_term;
        }
        cache.snapshot = read_file::<Snapshot>(&dir.join(SNAPSHOT_FILE))?;

        // Records below the first index survive a crash in the middle of compaction
        let mut entries = read_entries(&dir.join(ENTRIES_FILE))?;
        let read = entries.len();
        entries.retain(|e| e.index >= cache.offset);
        let stale = read - entries.len();
        cache.append(entries)?;

        debug!(
            dir = %dir.display(),
            first = %cache.first_index(),
            last = %cache.last_index(),
            term = %cache.hard_state.current_term,
            "Opened file log"
        );
        let log = Self { dir, cache };
        if stale > 0 {
            warn!(dir = %log.dir.display(), stale, "Finishing interrupted compaction");
            log.rewrite_entries()?;
        }
        Ok(log)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_meta(&self) -> Result<()> {
        let meta = LogMeta {
            hard_state: self.cache.hard_state.clone(),
            commit_index: self.cache.commit_index,
            first_index: self.cache.offset,
            prev_term: self.cache.prev_term,
        };
        write_atomic(&self.dir.join(META_FILE), &encode(&meta)?)?;
        Ok(())
    }

    fn rewrite_entries(&self) -> Result<()> {
        let mut buf = Vec::new();
        for entry in &self.cache.entries {
            encode_record(&mut buf, entry)?;
        }
        write_atomic(&self.dir.join(ENTRIES_FILE), &buf)?;
        Ok(())
    }
}

impl LogStorage for FileLogStorage {
    fn append(&mut self, entries: Vec<Entry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        check_append(self.cache.last_index(), self.cache.last_term(), &entries)?;

        let mut buf = Vec::new();
        for entry in &entries {
            encode_record(&mut buf, entry)?;
        }
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(ENTRIES_FILE))?;
        file.write_all(&buf)?;
        file.sync_data()?;

        self.cache.append(entries)
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        self.cache.get(index)
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        self.cache.get_range(start, end)
    }

    fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>> {
        self.cache.get_from(start)
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        self.cache.truncate_from(index)?;
        self.rewrite_entries()
    }

    fn first_index(&self) -> LogIndex {
        self.cache.first_index()
    }

    fn last_index(&self) -> LogIndex {
        self.cache.last_index()
    }

    fn last_term(&self) -> Term {
        self.cache.last_term()
    }

    fn get_term(&self, index: LogIndex) -> Result<Option<Term>> {
        self.cache.get_term(index)
    }

    fn hard_state(&self) -> HardState {
        self.cache.hard_state()
    }

    fn set_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.cache.set_hard_state(state)?;
        self.write_meta()
    }

    fn commit_index(&self) -> LogIndex {
        self.cache.commit_index()
    }

    fn set_commit_index(&mut self, index: LogIndex) -> Result<()> {
        self.cache.set_commit_index(index)?;
        self.write_meta()
    }

    fn set_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        write_atomic(&self.dir.join(SNAPSHOT_FILE), &encode(&snapshot)?)?;
        self.cache.set_snapshot(snapshot)
    }

    fn get_snapshot(&self) -> Option<Snapshot> {
        self.cache.get_snapshot()
    }

    fn compact(&mut self, through_index: LogIndex) -> Result<()> {
        self.cache.compact(through_index)?;
        // Meta first: a crash in between leaves stale entries, which open drops
        self.write_meta()?;
        self.rewrite_entries()
    }

    fn delete(&mut self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cache.delete()
    }

    fn delete_snapshot(&mut self) -> Result<()> {
        match fs::remove_file(self.dir.join(SNAPSHOT_FILE)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cache.delete_snapshot()
    }
}

fn encode<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> io::Result<T> {
    bincode::deserialize(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn encode_record(buf: &mut Vec<u8>, entry: &Entry) -> io::Result<()> {
    let record = encode(entry)?;
    let len = u32::try_from(record.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "log record too large"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&record);
    Ok(())
}

fn read_entries(path: &Path) -> io::Result<Vec<Entry>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e),
    };

    let mut entries = Vec::new();
    let mut pos = 0;
    while pos + 4 <= data.len() {
        let mut len = [0u8; 4];
        len.copy_from_slice(&data[pos..pos + 4]);
        let len = u32::from_le_bytes(len) as usize;
        let end = pos + 4 + len;
        if end > data.len() {
            break;
        }
        entries.push(decode(&data[pos + 4..end])?);
        pos = end;
    }
    if pos != data.len() {
        warn!(
            path = %path.display(),
            trailing = data.len() - pos,
            "Cutting torn record from the end of the log"
        );
        // Later appends must start at a record boundary
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(pos as u64)?;
        file.sync_all()?;
    }
    Ok(entries)
}

fn read_file<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    match fs::read(path) {
        Ok(data) => decode(&data).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Thread-safe handle to a node's log storage
pub struct RaftLog {
    storage: Arc<RwLock<Box<dyn LogStorage>>>,
}

impl RaftLog {
    pub fn new(storage: Box<dyn LogStorage>) -> Self {
        Self {
            storage: Arc::new(RwLock::new(storage)),
        }
    }

    pub fn new_memory() -> Self {
        Self::new(Box::new(MemoryLogStorage::new()))
    }

    /// Create or reopen the log selected by the configuration
    pub fn open(config: &RaftConfig) -> Result<Self> {
        match &config.log.storage {
            LogStorageKind::Memory => Ok(Self::new_memory()),
            LogStorageKind::File { dir } => Ok(Self::new(Box::new(FileLogStorage::open(
                dir,
                &config.log_name(),
            )?))),
        }
    }

    pub fn append(&self, entries: Vec<Entry>) -> Result<()> {
        self.storage.write().append(entries)
    }

    /// Append a single entry at the next free index
    pub fn append_next(&self, term: Term, kind: EntryKind, command: Bytes) -> Result<Entry> {
        let mut storage = self.storage.write();
        let entry = Entry {
            term,
            index: storage.last_index() + 1,
            kind,
            command,
        };
        storage.append(vec![entry.clone()])?;
        Ok(entry)
    }

    pub fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        self.storage.read().get(index)
    }

    pub fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        self.storage.read().get_range(start, end)
    }

    pub fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>> {
        self.storage.read().get_from(start)
    }

    pub fn truncate_from(&self, index: LogIndex) -> Result<()> {
        self.storage.write().truncate_from(index)
    }

    pub fn first_index(&self) -> LogIndex {
        self.storage.read().first_index()
    }

    pub fn last_index(&self) -> LogIndex {
        self.storage.read().last_index()
    }

    pub fn last_term(&self) -> Term {
        self.storage.read().last_term()
    }

    /// Last index and term, read under one lock
    pub fn last_log_info(&self) -> (LogIndex, Term) {
        let storage = self.storage.read();
        (storage.last_index(), storage.last_term())
    }

    pub fn get_term(&self, index: LogIndex) -> Result<Option<Term>> {
        self.storage.read().get_term(index)
    }

    pub fn hard_state(&self) -> HardState {
        self.storage.read().hard_state()
    }

    pub fn set_hard_state(&self, state: &HardState) -> Result<()> {
        self.storage.write().set_hard_state(state)
    }

    pub fn commit_index(&self) -> LogIndex {
        self.storage.read().commit_index()
    }

    pub fn set_commit_index(&self, index: LogIndex) -> Result<()> {
        self.storage.write().set_commit_index(index)
    }

    pub fn set_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.storage.write().set_snapshot(snapshot)
    }

    pub fn get_snapshot(&self) -> Option<Snapshot> {
        self.storage.read().get_snapshot()
    }

    pub fn compact(&self, through_index: LogIndex) -> Result<()> {
        self.storage.write().compact(through_index)
    }

    pub fn delete(&self) -> Result<()> {
        self.storage.write().delete()
    }

    pub fn delete_snapshot(&self) -> Result<()> {
        self.storage.write().delete_snapshot()
    }
}

impl Clone for RaftLog {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}
