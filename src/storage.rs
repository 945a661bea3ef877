//! Raft log, stable store, state machine, and snapshot storage.
//!
//! Implements openraft's combined v1 `RaftStorage` trait, bridged to the v2
//! split interface by `openraft::storage::Adaptor` in `raft.rs`.
//!
//! Two storage profiles:
//!
//! - **dev**: everything in memory, snapshots discarded. Tests and
//!   single-process demos only.
//! - **durable**: log + stable store in sled trees under
//!   `<data-dir>/raft/raft.db`, a 512-entry write-through LRU cache in front
//!   of log reads, and a file snapshot store under
//!   `<data-dir>/raft/snapshots/` retaining the three newest snapshots.
//!
//! The state machine itself is the in-memory [`KvStore`]; in durable mode the
//! map, the last-applied log id, and the membership are mirrored into sled on
//! every apply so a restarted node resumes without replaying the whole log.
//!
//! A committed entry that fails to decode is logged and skipped without
//! touching the map; a single poisoned entry must never take down the node.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::num::NonZeroUsize;
use std::ops::{Bound, RangeBounds};
use std::path::PathBuf;

use lru::LruCache;
use openraft::storage::{RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    AnyError, BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, LogState,
    RaftLogId, Snapshot, SnapshotMeta, StorageError, StorageIOError, StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::command::Command;
use crate::raft::{NodeId, RawCommand, TypeConfig};
use crate::store::{Applied, KvStore};

/// Log entries kept in the write-through cache in front of sled.
const LOG_CACHE_ENTRIES: usize = 512;
/// Snapshot files retained on disk.
const SNAPSHOT_RETENTION: usize = 3;

const META_VOTE: &[u8] = b"vote";
const META_COMMITTED: &[u8] = b"committed";
const META_LAST_PURGED: &[u8] = b"last_purged";
const SM_LAST_APPLIED: &[u8] = b"last_applied";
const SM_MEMBERSHIP: &[u8] = b"membership";

/// Which storage profile to run.
#[derive(Debug, Clone)]
pub enum StorageProfile {
    /// In-memory stores, discard snapshot sink.
    Dev,
    /// sled-backed stores rooted at `<dir>` (normally `<data-dir>/raft`).
    Durable { dir: PathBuf },
}

fn read_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::new(ErrorSubject::Store, ErrorVerb::Read, AnyError::new(&e)),
    }
}

fn write_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::new(ErrorSubject::Store, ErrorVerb::Write, AnyError::new(&e)),
    }
}

fn log_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

fn encode_entry(entry: &Entry<TypeConfig>) -> Result<Vec<u8>, StorageError<NodeId>> {
    serde_json::to_vec(entry).map_err(write_err)
}

fn decode_entry(bytes: &[u8]) -> Result<Entry<TypeConfig>, StorageError<NodeId>> {
    serde_json::from_slice(bytes).map_err(read_err)
}

// ── Log backend ───────────────────────────────────────────────────────────────

enum LogBackend {
    Memory {
        log: BTreeMap<u64, Entry<TypeConfig>>,
        vote: Option<Vote<NodeId>>,
        committed: Option<LogId<NodeId>>,
        last_purged: Option<LogId<NodeId>>,
    },
    Durable {
        logs: sled::Tree,
        meta: sled::Tree,
        cache: LruCache<u64, Entry<TypeConfig>>,
    },
}

impl LogBackend {
    fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        match self {
            LogBackend::Memory { vote: slot, .. } => {
                *slot = Some(*vote);
                Ok(())
            }
            LogBackend::Durable { meta, .. } => {
                let bytes = serde_json::to_vec(vote).map_err(write_err)?;
                meta.insert(META_VOTE, bytes).map_err(write_err)?;
                meta.flush().map_err(write_err)?;
                Ok(())
            }
        }
    }

    fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        match self {
            LogBackend::Memory { vote, .. } => Ok(*vote),
            LogBackend::Durable { meta, .. } => meta
                .get(META_VOTE)
                .map_err(read_err)?
                .map(|v| serde_json::from_slice(&v).map_err(read_err))
                .transpose(),
        }
    }

    fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        match self {
            LogBackend::Memory {
                committed: slot, ..
            } => {
                *slot = committed;
                Ok(())
            }
            LogBackend::Durable { meta, .. } => {
                match committed {
                    Some(id) => {
                        let bytes = serde_json::to_vec(&id).map_err(write_err)?;
                        meta.insert(META_COMMITTED, bytes).map_err(write_err)?;
                    }
                    None => {
                        meta.remove(META_COMMITTED).map_err(write_err)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        match self {
            LogBackend::Memory { committed, .. } => Ok(*committed),
            LogBackend::Durable { meta, .. } => meta
                .get(META_COMMITTED)
                .map_err(read_err)?
                .map(|v| serde_json::from_slice(&v).map_err(read_err))
                .transpose(),
        }
    }

    fn last_purged(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        match self {
            LogBackend::Memory { last_purged, .. } => Ok(*last_purged),
            LogBackend::Durable { meta, .. } => meta
                .get(META_LAST_PURGED)
                .map_err(read_err)?
                .map(|v| serde_json::from_slice(&v).map_err(read_err))
                .transpose(),
        }
    }

    fn last_log_id(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        match self {
            LogBackend::Memory { log, .. } => {
                Ok(log.values().next_back().map(|e| *e.get_log_id()))
            }
            LogBackend::Durable { logs, .. } => match logs.last().map_err(read_err)? {
                Some((_, bytes)) => Ok(Some(*decode_entry(&bytes)?.get_log_id())),
                None => Ok(None),
            },
        }
    }

    fn append(&mut self, entries: Vec<Entry<TypeConfig>>) -> Result<(), StorageError<NodeId>> {
        match self {
            LogBackend::Memory { log, .. } => {
                for entry in entries {
                    log.insert(entry.get_log_id().index, entry);
                }
                Ok(())
            }
            LogBackend::Durable { logs, cache, .. } => {
                for entry in entries {
                    let index = entry.get_log_id().index;
                    logs.insert(log_key(index), encode_entry(&entry)?)
                        .map_err(write_err)?;
                    cache.put(index, entry);
                }
                logs.flush().map_err(write_err)?;
                Ok(())
            }
        }
    }

    /// Drop entries at and above `index` (conflict truncation).
    fn truncate_since(&mut self, index: u64) -> Result<(), StorageError<NodeId>> {
        match self {
            LogBackend::Memory { log, .. } => {
                log.retain(|&i, _| i < index);
                Ok(())
            }
            LogBackend::Durable { logs, cache, .. } => {
                let doomed: Vec<u64> = logs
                    .range(log_key(index)..)
                    .keys()
                    .filter_map(|k| k.ok())
                    .filter_map(|k| k.as_ref().try_into().ok().map(u64::from_be_bytes))
                    .collect();
                for i in doomed {
                    logs.remove(log_key(i)).map_err(write_err)?;
                    cache.pop(&i);
                }
                logs.flush().map_err(write_err)?;
                Ok(())
            }
        }
    }

    /// Drop entries at and below `log_id` (post-snapshot purge).
    fn purge_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        match self {
            LogBackend::Memory {
                log, last_purged, ..
            } => {
                log.retain(|&i, _| i > log_id.index);
                *last_purged = Some(log_id);
                Ok(())
            }
            LogBackend::Durable {
                logs, meta, cache, ..
            } => {
                let doomed: Vec<u64> = logs
                    .range(..=log_key(log_id.index))
                    .keys()
                    .filter_map(|k| k.ok())
                    .filter_map(|k| k.as_ref().try_into().ok().map(u64::from_be_bytes))
                    .collect();
                for i in doomed {
                    logs.remove(log_key(i)).map_err(write_err)?;
                    cache.pop(&i);
                }
                let bytes = serde_json::to_vec(&log_id).map_err(write_err)?;
                meta.insert(META_LAST_PURGED, bytes).map_err(write_err)?;
                logs.flush().map_err(write_err)?;
                Ok(())
            }
        }
    }

    fn entries_between(
        &mut self,
        start: u64,
        end_inclusive: Option<u64>,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        match self {
            LogBackend::Memory { log, .. } => {
                let iter: Box<dyn Iterator<Item = &Entry<TypeConfig>>> = match end_inclusive {
                    Some(end) => Box::new(log.range(start..=end).map(|(_, e)| e)),
                    None => Box::new(log.range(start..).map(|(_, e)| e)),
                };
                Ok(iter.cloned().collect())
            }
            LogBackend::Durable { logs, cache, .. } => {
                let end = match end_inclusive {
                    Some(end) => end,
                    None => match logs.last().map_err(read_err)? {
                        Some((k, _)) => {
                            u64::from_be_bytes(k.as_ref().try_into().unwrap_or([0; 8]))
                        }
                        None => return Ok(Vec::new()),
                    },
                };
                let mut out = Vec::new();
                for index in start..=end {
                    if let Some(entry) = cache.get(&index) {
                        out.push(entry.clone());
                        continue;
                    }
                    if let Some(bytes) = logs.get(log_key(index)).map_err(read_err)? {
                        let entry = decode_entry(&bytes)?;
                        cache.put(index, entry.clone());
                        out.push(entry);
                    }
                }
                Ok(out)
            }
        }
    }
}

fn resolve_range<RB: RangeBounds<u64>>(range: RB) -> Option<(u64, Option<u64>)> {
    let start = match range.start_bound() {
        Bound::Included(&x) => x,
        Bound::Excluded(&x) => x + 1,
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(&x) => Some(x),
        Bound::Excluded(&0) => return None,
        Bound::Excluded(&x) => Some(x - 1),
        Bound::Unbounded => None,
    };
    if let Some(end) = end {
        if end < start {
            return None;
        }
    }
    Some((start, end))
}

// ── Snapshot persistence ──────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<NodeId, BasicNode>,
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Default)]
struct SnapshotContent {
    pairs: std::collections::HashMap<String, String>,
}

enum SnapshotSink {
    /// Built snapshots are not persisted. The latest installed snapshot is
    /// kept in memory so replication to lagging peers still works.
    Discard,
    Files {
        dir: PathBuf,
    },
}

impl SnapshotSink {
    fn persist(&self, stored: &StoredSnapshot) {
        let SnapshotSink::Files { dir } = self else {
            return;
        };
        let path = dir.join(format!("{}.snap", stored.meta.snapshot_id));
        match serde_json::to_vec(stored) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    warn!(path = %path.display(), error = %e, "Failed to persist snapshot");
                    return;
                }
                self.prune();
            }
            Err(e) => warn!(error = %e, "Failed to serialize snapshot"),
        }
    }

    /// Keep only the newest `SNAPSHOT_RETENTION` snapshot files.
    fn prune(&self) {
        let SnapshotSink::Files { dir } = self else {
            return;
        };
        let Ok(read) = std::fs::read_dir(dir) else {
            return;
        };
        let mut snaps: Vec<PathBuf> = read
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "snap").unwrap_or(false))
            .collect();
        snaps.sort();
        while snaps.len() > SNAPSHOT_RETENTION {
            let doomed = snaps.remove(0);
            if let Err(e) = std::fs::remove_file(&doomed) {
                warn!(path = %doomed.display(), error = %e, "Failed to prune snapshot");
            }
        }
    }

    fn load_latest(&self) -> Option<StoredSnapshot> {
        let SnapshotSink::Files { dir } = self else {
            return None;
        };
        let read = std::fs::read_dir(dir).ok()?;
        let mut snaps: Vec<PathBuf> = read
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "snap").unwrap_or(false))
            .collect();
        snaps.sort();
        let newest = snaps.pop()?;
        let bytes = std::fs::read(&newest).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

// ── Combined storage ──────────────────────────────────────────────────────────

/// sled trees mirroring the state machine for crash recovery.
struct DurableSm {
    state: sled::Tree,
    kv: sled::Tree,
}

/// Combined Raft storage: log + stable store + state machine + snapshots.
pub struct StateStore {
    backend: LogBackend,
    sink: SnapshotSink,
    durable_sm: Option<DurableSm>,
    kv: KvStore,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    latest_snapshot: Option<StoredSnapshot>,
}

impl StateStore {
    /// Open storage for the given profile. Returns the store, the shared KV
    /// handle for readers, and (in durable mode) the sled database handle so
    /// the agent can flush it on shutdown.
    pub fn open(profile: StorageProfile) -> crate::error::Result<(Self, KvStore, Option<sled::Db>)> {
        match profile {
            StorageProfile::Dev => {
                let kv = KvStore::new();
                let store = StateStore {
                    backend: LogBackend::Memory {
                        log: BTreeMap::new(),
                        vote: None,
                        committed: None,
                        last_purged: None,
                    },
                    sink: SnapshotSink::Discard,
                    durable_sm: None,
                    kv: kv.clone(),
                    last_applied: None,
                    last_membership: StoredMembership::default(),
                    latest_snapshot: None,
                };
                Ok((store, kv, None))
            }
            StorageProfile::Durable { dir } => {
                let snapshots = dir.join("snapshots");
                std::fs::create_dir_all(&snapshots)
                    .map_err(|e| crate::error::Error::Storage(format!("create {}: {e}", snapshots.display())))?;
                let db = sled::Config::new()
                    .path(dir.join("raft.db"))
                    .open()
                    .map_err(|e| crate::error::Error::Storage(format!("open raft.db: {e}")))?;
                let logs = db
                    .open_tree("logs")
                    .map_err(|e| crate::error::Error::Storage(e.to_string()))?;
                let meta = db
                    .open_tree("meta")
                    .map_err(|e| crate::error::Error::Storage(e.to_string()))?;
                let state = db
                    .open_tree("state")
                    .map_err(|e| crate::error::Error::Storage(e.to_string()))?;
                let kv_tree = db
                    .open_tree("kv")
                    .map_err(|e| crate::error::Error::Storage(e.to_string()))?;

                // Recover the state machine mirror.
                let kv = KvStore::new();
                let mut pairs = std::collections::HashMap::new();
                for item in kv_tree.iter() {
                    let (k, v) =
                        item.map_err(|e| crate::error::Error::Storage(e.to_string()))?;
                    pairs.insert(
                        String::from_utf8_lossy(&k).into_owned(),
                        String::from_utf8_lossy(&v).into_owned(),
                    );
                }
                let recovered = pairs.len();
                kv.replace(pairs);

                let last_applied = state
                    .get(SM_LAST_APPLIED)
                    .map_err(|e| crate::error::Error::Storage(e.to_string()))?
                    .and_then(|v| serde_json::from_slice(&v).ok());
                let last_membership = state
                    .get(SM_MEMBERSHIP)
                    .map_err(|e| crate::error::Error::Storage(e.to_string()))?
                    .and_then(|v| serde_json::from_slice(&v).ok())
                    .unwrap_or_default();

                let sink = SnapshotSink::Files { dir: snapshots };
                let latest_snapshot = sink.load_latest();

                if recovered > 0 || last_applied.is_some() {
                    info!(
                        pairs = recovered,
                        last_applied = ?last_applied,
                        "Recovered state machine from durable store"
                    );
                }

                let store = StateStore {
                    backend: LogBackend::Durable {
                        logs,
                        meta,
                        cache: LruCache::new(
                            NonZeroUsize::new(LOG_CACHE_ENTRIES).expect("nonzero cache size"),
                        ),
                    },
                    sink,
                    durable_sm: Some(DurableSm {
                        state,
                        kv: kv_tree,
                    }),
                    kv: kv.clone(),
                    last_applied,
                    last_membership,
                    latest_snapshot,
                };
                Ok((store, kv, Some(db)))
            }
        }
    }

    /// True when no vote, no log, and no applied state exist; used for the
    /// bootstrap decision.
    pub fn is_pristine(&mut self) -> bool {
        let vote = self.backend.read_vote().unwrap_or(None);
        let last = self.backend.last_log_id().unwrap_or(None);
        vote.is_none() && last.is_none() && self.last_applied.is_none()
    }

    fn persist_sm_meta(&self) -> Result<(), StorageError<NodeId>> {
        let Some(sm) = &self.durable_sm else {
            return Ok(());
        };
        if let Some(applied) = &self.last_applied {
            let bytes = serde_json::to_vec(applied).map_err(write_err)?;
            sm.state.insert(SM_LAST_APPLIED, bytes).map_err(write_err)?;
        }
        let bytes = serde_json::to_vec(&self.last_membership).map_err(write_err)?;
        sm.state.insert(SM_MEMBERSHIP, bytes).map_err(write_err)?;
        Ok(())
    }

    fn apply_command(&self, frame: &[u8], index: u64) -> Applied {
        match Command::decode(frame) {
            Ok(command) => {
                let outcome = self.kv.apply(&command);
                if let Some(sm) = &self.durable_sm {
                    let result = match &command {
                        Command::SetPair { key, value } => sm
                            .kv
                            .insert(key.as_bytes(), value.as_bytes())
                            .map(|_| ()),
                        Command::DeletePair { key } => {
                            sm.kv.remove(key.as_bytes()).map(|_| ())
                        }
                    };
                    if let Err(e) = result {
                        warn!(index, error = %e, "Failed to mirror command to durable store");
                    }
                }
                outcome
            }
            Err(e) => {
                // A poisoned entry is skipped; the map is untouched and the
                // error is surfaced only to the local submitter.
                error!(index, error = %e, "Dropping undecodable log command");
                Applied::rejected(format!("undecodable command: {e}"))
            }
        }
    }

    fn restore_from_snapshot(&mut self, data: &[u8]) -> Result<(), StorageError<NodeId>> {
        let content: SnapshotContent = bincode::deserialize(data)
            .map_err(|e| {
                StorageError::IO {
                    source: StorageIOError::new(
                        ErrorSubject::Snapshot(None),
                        ErrorVerb::Read,
                        AnyError::new(&e),
                    ),
                }
            })?;
        if let Some(sm) = &self.durable_sm {
            sm.kv.clear().map_err(write_err)?;
            for (k, v) in &content.pairs {
                sm.kv.insert(k.as_bytes(), v.as_bytes()).map_err(write_err)?;
            }
        }
        self.kv.replace(content.pairs);
        Ok(())
    }
}

// ── openraft storage traits ───────────────────────────────────────────────────

pub struct LogReader {
    view: LogView,
}

enum LogView {
    Memory(BTreeMap<u64, Entry<TypeConfig>>),
    Durable(sled::Tree),
}

impl RaftLogReader<TypeConfig> for LogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        let Some((start, end)) = resolve_range(range) else {
            return Ok(Vec::new());
        };
        match &self.view {
            LogView::Memory(log) => {
                let iter: Box<dyn Iterator<Item = &Entry<TypeConfig>>> = match end {
                    Some(end) => Box::new(log.range(start..=end).map(|(_, e)| e)),
                    None => Box::new(log.range(start..).map(|(_, e)| e)),
                };
                Ok(iter.cloned().collect())
            }
            LogView::Durable(logs) => {
                let upper = match end {
                    Some(end) => end,
                    None => match logs.last().map_err(read_err)? {
                        Some((k, _)) => {
                            u64::from_be_bytes(k.as_ref().try_into().unwrap_or([0; 8]))
                        }
                        None => return Ok(Vec::new()),
                    },
                };
                let mut out = Vec::new();
                for index in start..=upper {
                    if let Some(bytes) = logs.get(log_key(index)).map_err(read_err)? {
                        out.push(decode_entry(&bytes)?);
                    }
                }
                Ok(out)
            }
        }
    }
}

impl RaftLogReader<TypeConfig> for StateStore {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        let Some((start, end)) = resolve_range(range) else {
            return Ok(Vec::new());
        };
        self.backend.entries_between(start, end)
    }
}

/// Serializes a copy of the map taken under a brief exclusive section; the
/// heavy serialization work happens out here, not under the lock.
pub struct SnapshotBuilder {
    pairs: std::collections::HashMap<String, String>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    persist_dir: Option<PathBuf>,
}

impl RaftSnapshotBuilder<TypeConfig> for SnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let content = SnapshotContent {
            pairs: std::mem::take(&mut self.pairs),
        };
        let data = bincode::serialize(&content).map_err(|e| StorageError::IO {
            source: StorageIOError::new(
                ErrorSubject::Snapshot(None),
                ErrorVerb::Write,
                AnyError::new(&e),
            ),
        })?;

        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let snapshot_id = format!(
            "{}-{}",
            self.last_applied.map(|id| id.index).unwrap_or(0),
            millis
        );

        let meta = SnapshotMeta {
            last_log_id: self.last_applied,
            last_membership: self.last_membership.clone(),
            snapshot_id,
        };

        if let Some(dir) = &self.persist_dir {
            let sink = SnapshotSink::Files { dir: dir.clone() };
            sink.persist(&StoredSnapshot {
                meta: meta.clone(),
                data: data.clone(),
            });
        }

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for StateStore {
    type LogReader = LogReader;
    type SnapshotBuilder = SnapshotBuilder;

    // ── Vote ──────────────────────────────────────────────────────────────

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.backend.save_vote(vote)
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        self.backend.read_vote()
    }

    // ── Log ───────────────────────────────────────────────────────────────

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged = self.backend.last_purged()?;
        let last = self.backend.last_log_id()?.or(last_purged);
        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.backend.save_committed(committed)
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        self.backend.read_committed()
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        let view = match &self.backend {
            LogBackend::Memory { log, .. } => LogView::Memory(log.clone()),
            LogBackend::Durable { logs, .. } => LogView::Durable(logs.clone()),
        };
        LogReader { view }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        self.backend.append(entries.into_iter().collect())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.backend.truncate_since(log_id.index)
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.backend.purge_upto(log_id)
    }

    // ── State machine ─────────────────────────────────────────────────────

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<Applied>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            self.last_applied = Some(*entry.get_log_id());

            match &entry.payload {
                EntryPayload::Blank => responses.push(Applied::ok("noop")),
                EntryPayload::Normal(RawCommand(frame)) => {
                    responses.push(self.apply_command(frame, entry.get_log_id().index));
                }
                EntryPayload::Membership(m) => {
                    self.last_membership =
                        StoredMembership::new(Some(*entry.get_log_id()), m.clone());
                    responses.push(Applied::ok("membership change applied"));
                }
            }
        }

        self.persist_sm_meta()?;
        Ok(responses)
    }

    // ── Snapshots ─────────────────────────────────────────────────────────

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        let persist_dir = match &self.sink {
            SnapshotSink::Files { dir } => Some(dir.clone()),
            SnapshotSink::Discard => None,
        };
        SnapshotBuilder {
            // Brief exclusive section: clone the map, serialize later.
            pairs: self.kv.dump(),
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            persist_dir,
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();
        self.restore_from_snapshot(&data)?;
        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        self.persist_sm_meta()?;

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data,
        };
        self.sink.persist(&stored);
        self.latest_snapshot = Some(stored);
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.latest_snapshot.as_ref().map(|s| Snapshot {
            meta: s.meta.clone(),
            snapshot: Box::new(Cursor::new(s.data.clone())),
        }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
