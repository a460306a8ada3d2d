use crate::raft::types::{ClusterMember, NodeId, SnapshotMeta};
use crate::util::errors::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Dump file format version.
const DUMP_VERSION: u32 = 1;
/// Magic bytes for dump files.
const DUMP_MAGIC: &[u8; 4] = b"SRDP";

/// Keeps concurrent writers of the same dump off each other's temp file
static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Progress of a full-dump write.
///
/// `Success` and `Failed` are each reported exactly once, after which the
/// serializer goes back to `NotSerializing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializerState {
    NotSerializing,
    Serializing,
    Success,
    Failed,
}

/// Everything needed to rebuild a node up to `meta.last_included_index`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub meta: SnapshotMeta,
    /// Membership in force at the snapshot point
    pub members: Vec<ClusterMember>,
    /// Opaque application state
    pub state: Vec<u8>,
}

/// Writes a full dump. Returning `Serializing` means the write continues in
/// the background and `poll` reports its completion.
pub trait SnapshotSerializer: Send {
    fn serialize(&mut self, path: &Path, data: Arc<SnapshotData>) -> SerializerState;

    fn poll(&mut self) -> SerializerState {
        SerializerState::NotSerializing
    }

    /// Block until the running write, if any, has finished
    fn wait(&mut self) -> SerializerState {
        loop {
            match self.poll() {
                SerializerState::Serializing => std::thread::sleep(Duration::from_millis(5)),
                state => return state,
            }
        }
    }
}

/// Reads back what the paired serializer wrote
pub trait SnapshotDeserializer: Send {
    fn deserialize(&mut self, path: &Path) -> Result<SnapshotData>;
}

pub fn write_dump(path: &Path, data: &SnapshotData) -> Result<()> {
    let mut temp_name = path.as_os_str().to_os_string();
    temp_name.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    ));
    let temp_path = PathBuf::from(temp_name);

    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(DUMP_MAGIC)?;
        writer.write_all(&DUMP_VERSION.to_le_bytes())?;
        bincode::serialize_into(&mut writer, data)?;
        let file = writer
            .into_inner()
            .map_err(|e| RaftError::IoError(e.into_error()))?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)?;
    Ok(())
}

pub fn read_dump(path: &Path) -> Result<SnapshotData> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != DUMP_MAGIC {
        return Err(RaftError::Corruption(format!(
            "{} is not a full dump file",
            path.display()
        )));
    }

    let mut version = [0u8; 4];
    reader.read_exact(&mut version)?;
    let version = u32::from_le_bytes(version);
    if version != DUMP_VERSION {
        return Err(RaftError::Corruption(format!(
            "unsupported dump version {}",
            version
        )));
    }

    Ok(bincode::deserialize_from(reader)?)
}

/// Built-in binary format, optionally written from a worker thread
pub struct BuiltinSerializer {
    background: bool,
    worker: Option<JoinHandle<Result<()>>>,
}

impl BuiltinSerializer {
    pub fn new(background: bool) -> Self {
        Self {
            background,
            worker: None,
        }
    }
}

impl SnapshotSerializer for BuiltinSerializer {
    fn serialize(&mut self, path: &Path, data: Arc<SnapshotData>) -> SerializerState {
        if !self.background {
            return match write_dump(path, &data) {
                Ok(()) => SerializerState::Success,
                Err(e) => {
                    tracing::error!("Failed to write full dump {}: {}", path.display(), e);
                    SerializerState::Failed
                }
            };
        }

        let path = path.to_path_buf();
        let spawned = std::thread::Builder::new()
            .name("syncraft-dump".to_string())
            .spawn(move || write_dump(&path, &data));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                SerializerState::Serializing
            }
            Err(e) => {
                tracing::error!("Failed to start dump thread: {}", e);
                SerializerState::Failed
            }
        }
    }

    fn poll(&mut self) -> SerializerState {
        let finished = match &self.worker {
            None => return SerializerState::NotSerializing,
            Some(handle) => handle.is_finished(),
        };
        if !finished {
            return SerializerState::Serializing;
        }

        match self.worker.take().map(|handle| handle.join()) {
            Some(Ok(Ok(()))) => SerializerState::Success,
            Some(Ok(Err(e))) => {
                tracing::error!("Background dump failed: {}", e);
                SerializerState::Failed
            }
            _ => {
                tracing::error!("Background dump thread panicked");
                SerializerState::Failed
            }
        }
    }
}

struct BuiltinDeserializer;

impl SnapshotDeserializer for BuiltinDeserializer {
    fn deserialize(&mut self, path: &Path) -> Result<SnapshotData> {
        read_dump(path)
    }
}

/// Serializer strategy: built-in unless both custom halves are supplied
pub enum SerializerStrategy {
    Builtin(BuiltinSerializer),
    External {
        serializer: Box<dyn SnapshotSerializer>,
        deserializer: Box<dyn SnapshotDeserializer>,
    },
}

impl SerializerStrategy {
    fn serializer(&mut self) -> &mut dyn SnapshotSerializer {
        match self {
            SerializerStrategy::Builtin(builtin) => builtin,
            SerializerStrategy::External { serializer, .. } => serializer.as_mut(),
        }
    }

    fn deserialize(&mut self, path: &Path) -> Result<SnapshotData> {
        match self {
            SerializerStrategy::Builtin(_) => BuiltinDeserializer.deserialize(path),
            SerializerStrategy::External { deserializer, .. } => deserializer.deserialize(path),
        }
    }
}

/// Compaction thresholds
#[derive(Debug, Clone)]
pub struct CompactionPolicy {
    pub min_entries: usize,
    pub min_time: Duration,
    pub split: bool,
}

/// True while `self_id` owns its compaction slot: the period is divided
/// into one slot per member (sorted by address) and a member compacts only
/// during the first 30% of its slot.
pub fn in_compaction_window(
    members: &[NodeId],
    self_id: &NodeId,
    period: Duration,
    since_epoch: Duration,
) -> bool {
    let mut sorted: Vec<&NodeId> = members.iter().collect();
    sorted.sort();
    sorted.dedup();

    let position = match sorted.iter().position(|m| *m == self_id) {
        Some(position) => position as u128,
        None => return true,
    };

    let period_ms = period.as_millis().max(1);
    let now_ms = since_epoch.as_millis();
    let slot = (period_ms / sorted.len() as u128).max(1);
    let window = (slot * 3 / 10).max(1);

    let period_start = now_ms / period_ms * period_ms;
    let start = period_start + position * slot;
    now_ms >= start && now_ms < start + window
}

/// Decides when to compact, runs the dump, keeps the latest snapshot
pub struct SnapshotManager {
    path: Option<PathBuf>,
    strategy: SerializerStrategy,
    policy: CompactionPolicy,
    last_compaction: Instant,
    in_progress: Option<Arc<SnapshotData>>,
    /// Outcome of a synchronous write, reported by the next `poll`
    finished: Option<SerializerState>,
    latest: Option<Arc<SnapshotData>>,
}

impl SnapshotManager {
    pub fn new(
        path: Option<PathBuf>,
        strategy: SerializerStrategy,
        policy: CompactionPolicy,
    ) -> Self {
        Self {
            path,
            strategy,
            policy,
            last_compaction: Instant::now(),
            in_progress: None,
            finished: None,
            latest: None,
        }
    }

    pub fn latest(&self) -> Option<Arc<SnapshotData>> {
        self.latest.clone()
    }

    pub fn is_serializing(&self) -> bool {
        self.in_progress.is_some()
    }

    /// Read the dump file, if one exists
    pub fn load(&mut self) -> Result<Option<SnapshotData>> {
        let path = match &self.path {
            Some(path) if path.exists() => path.clone(),
            _ => return Ok(None),
        };

        let data = self.strategy.deserialize(&path)?;
        tracing::info!(
            "Loaded full dump {} (last included index {}, term {})",
            path.display(),
            data.meta.last_included_index,
            data.meta.last_included_term
        );
        self.latest = Some(Arc::new(data.clone()));
        Ok(Some(data))
    }

    /// Both thresholds must be met, and the split window must be open
    pub fn should_compact(
        &self,
        log_len: usize,
        now: Instant,
        members: &[NodeId],
        self_id: &NodeId,
        since_epoch: Duration,
    ) -> bool {
        if self.in_progress.is_some() || self.finished.is_some() {
            return false;
        }
        if log_len <= self.policy.min_entries {
            return false;
        }
        if now.duration_since(self.last_compaction) < self.policy.min_time {
            return false;
        }
        if self.policy.split
            && !in_compaction_window(members, self_id, self.policy.min_time, since_epoch)
        {
            return false;
        }
        true
    }

    /// Start writing a dump of `data`
    pub fn begin(&mut self, data: SnapshotData, now: Instant) {
        self.last_compaction = now;
        let data = Arc::new(data);

        tracing::info!(
            "Starting log compaction at index {}",
            data.meta.last_included_index
        );

        let state = match &self.path {
            Some(path) => self.strategy.serializer().serialize(path, data.clone()),
            None => SerializerState::Success,
        };

        self.in_progress = Some(data);
        match state {
            SerializerState::Serializing => {}
            SerializerState::NotSerializing => self.finished = Some(SerializerState::Success),
            done => self.finished = Some(done),
        }
    }

    /// Report the running dump's progress. On `Success` the new snapshot
    /// becomes `latest`; the caller then truncates the log.
    pub fn poll(&mut self) -> SerializerState {
        if self.in_progress.is_none() {
            return SerializerState::NotSerializing;
        }

        let state = match self.finished.take() {
            Some(state) => state,
            None => self.strategy.serializer().poll(),
        };

        match state {
            SerializerState::Success => {
                self.latest = self.in_progress.take();
            }
            SerializerState::Failed => {
                self.in_progress = None;
                tracing::warn!("Log compaction failed, log left untouched");
            }
            SerializerState::Serializing => {}
            SerializerState::NotSerializing => {
                // A custom serializer lost track of its job
                self.in_progress = None;
                return SerializerState::Failed;
            }
        }
        state
    }

    /// Persist a snapshot received from the leader before the log is reset.
    /// A local dump still being written is waited out and dropped first.
    pub fn install(&mut self, data: SnapshotData) -> Result<()> {
        if self.in_progress.take().is_some() {
            let outcome = self.strategy.serializer().wait();
            tracing::info!(
                "Dropped local compaction ({:?}) in favour of a received snapshot",
                outcome
            );
        }
        self.finished = None;

        let data = Arc::new(data);
        if let Some(path) = self.path.clone() {
            match &mut self.strategy {
                SerializerStrategy::Builtin(_) => write_dump(&path, &data)?,
                SerializerStrategy::External { serializer, .. } => {
                    let state = match serializer.serialize(&path, data.clone()) {
                        SerializerState::Serializing => serializer.wait(),
                        state => state,
                    };
                    if state == SerializerState::Failed {
                        return Err(RaftError::StorageError(
                            "failed to persist installed snapshot".to_string(),
                        ));
                    }
                }
            }
        }

        self.latest = Some(data);
        Ok(())
    }
}
