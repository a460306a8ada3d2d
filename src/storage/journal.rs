use crate::raft::types::{LogEntry, LogIndex, NodeId, SnapshotMeta, Term};
use crate::util::errors::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Length, payload CRC32 and header CRC32 in front of every record
const RECORD_HEADER_SIZE: usize = 12;
/// Larger lengths can only come from a damaged header
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Persistent state that must survive crashes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term server has seen (initialized to 0)
    pub current_term: Term,
    /// Candidate that received vote in current term (or None)
    pub voted_for: Option<NodeId>,
}

/// One durable journal record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalRecord {
    Entry(LogEntry),
    /// Drop every entry with index >= from_index
    Truncate { from_index: LogIndex },
    HardState(PersistentState),
    /// Everything up to the checkpoint lives in the full dump
    Checkpoint(SnapshotMeta),
}

impl JournalRecord {
    /// `[len u32][payload crc32 u32][header crc32 u32][bincode payload]`,
    /// little endian. The header CRC covers the first eight bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        if payload.len() > MAX_RECORD_SIZE {
            return Err(RaftError::StorageError(format!(
                "journal record of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_RECORD_SIZE
            )));
        }
        let crc = crc32fast::hash(&payload);

        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc.to_le_bytes());
        let header_crc = crc32fast::hash(&record[..8]);
        record.extend_from_slice(&header_crc.to_le_bytes());
        record.extend_from_slice(&payload);
        Ok(record)
    }
}

/// Log state rebuilt from a journal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JournalState {
    pub checkpoint: SnapshotMeta,
    pub hard_state: PersistentState,
    pub entries: Vec<LogEntry>,
}

impl JournalState {
    fn apply(&mut self, record: JournalRecord) -> Result<()> {
        match record {
            JournalRecord::Entry(entry) => {
                let expected = self
                    .entries
                    .last()
                    .map(|e| e.index)
                    .unwrap_or(self.checkpoint.last_included_index)
                    + 1;
                if entry.index < expected && entry.index <= self.checkpoint.last_included_index {
                    // Already folded into the checkpoint
                    return Ok(());
                }
                if entry.index != expected {
                    return Err(RaftError::LogInconsistency);
                }
                self.entries.push(entry);
            }
            JournalRecord::Truncate { from_index } => {
                self.entries.retain(|e| e.index < from_index);
            }
            JournalRecord::HardState(state) => {
                self.hard_state = state;
            }
            JournalRecord::Checkpoint(meta) => {
                self.entries.retain(|e| e.index > meta.last_included_index);
                if let Some(first) = self.entries.first() {
                    if first.index != meta.last_included_index + 1 {
                        self.entries.clear();
                    }
                }
                self.checkpoint = meta;
            }
        }
        Ok(())
    }

    /// Records that reproduce this state on their own
    pub fn to_records(&self) -> Vec<JournalRecord> {
        let mut records = Vec::with_capacity(self.entries.len() + 2);
        records.push(JournalRecord::Checkpoint(self.checkpoint));
        records.push(JournalRecord::HardState(self.hard_state.clone()));
        records.extend(self.entries.iter().cloned().map(JournalRecord::Entry));
        records
    }
}

fn read_u32(buffer: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buffer[at], buffer[at + 1], buffer[at + 2], buffer[at + 3]])
}

/// Decode a journal image. Returns the state and the length of the valid
/// prefix; a record cut short by a crash is left out of that prefix.
///
/// A record only counts as a torn tail when it is the last thing in the
/// file: a short header, an intact header whose payload runs past the end,
/// or a final payload failing its CRC. Damage anywhere else is fatal.
pub fn replay_bytes(buffer: &[u8]) -> Result<(JournalState, usize)> {
    let mut state = JournalState::default();
    let mut offset = 0;

    while offset < buffer.len() {
        if buffer.len() - offset < RECORD_HEADER_SIZE {
            break;
        }

        let len = read_u32(buffer, offset) as usize;
        let stored_crc = read_u32(buffer, offset + 4);
        let header_crc = read_u32(buffer, offset + 8);

        if crc32fast::hash(&buffer[offset..offset + 8]) != header_crc {
            // Zero-filled space past the last write is not damage
            if buffer[offset..].iter().all(|byte| *byte == 0) {
                break;
            }
            return Err(RaftError::Corruption(format!(
                "journal record header at offset {} is damaged",
                offset
            )));
        }
        if len > MAX_RECORD_SIZE {
            return Err(RaftError::Corruption(format!(
                "journal record at offset {} claims {} bytes",
                offset, len
            )));
        }

        let end = offset + RECORD_HEADER_SIZE + len;
        if end > buffer.len() {
            break;
        }

        let payload = &buffer[offset + RECORD_HEADER_SIZE..end];
        let decoded = if crc32fast::hash(payload) == stored_crc {
            bincode::deserialize::<JournalRecord>(payload).ok()
        } else {
            None
        };

        match decoded {
            Some(record) => state.apply(record)?,
            None if end == buffer.len() => break,
            None => {
                return Err(RaftError::Corruption(format!(
                    "journal record at offset {} is damaged",
                    offset
                )))
            }
        }

        offset = end;
    }

    Ok((state, offset))
}

/// Trait for the durable write-ahead journal
pub trait Journal: Send {
    /// Rebuild the logged state; called once at startup
    fn load(&mut self) -> Result<JournalState>;
    /// Durably append one record
    fn append(&mut self, record: &JournalRecord) -> Result<()>;
    /// Atomically replace the whole journal
    fn rewrite(&mut self, records: &[JournalRecord]) -> Result<()>;
}

/// Append-only journal file, fsynced on every record
pub struct FileJournal {
    path: PathBuf,
    file: File,
}

impl FileJournal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl Journal for FileJournal {
    fn load(&mut self) -> Result<JournalState> {
        let mut buffer = Vec::new();
        File::open(&self.path)?.read_to_end(&mut buffer)?;

        let (state, valid_len) = replay_bytes(&buffer)?;

        if valid_len < buffer.len() {
            tracing::warn!(
                "Journal {} has an incomplete trailing record, truncating {} bytes",
                self.path.display(),
                buffer.len() - valid_len
            );
            self.file.set_len(valid_len as u64)?;
            self.file.sync_all()?;
        }

        tracing::info!(
            "Loaded {} journal entries from {} (checkpoint at {})",
            state.entries.len(),
            self.path.display(),
            state.checkpoint.last_included_index
        );

        Ok(state)
    }

    fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let encoded = record.encode()?;
        self.file.write_all(&encoded)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn rewrite(&mut self, records: &[JournalRecord]) -> Result<()> {
        let temp_path = self.temp_path();

        {
            let mut temp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            for record in records {
                temp.write_all(&record.encode()?)?;
            }
            temp.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;
        self.file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)?;

        tracing::info!(
            "Rewrote journal {} with {} records",
            self.path.display(),
            records.len()
        );

        Ok(())
    }
}

/// Journal kept in memory, used when no journal file is configured
#[derive(Default)]
pub struct MemoryJournal {
    records: Vec<JournalRecord>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[JournalRecord] {
        &self.records
    }
}

impl Journal for MemoryJournal {
    fn load(&mut self) -> Result<JournalState> {
        let mut state = JournalState::default();
        for record in self.records.iter().cloned() {
            state.apply(record)?;
        }
        Ok(state)
    }

    fn append(&mut self, record: &JournalRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn rewrite(&mut self, records: &[JournalRecord]) -> Result<()> {
        self.records = records.to_vec();
        Ok(())
    }
}
