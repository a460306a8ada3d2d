use super::journal::{Journal, JournalRecord, JournalState, PersistentState};
use crate::raft::types::{LogEntry, LogIndex, Payload, SnapshotMeta, Term};
use crate::util::errors::{RaftError, Result};

/// Entries since the last compaction point, mirrored to a journal.
///
/// Indices are global: the first retained entry has index
/// `snapshot.last_included_index + 1`.
pub struct LogStore {
    journal: Box<dyn Journal>,
    entries: Vec<LogEntry>,
    snapshot: SnapshotMeta,
    hard_state: PersistentState,
}

impl LogStore {
    /// Replay the journal into a fresh store
    pub fn open(mut journal: Box<dyn Journal>) -> Result<Self> {
        let JournalState {
            checkpoint,
            hard_state,
            entries,
        } = journal.load()?;

        Ok(Self {
            journal,
            entries,
            snapshot: checkpoint,
            hard_state,
        })
    }

    pub fn snapshot_meta(&self) -> SnapshotMeta {
        self.snapshot
    }

    pub fn hard_state(&self) -> &PersistentState {
        &self.hard_state
    }

    pub fn save_hard_state(&mut self, state: PersistentState) -> Result<()> {
        if state == self.hard_state {
            return Ok(());
        }
        self.journal.append(&JournalRecord::HardState(state.clone()))?;
        self.hard_state = state;
        Ok(())
    }

    /// Number of entries held since the last compaction
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_index(&self) -> LogIndex {
        self.snapshot.last_included_index + 1
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot.last_included_index)
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot.last_included_term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index() {
            return None;
        }
        self.entries.get((index - self.first_index()) as usize)
    }

    /// Term of the entry at `index`; known for the snapshot boundary too
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot.last_included_index {
            return Some(self.snapshot.last_included_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Entries in `[start, end]` that are still held in memory
    pub fn get_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        let start = start.max(self.first_index());
        let end = end.min(self.last_index());
        if start > end {
            return Vec::new();
        }
        let from = (start - self.first_index()) as usize;
        let to = (end - self.first_index()) as usize + 1;
        self.entries[from..to].to_vec()
    }

    /// Entries from `start` packed up to `max_bytes` (at least one entry)
    pub fn entries_from(&self, start: LogIndex, max_bytes: usize) -> Vec<LogEntry> {
        let mut batch = Vec::new();
        let mut size = 0;
        let mut index = start;

        while let Some(entry) = self.get(index) {
            let entry_size = entry.size_hint();
            if !batch.is_empty() && size + entry_size > max_bytes {
                break;
            }
            size += entry_size;
            batch.push(entry.clone());
            index += 1;
        }

        batch
    }

    /// Append entries that must continue the log without gaps
    pub fn append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        for entry in entries {
            if entry.index != self.last_index() + 1 {
                return Err(RaftError::LogInconsistency);
            }
            self.journal.append(&JournalRecord::Entry(entry.clone()))?;
            self.entries.push(entry);
        }
        Ok(())
    }

    /// Leader-side append, assigning the next index
    pub fn append_new(&mut self, term: Term, payload: Payload) -> Result<LogIndex> {
        let index = self.last_index() + 1;
        self.append(vec![LogEntry::new(term, index, payload)])?;
        Ok(index)
    }

    /// Drop `from_index` and everything after it
    pub fn truncate(&mut self, from_index: LogIndex) -> Result<()> {
        if from_index <= self.snapshot.last_included_index {
            return Err(RaftError::InvalidState(format!(
                "cannot truncate committed snapshot prefix at {}",
                from_index
            )));
        }
        if from_index > self.last_index() {
            return Ok(());
        }

        self.journal
            .append(&JournalRecord::Truncate { from_index })?;
        self.entries.truncate((from_index - self.first_index()) as usize);
        tracing::info!("Truncated log from index {}", from_index);
        Ok(())
    }

    /// Fold everything up to `meta.last_included_index` into a snapshot
    pub fn compact(&mut self, meta: SnapshotMeta) -> Result<()> {
        if meta.last_included_index <= self.snapshot.last_included_index {
            return Ok(());
        }

        let keep_from = meta.last_included_index + 1;
        let retained = if keep_from >= self.first_index()
            && self.term_at(meta.last_included_index) == Some(meta.last_included_term)
        {
            self.get_range(keep_from, self.last_index())
        } else {
            Vec::new()
        };

        let state = JournalState {
            checkpoint: meta,
            hard_state: self.hard_state.clone(),
            entries: retained,
        };
        self.journal.rewrite(&state.to_records())?;

        self.entries = state.entries;
        self.snapshot = meta;

        tracing::info!(
            "Compacted log up to index {} (term {}), {} entries retained",
            meta.last_included_index,
            meta.last_included_term,
            self.entries.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::journal::{FileJournal, MemoryJournal};
    use tempfile::TempDir;

    fn store() -> LogStore {
        LogStore::open(Box::new(MemoryJournal::new())).unwrap()
    }

    fn fill(store: &mut LogStore, count: u64, term: Term) {
        for i in 0..count {
            store
                .append_new(term, Payload::Application(vec![i as u8]))
                .unwrap();
        }
    }

    #[test]
    fn test_append_and_get() {
        let mut store = store();
        let entries = vec![
            LogEntry::application(1, 1, vec![1, 2, 3]),
            LogEntry::application(1, 2, vec![4, 5, 6]),
        ];

        store.append(entries.clone()).unwrap();

        assert_eq!(store.last_index(), 2);
        assert_eq!(store.get(1).unwrap(), &entries[0]);
        assert_eq!(store.get(2).unwrap(), &entries[1]);
        assert!(store.get(3).is_none());
    }

    #[test]
    fn test_rejects_gaps() {
        let mut store = store();
        let result = store.append(vec![LogEntry::application(1, 2, vec![])]);
        assert!(matches!(result, Err(RaftError::LogInconsistency)));
    }

    #[test]
    fn test_batch_respects_byte_cap() {
        let mut store = store();
        for _ in 0..5 {
            store
                .append_new(1, Payload::Application(vec![0; 100]))
                .unwrap();
        }

        let one = LogEntry::application(1, 1, vec![0; 100]).size_hint();
        assert_eq!(store.entries_from(1, one * 2).len(), 2);
        // Oversized entries still go out one at a time
        assert_eq!(store.entries_from(1, 1).len(), 1);
        assert_eq!(store.entries_from(4, usize::MAX).len(), 2);
    }

    #[test]
    fn test_truncate_and_reappend() {
        let mut store = store();
        fill(&mut store, 5, 1);

        store.truncate(3).unwrap();
        assert_eq!(store.last_index(), 2);

        store.append_new(2, Payload::NoOp).unwrap();
        assert_eq!(store.last_term(), 2);
        assert_eq!(store.term_at(3), Some(2));
    }

    #[test]
    fn test_compact_keeps_tail_and_boundary_term() {
        let mut store = store();
        fill(&mut store, 6, 1);

        store
            .compact(SnapshotMeta {
                last_included_index: 4,
                last_included_term: 1,
            })
            .unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.first_index(), 5);
        assert_eq!(store.last_index(), 6);
        assert_eq!(store.term_at(4), Some(1));
        assert!(store.get(4).is_none());
        assert_eq!(store.get_range(1, 6).len(), 2);
    }

    #[test]
    fn test_compact_past_log_end_resets() {
        let mut store = store();
        fill(&mut store, 2, 1);

        store
            .compact(SnapshotMeta {
                last_included_index: 10,
                last_included_term: 3,
            })
            .unwrap();

        assert!(store.is_empty());
        assert_eq!(store.last_index(), 10);
        assert_eq!(store.last_term(), 3);
    }

    #[test]
    fn test_reopen_matches_memory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("journal.bin");

        let (last_index, last_term, len) = {
            let mut store = LogStore::open(Box::new(FileJournal::open(&path).unwrap())).unwrap();
            fill(&mut store, 8, 1);
            store.truncate(7).unwrap();
            fill(&mut store, 2, 2);
            store
                .compact(SnapshotMeta {
                    last_included_index: 5,
                    last_included_term: 1,
                })
                .unwrap();
            store
                .save_hard_state(PersistentState {
                    current_term: 2,
                    voted_for: None,
                })
                .unwrap();
            (store.last_index(), store.last_term(), store.len())
        };

        let store = LogStore::open(Box::new(FileJournal::open(&path).unwrap())).unwrap();
        assert_eq!(store.last_index(), last_index);
        assert_eq!(store.last_term(), last_term);
        assert_eq!(store.len(), len);
        assert_eq!(store.hard_state().current_term, 2);
        assert_eq!(store.snapshot_meta().last_included_index, 5);
    }
}
