pub mod journal;
pub mod log_store;
pub mod snapshot;

pub use journal::{FileJournal, Journal, JournalRecord, JournalState, MemoryJournal, PersistentState};
pub use log_store::LogStore;
pub use snapshot::{
    BuiltinSerializer, CompactionPolicy, SerializerState, SerializerStrategy, SnapshotData,
    SnapshotDeserializer, SnapshotManager, SnapshotSerializer,
};
