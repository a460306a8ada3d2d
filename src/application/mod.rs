pub mod kv;

pub use kv::{KeyValueStore, KvCommand, KvReader};

use crate::util::errors::Result;

/// The replicated object. Commands reach `apply` in log order on every node.
pub trait StateMachine: Send {
    /// Apply one committed command; the returned bytes go back to the
    /// submitter if it lives on this node
    fn apply(&mut self, command: &[u8]) -> Vec<u8>;

    /// Full state, taken at the current applied index
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the whole state with a snapshot
    fn restore(&mut self, snapshot: &[u8]) -> Result<()>;
}
