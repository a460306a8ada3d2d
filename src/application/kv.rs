use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::StateMachine;
use crate::util::errors::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// Replicated string map. Reads go through a `KvReader`, which sees every
/// command this node has applied so far.
#[derive(Debug, Default)]
pub struct KeyValueStore {
    data: Arc<RwLock<BTreeMap<String, String>>>,
}

#[derive(Debug, Clone)]
pub struct KvReader {
    data: Arc<RwLock<BTreeMap<String, String>>>,
}

impl KvReader {
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reader(&self) -> KvReader {
        KvReader {
            data: self.data.clone(),
        }
    }
}

impl StateMachine for KeyValueStore {
    /// Returns the previous value, bincode encoded as `Option<String>`
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        let previous = match bincode::deserialize::<KvCommand>(command) {
            Ok(KvCommand::Set { key, value }) => self.data.write().insert(key, value),
            Ok(KvCommand::Delete { key }) => self.data.write().remove(&key),
            Err(e) => {
                // Every node rejects the same bytes the same way
                tracing::warn!("Ignoring undecodable command: {}", e);
                None
            }
        };
        bincode::serialize(&previous).unwrap_or_default()
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&*self.data.read())?)
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        let restored: BTreeMap<String, String> = bincode::deserialize(snapshot)?;
        *self.data.write() = restored;
        Ok(())
    }
}
