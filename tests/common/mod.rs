#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use syncraft::application::{KeyValueStore, KvCommand, KvReader};
use syncraft::network::MemoryNetwork;
use syncraft::raft::{Node, NodeOptions, NodeStatus};
use syncraft::{CommandHandle, Config, StateMachine};

pub const STEP: Duration = Duration::from_millis(5);

pub fn fast_config() -> Config {
    Config {
        auto_tick: false,
        append_entries_period_ms: 10,
        raft_min_timeout_ms: 50,
        raft_max_timeout_ms: 100,
        connection_timeout_ms: 100,
        ..Default::default()
    }
}

pub fn set(key: &str, value: &str) -> Vec<u8> {
    KvCommand::Set {
        key: key.to_string(),
        value: value.to_string(),
    }
    .encode()
    .unwrap()
}

/// Commands in the order a node applied them, reset by a snapshot restore
pub type History = Arc<Mutex<Vec<Vec<u8>>>>;

/// Key-value store that also records every command it applies
pub struct RecordingStore {
    store: KeyValueStore,
    history: History,
}

impl RecordingStore {
    pub fn new(store: KeyValueStore, history: History) -> Self {
        Self { store, history }
    }
}

impl StateMachine for RecordingStore {
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        self.history.lock().push(command.to_vec());
        self.store.apply(command)
    }

    fn snapshot(&self) -> syncraft::Result<Vec<u8>> {
        self.store.snapshot()
    }

    fn restore(&mut self, snapshot: &[u8]) -> syncraft::Result<()> {
        self.history.lock().clear();
        self.store.restore(snapshot)
    }
}

/// In-memory cluster ticked on a virtual clock
pub struct Cluster {
    pub network: MemoryNetwork,
    pub ids: Vec<String>,
    pub nodes: BTreeMap<String, Node>,
    pub readers: BTreeMap<String, KvReader>,
    pub histories: BTreeMap<String, History>,
    pub now: Instant,
    /// term -> leader seen in that term
    leaders_by_term: HashMap<u64, String>,
}

impl Cluster {
    pub fn new(ids: &[&str], config: impl Fn(&str) -> Config) -> Self {
        let mut cluster = Self {
            network: MemoryNetwork::new(),
            ids: ids.iter().map(|id| id.to_string()).collect(),
            nodes: BTreeMap::new(),
            readers: BTreeMap::new(),
            histories: BTreeMap::new(),
            now: Instant::now(),
            leaders_by_term: HashMap::new(),
        };
        for id in ids {
            let peers: Vec<String> = ids
                .iter()
                .filter(|other| *other != id)
                .map(|other| other.to_string())
                .collect();
            cluster.start(id, &peers, config(id));
        }
        cluster
    }

    /// Create (or recreate) a node and attach it to the network
    pub fn start(&mut self, id: &str, peers: &[String], config: Config) {
        let store = KeyValueStore::new();
        let history = History::default();
        self.readers.insert(id.to_string(), store.reader());
        self.histories.insert(id.to_string(), history.clone());
        let node = Node::new(
            id,
            peers,
            config,
            Box::new(RecordingStore::new(store, history)),
            Box::new(self.network.register(id)),
            NodeOptions::default(),
        )
        .unwrap();
        self.nodes.insert(id.to_string(), node);
    }

    /// Take a node out of the cluster; its mailbox keeps filling up
    pub fn stop(&mut self, id: &str) -> Node {
        let mut node = self.nodes.remove(id).unwrap();
        node.shutdown();
        node
    }

    pub fn node(&self, id: &str) -> &Node {
        &self.nodes[id]
    }

    pub fn status(&self, id: &str) -> NodeStatus {
        self.nodes[id].status()
    }

    pub fn reader(&self, id: &str) -> &KvReader {
        &self.readers[id]
    }

    pub fn history(&self, id: &str) -> Vec<Vec<u8>> {
        self.histories[id].lock().clone()
    }

    pub fn submit(&self, id: &str, command: Vec<u8>) -> CommandHandle {
        self.nodes[id].handle().submit(command)
    }

    /// Advance the clock one step and tick every running node
    pub fn tick(&mut self) {
        self.now += STEP;
        let now = self.now;
        for node in self.nodes.values_mut() {
            node.tick_at(now).unwrap();
        }
        self.check_election_safety();
    }

    pub fn run_for(&mut self, duration: Duration) {
        let until = self.now + duration;
        while self.now < until {
            self.tick();
        }
    }

    /// Tick until `done` holds; panics after `limit` of virtual time
    pub fn run_until(&mut self, limit: Duration, done: impl Fn(&Cluster) -> bool) {
        let until = self.now + limit;
        while self.now < until {
            self.tick();
            if done(self) {
                return;
            }
        }
        panic!("cluster did not reach the expected state in {:?}", limit);
    }

    pub fn leaders(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.is_leader())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// The only leader among running nodes, if there is exactly one
    pub fn leader(&self) -> Option<String> {
        match self.leaders().as_slice() {
            [leader] => Some(leader.clone()),
            _ => None,
        }
    }

    pub fn followers(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| !node.is_leader())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn elect(&mut self) -> String {
        self.run_until(Duration::from_secs(10), |c| {
            c.leader()
                .map(|leader| c.status(&leader).ready)
                .unwrap_or(false)
        });
        self.leader().unwrap()
    }

    /// Every running node has applied everything the leader committed
    pub fn converged(&self) -> bool {
        let leader = match self.leader() {
            Some(leader) => leader,
            None => return false,
        };
        let commit = self.status(&leader).commit_index;
        self.nodes
            .values()
            .all(|node| node.status().last_applied == commit)
    }

    /// Run until a result arrives for `handle`
    pub fn wait_for(&mut self, handle: &CommandHandle) -> syncraft::client::CommandResult {
        let until = self.now + Duration::from_secs(10);
        while self.now < until {
            self.tick();
            if let Some(result) = handle.try_result() {
                return result;
            }
        }
        panic!("command never resolved");
    }

    fn check_election_safety(&mut self) {
        for node in self.nodes.values() {
            let status = node.status();
            if !status.is_leader() {
                continue;
            }
            let previous = self
                .leaders_by_term
                .entry(status.current_term)
                .or_insert_with(|| status.self_id.clone());
            assert_eq!(
                *previous, status.self_id,
                "two leaders in term {}",
                status.current_term
            );
        }
    }
}
