use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use syncraft::application::{KeyValueStore, KvCommand, KvReader};
use syncraft::config::PollerType;
use syncraft::network::{TcpSettings, TcpTransport};
use syncraft::raft::{Node, NodeHandle, NodeOptions, Scheduler};
use syncraft::Config;

fn free_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    format!("127.0.0.1:{}", listener.local_addr().unwrap().port())
}

fn tcp_config() -> Config {
    Config {
        auto_tick: true,
        auto_tick_period_ms: 10,
        append_entries_period_ms: 20,
        raft_min_timeout_ms: 150,
        raft_max_timeout_ms: 300,
        connection_timeout_ms: 1000,
        connection_retry_time_ms: 100,
        bind_retry_time_ms: 50,
        password: Some("cluster-secret".to_string()),
        poller_type: PollerType::Single,
        ..Default::default()
    }
}

fn eventually(limit: Duration, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn three_nodes_replicate_over_tcp() {
    let addresses: Vec<String> = (0..3).map(|_| free_address()).collect();

    let mut schedulers = Vec::new();
    let mut handles: Vec<NodeHandle> = Vec::new();
    let mut readers: Vec<KvReader> = Vec::new();

    for address in &addresses {
        let config = tcp_config();
        let peers: Vec<String> = addresses
            .iter()
            .filter(|other| *other != address)
            .cloned()
            .collect();
        let transport =
            TcpTransport::start(address.clone(), TcpSettings::from_config(&config)).unwrap();
        let store = KeyValueStore::new();
        readers.push(store.reader());

        let node = Node::new(
            address.clone(),
            &peers,
            config,
            Box::new(store),
            Box::new(transport),
            NodeOptions::default(),
        )
        .unwrap();
        let scheduler = Scheduler::start(node).unwrap();
        handles.push(scheduler.handle());
        schedulers.push(scheduler);
    }

    assert!(
        eventually(Duration::from_secs(15), || {
            handles.iter().filter(|h| h.status().is_leader()).count() == 1
                && handles.iter().all(|h| h.status().leader.is_some())
        }),
        "no stable leader"
    );

    let follower = handles
        .iter()
        .find(|h| !h.status().is_leader())
        .unwrap()
        .clone();
    let command = KvCommand::Set {
        key: "transport".into(),
        value: "tcp".into(),
    }
    .encode()
    .unwrap();
    let result = follower.submit(command).wait(Duration::from_secs(10));
    assert!(matches!(result, Some(Ok(_))), "got {:?}", result);

    assert!(eventually(Duration::from_secs(10), || {
        readers
            .iter()
            .all(|r| r.get("transport") == Some("tcp".to_string()))
    }));

    for scheduler in schedulers {
        scheduler.stop().unwrap();
    }
}
