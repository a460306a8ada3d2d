mod common;

use common::{fast_config, set, Cluster};
use std::time::Duration;
use syncraft::raft::ClusterMember;
use syncraft::Config;

fn dynamic_config() -> Config {
    let mut config = fast_config();
    config.dynamic_membership_change = true;
    config
}

fn addresses(cluster: &Cluster, id: &str) -> Vec<String> {
    cluster
        .status(id)
        .members
        .into_iter()
        .map(|member| member.address)
        .collect()
}

#[test]
fn add_and_remove_members() {
    let mut cluster = Cluster::new(&["a", "b", "c"], |_| dynamic_config());
    let leader = cluster.elect();

    let before = cluster.submit(&leader, set("before", "join"));
    assert!(cluster.wait_for(&before).is_ok());

    let add = cluster
        .node(&leader)
        .handle()
        .add_member(ClusterMember::voter("d"))
        .unwrap();
    assert!(cluster.wait_for(&add).is_ok());
    assert_eq!(addresses(&cluster, &leader), vec!["a", "b", "c", "d"]);

    // The new node knows the full cluster when it starts
    let peers: Vec<String> = ["a", "b", "c"].iter().map(|id| id.to_string()).collect();
    cluster.start("d", &peers, dynamic_config());
    cluster.run_until(Duration::from_secs(10), |c| {
        c.converged() && c.reader("d").get("before").is_some()
    });

    // Four voters need three acknowledgements
    let leader = cluster.leader().unwrap();
    let victim = if leader == "c" { "b" } else { "c" };
    let remove = cluster
        .node(&leader)
        .handle()
        .remove_member(victim)
        .unwrap();
    assert!(cluster.wait_for(&remove).is_ok());
    cluster.stop(victim);

    cluster.run_until(Duration::from_secs(2), |c| {
        c.converged()
            && c.nodes
                .keys()
                .all(|id| !addresses(c, id).contains(&victim.to_string()))
    });

    // Three members left; two of them are a quorum
    let leader = cluster.leader().unwrap();
    let handle = cluster.submit(&leader, set("after", "leave"));
    assert!(cluster.wait_for(&handle).is_ok());
    cluster.run_until(Duration::from_secs(1), |c| c.converged());
    assert_eq!(cluster.reader("d").get("after"), Some("leave".to_string()));
}

#[test]
fn static_cluster_refuses_membership_changes() {
    let cluster = Cluster::new(&["a", "b", "c"], |_| fast_config());
    let handle = cluster.node("a").handle();
    assert!(handle.add_member(ClusterMember::voter("d")).is_err());
    assert!(handle.remove_member("b").is_err());
}

#[test]
fn non_voting_member_receives_the_log() {
    let mut cluster = Cluster::new(&["a", "b", "c"], |_| dynamic_config());
    let leader = cluster.elect();

    let add = cluster
        .node(&leader)
        .handle()
        .add_member(ClusterMember {
            address: "observer".into(),
            voting: false,
        })
        .unwrap();
    assert!(cluster.wait_for(&add).is_ok());

    let peers: Vec<String> = ["a", "b", "c"].iter().map(|id| id.to_string()).collect();
    cluster.start("observer", &peers, dynamic_config());

    let handle = cluster.submit(&leader, set("seen", "by-observer"));
    assert!(cluster.wait_for(&handle).is_ok());
    cluster.run_until(Duration::from_secs(5), |c| {
        c.converged() && c.reader("observer").get("seen").is_some()
    });
    assert!(!cluster.node("observer").is_leader());
}
