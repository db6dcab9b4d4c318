mod common;

use common::TestCluster;
use networkdb::networkdb::EventDelegate;

const MAX_ROUNDS: usize = 20;

async fn until_converged<F>(cluster: &TestCluster, mut done: F)
where
    F: FnMut(&TestCluster) -> bool,
{
    for _ in 0..MAX_ROUNDS {
        if done(cluster) {
            return;
        }
        cluster.gossip_round().await;
    }
    assert!(done(cluster), "cluster did not converge in {} rounds", MAX_ROUNDS);
}

#[tokio::test]
async fn test_network_membership_spreads() {
    let cluster = TestCluster::new(3);
    cluster.join_all("net1").await;

    until_converged(&cluster, |c| {
        c.nodes
            .iter()
            .all(|db| db.peers("net1").map(|p| p.len() == 3).unwrap_or(false))
    })
    .await;
}

#[tokio::test]
async fn test_entries_converge_and_deletes_follow() {
    let cluster = TestCluster::new(3);
    cluster.join_all("net1").await;

    cluster
        .node(0)
        .create_entry("endpoint_table", "net1", "ep1", b"from-0".to_vec())
        .unwrap();
    cluster
        .node(1)
        .create_entry("endpoint_table", "net1", "ep2", b"from-1".to_vec())
        .unwrap();

    until_converged(&cluster, |c| {
        c.nodes.iter().all(|db| {
            db.get_entry("endpoint_table", "net1", "ep1").is_ok()
                && db.get_entry("endpoint_table", "net1", "ep2").is_ok()
        })
    })
    .await;
    let table = cluster
        .node(2)
        .get_table_by_network("endpoint_table", "net1")
        .unwrap();
    assert_eq!(table["ep1"].owner, "node-0");
    assert_eq!(table["ep2"].value, b"from-1".to_vec());

    cluster
        .node(0)
        .update_entry("endpoint_table", "net1", "ep1", b"updated".to_vec())
        .unwrap();
    until_converged(&cluster, |c| {
        c.nodes.iter().all(|db| {
            db.get_entry("endpoint_table", "net1", "ep1").ok() == Some(b"updated".to_vec())
        })
    })
    .await;

    cluster
        .node(0)
        .delete_entry("endpoint_table", "net1", "ep1")
        .unwrap();
    until_converged(&cluster, |c| {
        c.nodes
            .iter()
            .all(|db| db.get_entry("endpoint_table", "net1", "ep1").is_err())
    })
    .await;
}

#[tokio::test]
async fn test_late_joiner_catches_up_through_bulk_sync() {
    let cluster = TestCluster::new(3);
    cluster.node(0).join_network("net1").await.unwrap();
    cluster.gossip_rounds(2).await;
    cluster.node(1).join_network("net1").await.unwrap();
    cluster.gossip_rounds(2).await;

    for i in 0..10 {
        cluster
            .node(0)
            .create_entry("endpoint_table", "net1", &format!("ep{}", i), vec![i as u8])
            .unwrap();
    }
    cluster.gossip_rounds(5).await;

    // Node 2 was never in the network while the entries were gossiped
    cluster.node(2).join_network("net1").await.unwrap();
    cluster.settle().await;

    let table = cluster
        .node(2)
        .get_table_by_network("endpoint_table", "net1")
        .unwrap();
    assert_eq!(table.len(), 10);
}

#[tokio::test]
async fn test_partitioned_node_catches_up_after_heal() {
    let cluster = TestCluster::new(3);
    cluster.join_all("net1").await;

    cluster.isolate(2);
    cluster
        .node(0)
        .create_entry("endpoint_table", "net1", "ep1", b"v1".to_vec())
        .unwrap();
    cluster.gossip_rounds(8).await;
    assert!(cluster
        .node(2)
        .get_entry("endpoint_table", "net1", "ep1")
        .is_err());

    cluster.heal();
    let networks = cluster.node(2).bulk_sync(&["node-0".to_string()], true).await.unwrap();
    assert_eq!(networks, vec!["net1".to_string()]);
    cluster.settle().await;
    assert_eq!(
        cluster
            .node(2)
            .get_entry("endpoint_table", "net1", "ep1")
            .unwrap(),
        b"v1".to_vec()
    );
}

#[tokio::test]
async fn test_failed_node_entries_disappear() {
    let cluster = TestCluster::new(3);
    cluster.join_all("net1").await;

    cluster
        .node(2)
        .create_entry("endpoint_table", "net1", "ep-2", b"v".to_vec())
        .unwrap();
    until_converged(&cluster, |c| {
        c.node(0)
            .get_entry("endpoint_table", "net1", "ep-2")
            .is_ok()
    })
    .await;

    cluster.node(0).notify_leave("node-2");
    assert!(cluster
        .node(0)
        .get_entry("endpoint_table", "net1", "ep-2")
        .is_err());
    let peers = cluster.node(0).peers("net1").unwrap();
    assert!(peers.iter().all(|p| p.name != "node-2"));
}

#[tokio::test]
async fn test_leave_network_spreads() {
    let cluster = TestCluster::new(3);
    cluster.join_all("net1").await;
    cluster
        .node(1)
        .create_entry("endpoint_table", "net1", "ep1", b"v1".to_vec())
        .unwrap();
    until_converged(&cluster, |c| {
        c.node(0).get_entry("endpoint_table", "net1", "ep1").is_ok()
    })
    .await;

    cluster.node(1).leave_network("net1").unwrap();
    until_converged(&cluster, |c| {
        c.node(0).get_entry("endpoint_table", "net1", "ep1").is_err()
            && c.node(0)
                .peers("net1")
                .map(|p| p.iter().all(|p| p.name != "node-1"))
                .unwrap_or(false)
    })
    .await;
}
