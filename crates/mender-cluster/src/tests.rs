use std::sync::Arc;
use std::time::Duration;

use mender_types::{RepairParallelism, RingRange};

use crate::sim::{SimBehavior, SimConnector, SimulatedCluster};
use crate::{
    ClusterClient, ClusterConnector, ClusterError, EndpointMap, RepairRequest, RepairStatus,
    coordinators_for,
};

fn request(range: RingRange) -> RepairRequest {
    RepairRequest {
        keyspace: "ks".into(),
        tables: Default::default(),
        range,
        parallelism: RepairParallelism::Parallel,
        incremental: false,
    }
}

fn small_map() -> EndpointMap {
    EndpointMap::from([
        (RingRange::new(0, 100), vec!["a".into(), "b".into()]),
        (RingRange::new(100, 200), vec!["b".into(), "c".into()]),
        (RingRange::new(200, 0), vec!["c".into(), "a".into()]),
    ])
}

#[test]
fn test_coordinators_for_enclosed_range() {
    let map = small_map();
    assert_eq!(
        coordinators_for(&map, &RingRange::new(10, 20)),
        vec!["a".to_string(), "b".to_string()]
    );
    assert_eq!(
        coordinators_for(&map, &RingRange::new(250, 0)),
        vec!["c".to_string(), "a".to_string()]
    );
}

#[test]
fn test_coordinators_for_range_spanning_owners() {
    assert!(coordinators_for(&small_map(), &RingRange::new(50, 150)).is_empty());
}

#[tokio::test]
async fn test_sim_endpoint_map_replication() {
    let cluster = Arc::new(SimulatedCluster::new("c1", 6, Duration::ZERO));
    cluster.add_keyspace("ks", 3, &["t1"]);
    let connector = SimConnector::new().with_cluster(cluster.clone());

    let client = connector.connect("c1-node-0").await.unwrap();
    let map = client.range_to_endpoint_map("ks").await.unwrap();
    assert_eq!(map.len(), 6);
    assert!(map.values().all(|replicas| replicas.len() == 3));

    let err = client.range_to_endpoint_map("missing").await.unwrap_err();
    assert_eq!(err, ClusterError::UnknownKeyspace("missing".into()));
}

#[tokio::test]
async fn test_connect_any_skips_down_hosts() {
    let cluster = Arc::new(SimulatedCluster::new("c1", 3, Duration::ZERO));
    cluster.set_host_down("c1-node-0", true);
    cluster.set_host_down("c1-node-1", true);
    let connector = SimConnector::new().with_cluster(cluster.clone());

    let hosts = cluster.hosts().to_vec();
    let client = connector.connect_any(&hosts).await.unwrap();
    assert_eq!(client.host(), "c1-node-2");

    cluster.set_host_down("c1-node-2", true);
    let err = connector.connect_any(&hosts).await.err().unwrap();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_sim_repair_notifications() {
    let cluster = Arc::new(SimulatedCluster::new("c1", 3, Duration::from_millis(5)));
    cluster.add_keyspace("ks", 2, &["t1"]);
    cluster.script(&[SimBehavior::Fail]);
    let connector = SimConnector::new().with_cluster(cluster.clone());
    let client = connector.connect("c1-node-1").await.unwrap();

    let mut rx = client.subscribe();
    let failed = client.trigger_repair(&request(RingRange::new(0, 10))).await.unwrap();
    let mut statuses = Vec::new();
    for _ in 0..3 {
        let n = rx.recv().await.unwrap();
        assert_eq!(n.command_id, failed);
        statuses.push(n.status);
    }
    assert_eq!(
        statuses,
        vec![
            RepairStatus::Started,
            RepairStatus::SessionFailed,
            RepairStatus::Finished
        ]
    );

    let ok = client.trigger_repair(&request(RingRange::new(10, 20))).await.unwrap();
    assert_ne!(ok, failed);
    let mut last = None;
    for _ in 0..3 {
        last = Some(rx.recv().await.unwrap().status);
    }
    assert_eq!(last, Some(RepairStatus::Finished));

    let triggered = cluster.triggered();
    assert_eq!(triggered.len(), 2);
    assert_eq!(triggered[0].host, "c1-node-1");
}

#[tokio::test]
async fn test_sim_cancel_records_host() {
    let cluster = Arc::new(SimulatedCluster::new("c1", 2, Duration::ZERO));
    let connector = SimConnector::new().with_cluster(cluster.clone());
    let client = connector.connect("c1-node-0").await.unwrap();
    client.cancel_all_repairs().await.unwrap();
    assert_eq!(cluster.cancelled(), vec!["c1-node-0".to_string()]);
    assert!(connector.connect("elsewhere").await.is_err());
}
