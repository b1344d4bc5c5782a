//! Replication tests for the cluster runtime
//!
//! These tests run several members on an in-memory network and check that
//! replicated counters and sets converge under partitions, duplicated
//! merges and stalled replicas.

use mdcs_cluster::prelude::*;
use mdcs_cluster::{GSet, Max, MergeOperation};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn registry() -> Arc<Registry> {
    let mut registry = Registry::new();
    registry
        .register::<GCounterService>()
        .register::<GSetService<String>>();
    Arc::new(registry)
}

fn spawn(count: usize, config: ClusterConfig) -> (Arc<MemoryNetwork>, Vec<Arc<Cluster>>) {
    let network = MemoryNetwork::new();
    let clusters = network.spawn_cluster(count, config, registry()).unwrap();
    (network, clusters)
}

fn id(i: usize) -> MemberId {
    MemberId::new(format!("member-{}", i))
}

// ============================================================================
// GCounter
// ============================================================================

#[tokio::test]
async fn test_counter_reaches_every_replica() {
    let (_network, clusters) = spawn(3, ClusterConfig::default());
    let hits = assert_ok!(GCounterHandle::create(clusters[0].clone(), "hits").await);

    assert_eq!(hits.add(5).unwrap().delivered().await, 3);
    assert_eq!(hits.increment().unwrap().delivered().await, 3);

    for cluster in &clusters {
        let local = GCounterHandle::attach(cluster.clone(), "hits");
        assert_eq!(local.local_value().unwrap(), 6);
    }
    assert_eq!(hits.value().await.unwrap(), 6);
}

#[tokio::test]
async fn test_partitioned_replica_converges_after_heal() {
    let (network, clusters) = spawn(3, ClusterConfig::default());
    let hits = assert_ok!(GCounterHandle::create(clusters[0].clone(), "hits").await);
    let lagging = GCounterHandle::attach(clusters[2].clone(), "hits");

    network.isolate(&id(2));
    assert_eq!(hits.add(3).unwrap().delivered().await, 2);
    assert_eq!(lagging.local_value().unwrap(), 0);

    network.heal(&id(2));
    let report = lagging.replicas().anti_entropy().await.unwrap();
    assert!(report.pulled);
    assert_eq!(report.pushed, 0);
    assert_eq!(lagging.local_value().unwrap(), 3);

    // A second round has nothing left to do
    let report = lagging.replicas().anti_entropy().await.unwrap();
    assert!(!report.pulled);
    assert_eq!(report.pushed, 0);
}

#[tokio::test]
async fn test_push_reaches_replicas_that_are_behind() {
    let (network, clusters) = spawn(3, ClusterConfig::default());
    let hits = assert_ok!(GCounterHandle::create(clusters[0].clone(), "hits").await);

    network.isolate(&id(1));
    network.isolate(&id(2));
    assert_eq!(hits.add(9).unwrap().delivered().await, 1);
    network.heal(&id(1));
    network.heal(&id(2));

    let report = hits.replicas().anti_entropy().await.unwrap();
    assert!(!report.pulled);
    assert_eq!(report.pushed, 2);

    for cluster in &clusters[1..] {
        let replicas = GCounterHandle::attach(cluster.clone(), "hits");
        let mut attempts = 0;
        while replicas.local_value().unwrap() != 9 && attempts < 50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            attempts += 1;
        }
        assert_eq!(replicas.local_value().unwrap(), 9);
    }
}

#[tokio::test]
async fn test_duplicated_and_reordered_merges_are_harmless() {
    let (_network, clusters) = spawn(1, ClusterConfig::default());
    let hits = assert_ok!(GCounterHandle::create(clusters[0].clone(), "hits").await);
    let cluster = &clusters[0];

    for value in [4, 9, 2, 9, 9, 1] {
        cluster
            .apply::<GCounterService, _>("hits", MergeOperation::<GCounterService>::new(Max::new(value)))
            .unwrap();
    }
    assert_eq!(hits.local_value().unwrap(), 9);
}

#[tokio::test]
async fn test_read_after_partial_write() {
    let (network, clusters) = spawn(3, ClusterConfig::default());
    let writer = assert_ok!(GCounterHandle::create(clusters[0].clone(), "hits").await);

    network.isolate(&id(2));
    assert_eq!(writer.add(5).unwrap().delivered().await, 2);
    network.heal(&id(2));

    // The reader's own replica missed the write, the others did not
    let reader = GCounterHandle::attach(clusters[2].clone(), "hits");
    assert_eq!(reader.local_value().unwrap(), 0);
    assert_eq!(reader.value().await.unwrap(), 5);
}

#[tokio::test]
async fn test_set_can_lower_the_count() {
    let (network, clusters) = spawn(3, ClusterConfig::default());
    let hits = assert_ok!(GCounterHandle::create(clusters[0].clone(), "hits").await);
    hits.add(10).unwrap().delivered().await;

    hits.set(4).unwrap().delivered().await;
    assert_eq!(hits.value().await.unwrap(), 4);

    // A replica that missed the set still reports the larger count
    hits.add(6).unwrap().delivered().await;
    network.isolate(&id(1));
    hits.set(2).unwrap().delivered().await;
    network.heal(&id(1));
    assert_eq!(hits.value().await.unwrap(), 10);
}

#[tokio::test]
async fn test_invalid_amounts_send_nothing() {
    let (network, clusters) = spawn(3, ClusterConfig::default());
    let hits = assert_ok!(GCounterHandle::create(clusters[0].clone(), "hits").await);
    let before = network.stats();

    assert!(matches!(hits.add(0), Err(ClusterError::InvalidArgument(_))));
    assert!(matches!(hits.add(-3), Err(ClusterError::InvalidArgument(_))));
    assert!(matches!(hits.set(0), Err(ClusterError::InvalidArgument(_))));

    tokio::task::yield_now().await;
    assert_eq!(network.stats(), before);
    assert_eq!(hits.local_value().unwrap(), 0);
}

#[tokio::test]
async fn test_stalled_replica_is_excluded() {
    let config = ClusterConfigBuilder::new().request_timeout(100).build().unwrap();
    let (network, clusters) = spawn(3, config);
    let hits = assert_ok!(GCounterHandle::create(clusters[0].clone(), "hits").await);
    hits.add(2).unwrap().delivered().await;

    network.stall(&id(1));
    let started = tokio::time::Instant::now();
    let pending = hits.replicas().ask_replicas(mdcs_cluster::gcounter::ValueRequest).unwrap();
    assert_eq!(pending.dispatched(), 3);

    let replies = pending.collect().await;
    assert_eq!(replies, vec![2, 2]);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_no_replies_is_an_error() {
    let (_network, clusters) = spawn(3, ClusterConfig::default());
    let missing = GCounterHandle::attach(clusters[0].clone(), "never-created");

    assert!(matches!(
        missing.value().await,
        Err(ClusterError::NoReplicasResponded(name)) if name == "never-created"
    ));
    assert_err!(missing.local_value());
}

#[tokio::test]
async fn test_replication_factor_limits_holders() {
    let config = ClusterConfigBuilder::new().replication_factor(2).build().unwrap();
    let (_network, clusters) = spawn(5, config);
    let hits = assert_ok!(GCounterHandle::create(clusters[0].clone(), "hits").await);

    let holders = hits.replicas().holders();
    assert_eq!(holders.len(), 2);

    let hosting = clusters
        .iter()
        .filter(|cluster| cluster.get_service("hits").is_some())
        .count();
    assert_eq!(hosting, 2);

    let local_replicas = clusters
        .iter()
        .filter(|cluster| GCounterHandle::attach((*cluster).clone(), "hits").replicas().is_local_replica())
        .count();
    assert_eq!(local_replicas, 2);
    for cluster in &clusters {
        let is_holder = holders.contains(cluster.local_member());
        assert_eq!(
            GCounterHandle::attach(cluster.clone(), "hits").replicas().is_local_replica(),
            is_holder
        );
    }

    // Every member agrees on the holders
    for cluster in &clusters {
        assert_eq!(GCounterHandle::attach(cluster.clone(), "hits").replicas().holders(), holders);
    }

    assert_eq!(hits.add(4).unwrap().delivered().await, 2);
    assert_eq!(hits.value().await.unwrap(), 4);
}

#[tokio::test]
async fn test_create_twice_creates_nothing_new() {
    let (_network, clusters) = spawn(3, ClusterConfig::default());
    let hits = GCounterHandle::attach(clusters[0].clone(), "hits");

    assert_eq!(hits.replicas().create().await.unwrap(), 3);
    assert_eq!(hits.replicas().create().await.unwrap(), 0);
}

// ============================================================================
// GSet
// ============================================================================

#[tokio::test]
async fn test_set_adds_are_visible_everywhere() {
    let (_network, clusters) = spawn(3, ClusterConfig::default());
    let tags = assert_ok!(GSetHandle::<String>::create(clusters[1].clone(), "tags").await);

    tags.add("red".to_string()).unwrap().delivered().await;
    tags.add("blue".to_string()).unwrap().delivered().await;
    tags.add("red".to_string()).unwrap().delivered().await;

    assert_eq!(tags.size().await.unwrap(), 2);
    assert!(tags.contains(&"blue".to_string()).await.unwrap());
    assert!(!tags.contains(&"green".to_string()).await.unwrap());

    let other = GSetHandle::<String>::attach(clusters[2].clone(), "tags");
    assert_eq!(other.local_size().unwrap(), 2);
}

#[tokio::test]
async fn test_set_read_after_partial_write() {
    let (network, clusters) = spawn(3, ClusterConfig::default());
    let writer = assert_ok!(GSetHandle::<String>::create(clusters[0].clone(), "tags").await);
    let reader = GSetHandle::<String>::attach(clusters[2].clone(), "tags");
    reader.add("base".to_string()).unwrap().delivered().await;

    // Only the writer's own replica gets the second element
    network.isolate(&id(1));
    network.isolate(&id(2));
    assert_eq!(writer.add("x".to_string()).unwrap().delivered().await, 1);
    network.heal(&id(1));
    network.heal(&id(2));

    assert!(!reader.local_contains(&"x".to_string()).unwrap());
    assert_eq!(reader.local_size().unwrap(), 1);

    // Any replica holding it is enough, and the size is the most caught-up one
    assert!(reader.contains(&"x".to_string()).await.unwrap());
    assert_eq!(reader.size().await.unwrap(), 2);
    assert!(!reader.contains(&"y".to_string()).await.unwrap());
}

#[tokio::test]
async fn test_concurrent_set_writes_converge() {
    let (network, clusters) = spawn(3, ClusterConfig::default());
    let handles: Vec<GSetHandle<String>> = clusters
        .iter()
        .map(|cluster| GSetHandle::attach(cluster.clone(), "tags"))
        .collect();
    handles[0].replicas().create().await.unwrap();

    // Each member writes while cut off from the others
    for (i, handle) in handles.iter().enumerate() {
        network.isolate(&id(i));
        handle.add(format!("from-{}", i)).unwrap().delivered().await;
        network.heal(&id(i));
    }
    for handle in &handles {
        assert_eq!(handle.local_size().unwrap(), 1);
    }

    // Rounds in an arbitrary order still meet at the union
    for i in [2, 0, 1, 2] {
        handles[i].replicas().anti_entropy().await.unwrap();
    }
    for handle in &handles {
        let mut attempts = 0;
        while handle.local_size().unwrap() != 3 && attempts < 50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            attempts += 1;
        }
        assert_eq!(handle.local_size().unwrap(), 3);
        assert!(handle.local_contains(&"from-2".to_string()).unwrap());
    }
}

#[tokio::test]
async fn test_pull_state_merges_remote_sets() {
    let (network, clusters) = spawn(2, ClusterConfig::default());
    let left = assert_ok!(GSetHandle::<String>::create(clusters[0].clone(), "tags").await);
    let right = GSetHandle::<String>::attach(clusters[1].clone(), "tags");

    network.isolate(&id(0));
    right.add("x".to_string()).unwrap().delivered().await;
    network.heal(&id(0));

    assert!(left.replicas().pull_state().await.unwrap());
    assert!(!left.replicas().pull_state().await.unwrap());
    assert_eq!(left.replicas().local_value().unwrap(), GSet::from_iter(["x".to_string()]));
}

#[tokio::test]
async fn test_background_anti_entropy_converges() {
    let (network, clusters) = spawn(3, ClusterConfig::default());
    let tags = assert_ok!(GSetHandle::<String>::create(clusters[0].clone(), "tags").await);

    network.isolate(&id(0));
    tags.add("late".to_string()).unwrap().delivered().await;
    network.heal(&id(0));

    let task = tags.replicas().spawn_anti_entropy(Duration::from_millis(10));
    let lagging = GSetHandle::<String>::attach(clusters[1].clone(), "tags");
    let mut attempts = 0;
    while lagging.local_size().unwrap() == 0 && attempts < 100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        attempts += 1;
    }
    task.abort();

    assert!(lagging.local_contains(&"late".to_string()).unwrap());
}
