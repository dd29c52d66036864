//! Cluster Replication Integration Tests
//!
//! Tests the full replication workflow over the in-memory log:
//! - Distributor writes merged by followers
//! - Promotion and storage offset continuity
//! - Idempotent replay and drain to tail
//! - Failure handling of the log client and the merger

use bytes::Bytes;
use gridrep_core::replication::packet::parse_storage_offset;
use gridrep_core::storage::TypeRole;
use gridrep_core::testing::{TestCluster, init_tracing, wait_for};
use gridrep_core::transport::{LogConsumer, LogProducer, TransportRecord};
use gridrep_core::{
    ClusterNode, DistributionMode, EntityRecord, Error, LogClientState, LogConnector,
    MemoryStorage, NO_OFFSET, Result, StorageEngine, TypeDefinition,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn customer_type() -> TypeDefinition {
    TypeDefinition::new(1000, "app.Customer")
        .with_field("id", "u64")
        .with_field("name", "String")
}

fn customer(object_id: u64, name: &'static str) -> EntityRecord {
    EntityRecord::new(1000, object_id, Bytes::from_static(name.as_bytes()))
}

/// Promote `node` and commit the customer type with the given records
fn write_customers(node: &ClusterNode, records: Vec<EntityRecord>) -> Result<()> {
    let mut storer = node.storer();
    storer.register_type(customer_type());
    storer.store_all(records);
    storer.commit()
}

fn last_storage_offset(cluster: &TestCluster, topic: &str) -> i64 {
    let records = cluster.log().records(topic);
    parse_storage_offset(records.last().unwrap()).unwrap()
}

/// Test that follower nodes merge everything the distributor writes
#[test]
fn test_follower_merges_distributor_writes() {
    init_tracing();
    let cluster = TestCluster::new();
    let (primary, primary_storage) = cluster.start_node("primary").unwrap();
    let (follower, follower_storage) = cluster.start_node("follower").unwrap();

    assert!(!primary.is_distributor());
    primary.activate_distribution().unwrap();
    assert!(primary.is_distributor());
    assert!(!primary.is_merging());

    write_customers(&primary, vec![customer(1, "ada"), customer(2, "grace")]).unwrap();
    assert_eq!(primary_storage.entity_count(), 2);
    assert_eq!(primary_storage.write_count(), 1);

    assert!(wait_for(TIMEOUT, || follower_storage.entity_count() == 2));
    assert_eq!(follower_storage.entity(2).unwrap().body, Bytes::from_static(b"grace"));
    assert_eq!(follower_storage.load_count(1), 1);
    assert_eq!(follower_storage.load_count(2), 1);
    assert_eq!(follower_storage.write_count(), 0);
    assert!(follower_storage.type_dictionary().get(1000).is_some());

    // The distributor consumes its own records without merging them
    assert_eq!(primary_storage.import_count(), 0);
    let tail = last_storage_offset(&cluster, &primary.config().topic);
    assert!(wait_for(TIMEOUT, || follower.current_offset() == tail));
    assert_eq!(primary.current_offset(), tail);
}

/// Test that root objects are imported but never reloaded into the graph
#[test]
fn test_roots_are_not_reloaded() {
    let cluster = TestCluster::new();
    let (primary, _) = cluster.start_node("primary").unwrap();
    let (_follower, follower_storage) = cluster.start_node("follower").unwrap();
    primary.activate_distribution().unwrap();

    let mut storer = primary.storer();
    storer.register_type(TypeDefinition::new(1, "Roots").with_role(TypeRole::Root));
    storer.register_type(customer_type());
    storer.store(EntityRecord::new(1, 100, Bytes::from_static(b"root")));
    storer.store(customer(101, "ada"));
    storer.commit().unwrap();

    assert!(wait_for(TIMEOUT, || follower_storage.entity_count() == 2));
    assert_eq!(follower_storage.load_count(100), 0);
    assert_eq!(follower_storage.load_count(101), 1);
}

/// Test that followers reject writes immediately
#[test]
fn test_follower_rejects_writes() {
    let cluster = TestCluster::new();
    let (follower, storage) = cluster.start_node("follower").unwrap();

    let err = follower.store(customer(1, "ada")).unwrap_err();
    assert!(matches!(err, Error::NotADistributor));
    assert!(err.is_retryable());

    let mut storer = follower.storer();
    storer.store(customer(1, "ada"));
    assert!(matches!(storer.commit(), Err(Error::NotADistributor)));
    // Queue is kept for a retry on the distributor
    assert_eq!(storer.size(), 1);

    assert_eq!(storage.entity_count(), 0);
    assert_eq!(cluster.log().len(&follower.config().topic), 0);
}

/// Test that a second promotion is rejected without side effects
#[test]
fn test_second_activation_rejected() {
    let cluster = TestCluster::new();
    let (node, _) = cluster.start_node("primary").unwrap();

    node.activate_distribution().unwrap();
    let err = node.activate_distribution().unwrap_err();
    assert!(matches!(err, Error::DistributionAlreadyEnabled));
    assert!(node.is_distributor());
    assert!(!node.is_merging());
}

/// Test that a promoted follower continues the storage offset sequence
#[test]
fn test_promotion_continues_offset_sequence() {
    init_tracing();
    let cluster = TestCluster::new();
    let (primary, _) = cluster.start_node("primary").unwrap();
    let (follower, follower_storage) = cluster.start_node("follower").unwrap();
    let topic = primary.config().topic.clone();

    primary.activate_distribution().unwrap();
    write_customers(&primary, vec![customer(1, "ada")]).unwrap();
    primary.store(customer(2, "grace")).unwrap();

    let applied = last_storage_offset(&cluster, &topic);
    assert_eq!(applied, NO_OFFSET + 3);
    assert!(wait_for(TIMEOUT, || follower.current_offset() == applied));
    primary.shutdown().unwrap();

    follower.activate_distribution().unwrap();
    assert!(follower.is_distributor());
    assert!(!follower.is_merging());

    follower.store(customer(3, "linus")).unwrap();
    assert_eq!(last_storage_offset(&cluster, &topic), applied + 1);
    assert_eq!(follower_storage.entity_count(), 3);
    assert_eq!(follower_storage.write_count(), 1);
}

/// Test that replayed records below the applied offset are skipped
#[test]
fn test_duplicate_records_not_reapplied() {
    let cluster = TestCluster::new();
    let (primary, _) = cluster.start_node("primary").unwrap();
    let (_follower, follower_storage) = cluster.start_node("follower").unwrap();
    let topic = primary.config().topic.clone();

    primary.activate_distribution().unwrap();
    write_customers(&primary, vec![customer(1, "ada")]).unwrap();
    assert!(wait_for(TIMEOUT, || follower_storage.import_count() == 1));

    // At-least-once redelivery of everything published so far
    for record in cluster.log().records(&topic) {
        cluster.log().append_raw(&topic, record);
    }
    primary.store(customer(2, "grace")).unwrap();

    assert!(wait_for(TIMEOUT, || follower_storage.import_count() == 2));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(follower_storage.import_count(), 2);
    assert_eq!(follower_storage.load_count(1), 1);
    assert_eq!(follower_storage.load_count(2), 1);
}

/// Test drain to tail, offset persistence and restart from the offset file
#[test]
fn test_drain_persists_offset_and_marker() {
    let cluster = TestCluster::new();
    let (primary, _) = cluster.start_node("primary").unwrap();
    let (follower, _) = cluster.start_node("follower").unwrap();
    let topic = primary.config().topic.clone();

    primary.activate_distribution().unwrap();
    write_customers(&primary, (1..=5).map(|id| customer(id, "bulk")).collect()).unwrap();
    let tail = last_storage_offset(&cluster, &topic);

    follower.stop_at_latest_offset();
    follower.wait_until_finished(TIMEOUT).unwrap();

    assert_eq!(follower.client_state(), LogClientState::Finished);
    assert_eq!(follower.current_offset(), tail);
    assert!(follower.offsets().is_stopped());
    assert_eq!(follower.offsets().load_or_create().unwrap(), tail);
    assert_eq!(
        std::fs::read_to_string(follower.offsets().offset_path()).unwrap().trim(),
        tail.to_string()
    );

    // A finished client can no longer back a promotion
    assert!(matches!(
        follower.activate_distribution(),
        Err(Error::LogClientStopped(_))
    ));
    assert!(!follower.is_distributor());
    follower.shutdown().unwrap();

    // Restarted node resumes after the persisted offset
    let (restarted, storage) = cluster.start_node("follower").unwrap();
    assert_eq!(restarted.current_offset(), tail);
    assert!(wait_for(TIMEOUT, || restarted.is_ready()));
    assert_eq!(storage.import_count(), 0);
    assert_eq!(storage.entity_count(), 0);
}

/// Test that records without replication headers are dropped
#[test]
fn test_foreign_records_dropped() {
    let cluster = TestCluster::new();
    let (primary, _) = cluster.start_node("primary").unwrap();
    let topic = primary.config().topic.clone();
    cluster.log().append_raw(
        &topic,
        TransportRecord::new(Bytes::from_static(b"not a packet")).with_key("other"),
    );

    let (follower, follower_storage) = cluster.start_node("follower").unwrap();
    primary.activate_distribution().unwrap();
    write_customers(&primary, vec![customer(1, "ada")]).unwrap();

    assert!(wait_for(TIMEOUT, || follower_storage.entity_count() == 1));
    assert_eq!(follower.client_state(), LogClientState::Active);
}

/// Test that a poll failure stops the client and blocks promotion
#[test]
fn test_poll_failure_fails_client() {
    let cluster = TestCluster::new();
    cluster.log().fail_next_poll("storage-data", "broker unavailable");
    let (node, _) = cluster.start_node("follower").unwrap();

    assert!(wait_for(TIMEOUT, || node.client_state() == LogClientState::Failed));
    match node.wait_until_finished(TIMEOUT) {
        Err(Error::LogClientStopped(reason)) => assert!(reason.contains("broker unavailable")),
        other => panic!("unexpected result: {:?}", other),
    }

    assert!(matches!(
        node.activate_distribution(),
        Err(Error::LogClientStopped(_))
    ));
    assert!(!node.is_distributor());
    assert!(node.is_merging());
}

/// Test that a diverging type dictionary stops the follower without committing
#[test]
fn test_schema_divergence_stops_follower() {
    let cluster = TestCluster::new();
    let (primary, _) = cluster.start_node("primary").unwrap();

    let local = TypeDefinition::new(1000, "app.Customer").with_field("id", "u32");
    let storage = Arc::new(MemoryStorage::with_types([local.clone()]));
    let (follower, storage) = cluster
        .start_with(cluster.config("follower"), storage)
        .unwrap();

    primary.activate_distribution().unwrap();
    write_customers(&primary, vec![customer(1, "ada")]).unwrap();

    assert!(wait_for(TIMEOUT, || follower.client_state() == LogClientState::Failed));
    assert!(matches!(
        follower.wait_until_finished(TIMEOUT),
        Err(Error::LogClientStopped(reason)) if reason.contains("Schema divergence")
    ));
    assert_eq!(storage.entity_count(), 0);
    assert_eq!(storage.type_dictionary().get(1000), Some(&local));
}

/// Test replication with the asynchronous distributor worker
#[test]
fn test_async_distribution() {
    let cluster = TestCluster::new();
    let config = cluster.config("primary").with_mode(DistributionMode::Async);
    let (primary, _) = cluster
        .start_with(config, Arc::new(MemoryStorage::new()))
        .unwrap();
    let (_follower, follower_storage) = cluster.start_node("follower").unwrap();

    primary.activate_distribution().unwrap();
    write_customers(&primary, vec![customer(1, "ada")]).unwrap();
    for id in 2..=10 {
        primary.store(customer(id, "bulk")).unwrap();
    }

    assert!(wait_for(TIMEOUT, || follower_storage.entity_count() == 10));
    assert_eq!(follower_storage.load_count(10), 1);
}

/// Consumer that never sees an empty poll round
struct BusyConnector {
    log: gridrep_core::MemoryLog,
}

struct BusyConsumer;

impl LogConsumer for BusyConsumer {
    fn poll(&mut self, _timeout: Duration) -> Result<Vec<TransportRecord>> {
        thread::sleep(Duration::from_millis(2));
        Ok(vec![TransportRecord::new(Bytes::from_static(b"noise"))])
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

impl LogConnector for BusyConnector {
    fn producer(&self, topic: &str) -> Result<Arc<dyn LogProducer>> {
        self.log.producer(topic)
    }

    fn consumer(&self, _topic: &str, _group_id: &str) -> Result<Box<dyn LogConsumer>> {
        Ok(Box::new(BusyConsumer))
    }

    fn tail_storage_offset(&self, topic: &str, group_id: &str) -> Result<i64> {
        self.log.tail_storage_offset(topic, group_id)
    }
}

/// Test that promotion gives up when the client never catches up
#[test]
fn test_promotion_timeout() {
    let cluster = TestCluster::new();
    let config = cluster
        .config("lagging")
        .with_promotion_timeout(Duration::from_millis(100), Duration::from_millis(10));
    let connector = Arc::new(BusyConnector {
        log: cluster.log().clone(),
    });
    let node = ClusterNode::start(config, Arc::new(MemoryStorage::new()), connector).unwrap();

    let err = node.activate_distribution().unwrap_err();
    assert!(matches!(err, Error::PromotionTimeout(_)));
    assert!(!node.is_distributor());
    assert!(node.is_merging());
    assert_eq!(node.client_state(), LogClientState::Active);
}

/// Test garbage collection and idempotent shutdown
#[test]
fn test_gc_and_shutdown() {
    let cluster = TestCluster::new();
    let (node, storage) = cluster.start_node("node").unwrap();

    node.issue_full_garbage_collection().unwrap();
    assert_eq!(storage.gc_runs(), 1);

    node.shutdown().unwrap();
    node.shutdown().unwrap();
    assert!(storage.is_shut_down());
    assert_eq!(node.client_state(), LogClientState::Finished);
    assert!(matches!(
        node.issue_full_garbage_collection(),
        Err(Error::Disposed(_))
    ));
}
