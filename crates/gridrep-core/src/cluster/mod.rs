//! Cluster node composition
//!
//! [`ClusterNode`] owns every replication component of one node and exposes
//! the control surface used by operators and front ends:
//!
//! - role: [`ClusterNode::is_distributor`], [`ClusterNode::activate_distribution`]
//! - progress: [`ClusterNode::is_ready`], [`ClusterNode::current_offset`]
//! - writes: [`ClusterNode::store`], [`ClusterNode::store_all`], [`ClusterNode::storer`]
//! - freeze: [`ClusterNode::stop_at_latest_offset`], [`ClusterNode::wait_until_finished`]
//!
//! Every node starts as a follower: the merger gate is open, the distributor
//! gate is closed, and writes fail with `NotADistributor`.

pub mod role;
pub mod storer;

pub use role::RoleController;
pub use storer::Storer;

use crate::config::ClusterConfig;
use crate::replication::{
    ActivatableDistributor, ActivatableMerger, BinaryDataDistributor, CachingDistributor,
    GraphUpdateBarrier, LogClient, LogClientOptions, LogClientState, LogDistributor, OffsetStore,
    PacketAcceptor, StorageMerger,
};
use crate::storage::{EntityRecord, StorageEngine};
use crate::transport::LogConnector;
use crate::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use storer::WritePath;
use tracing::info;

/// One replicated node
pub struct ClusterNode {
    config: ClusterConfig,
    engine: Arc<dyn StorageEngine>,
    offsets: Arc<OffsetStore>,
    client: Arc<LogClient>,
    distributor_gate: Arc<ActivatableDistributor>,
    merger_gate: Arc<ActivatableMerger>,
    barrier: GraphUpdateBarrier,
    role: Arc<RoleController>,
    write_path: Arc<WritePath>,
    shut_down: AtomicBool,
}

impl ClusterNode {
    /// Start a follower node over `engine`, replicating through `connector`
    pub fn start(
        config: ClusterConfig,
        engine: Arc<dyn StorageEngine>,
        connector: Arc<dyn LogConnector>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Initializing storage node {}", config.node_name);

        let offsets = Arc::new(OffsetStore::new(&config.state_dir)?);
        let start_offset = offsets.load_or_create()?;
        info!("Using offset {}", start_offset);

        let barrier = GraphUpdateBarrier::new();
        let merger = Arc::new(StorageMerger::new(engine.clone(), barrier.clone()));
        let merger_gate = Arc::new(ActivatableMerger::new(merger));

        let distributor = Arc::new(LogDistributor::new(
            connector.producer(&config.topic)?,
            config.codec()?,
            config.ordering_key.clone(),
            config.mode,
            config.flush_timeout(),
        )?);
        let distributor_gate = Arc::new(ActivatableDistributor::new(Arc::new(
            CachingDistributor::new(distributor.clone()),
        )));

        let client = Arc::new(LogClient::start(
            LogClientOptions {
                topic: config.topic.clone(),
                group_id: config.group_id(),
                poll_timeout: config.poll_timeout(),
                persist_offsets: config.persist_offsets,
            },
            connector,
            PacketAcceptor::new(merger_gate.clone()),
            offsets.clone(),
            start_offset,
        )?);

        let role = Arc::new(RoleController::new(
            client.clone(),
            merger_gate.clone(),
            distributor_gate.clone(),
            distributor,
            config.promotion_timeout(),
            config.promotion_poll_interval(),
        ));
        let write_path = Arc::new(WritePath::new(
            role.clone(),
            engine.clone(),
            distributor_gate.clone(),
            config.store_failure_policy,
        ));

        info!(
            "Node {} started as follower (group {})",
            config.node_name,
            client.group_id()
        );

        Ok(Self {
            config,
            engine,
            offsets,
            client,
            distributor_gate,
            merger_gate,
            barrier,
            role,
            write_path,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Configuration of this node
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Offset file and stopped marker of this node
    pub fn offsets(&self) -> &OffsetStore {
        &self.offsets
    }

    /// Consumer group id of the log client
    pub fn group_id(&self) -> &str {
        self.client.group_id()
    }

    /// Is this node the distributor
    pub fn is_distributor(&self) -> bool {
        self.role.is_distributor()
    }

    /// Promote this node to distributor
    pub fn activate_distribution(&self) -> Result<()> {
        self.role.activate_distribution()
    }

    /// Has the log client caught up with the tail
    pub fn is_ready(&self) -> bool {
        self.client.is_ready()
    }

    /// Is the merger applying replicated data
    pub fn is_merging(&self) -> bool {
        self.merger_gate.is_active()
    }

    /// State of the log client
    pub fn client_state(&self) -> LogClientState {
        self.client.state()
    }

    /// Highest storage offset consumed or published by this node
    pub fn current_offset(&self) -> i64 {
        self.role.current_offset()
    }

    /// Run a full garbage collection under the graph update barrier
    pub fn issue_full_garbage_collection(&self) -> Result<()> {
        info!("Issuing full garbage collection");
        self.barrier
            .run(|| self.engine.issue_full_garbage_collection())
    }

    /// Start a write session
    pub fn storer(&self) -> Storer {
        Storer::new(self.write_path.clone())
    }

    /// Write and distribute one record; returns its object id
    pub fn store(&self, record: EntityRecord) -> Result<u64> {
        self.role.ensure_distributor()?;
        let mut storer = self.storer();
        let object_id = storer.store(record);
        storer.commit()?;
        Ok(object_id)
    }

    /// Write and distribute several records in one commit
    pub fn store_all(&self, records: impl IntoIterator<Item = EntityRecord>) -> Result<Vec<u64>> {
        self.role.ensure_distributor()?;
        let mut storer = self.storer();
        let object_ids = storer.store_all(records);
        storer.commit()?;
        Ok(object_ids)
    }

    /// Drain the log up to its current tail, then freeze
    pub fn stop_at_latest_offset(&self) {
        self.client.stop_at_latest_offset();
    }

    /// Wait for a drain to complete
    pub fn wait_until_finished(&self, timeout: Duration) -> Result<()> {
        self.client
            .wait_until_finished(timeout, Duration::from_millis(10))
    }

    /// Dispose the log client, the distributor and the store; idempotent
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Disposing cluster resources");
        self.client.dispose()?;
        self.distributor_gate.dispose()?;
        self.engine.shutdown()?;
        Ok(())
    }
}

impl Drop for ClusterNode {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
