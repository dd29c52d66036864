//! Test helpers for starting nodes over a shared in-process log

use super::context::TestContext;
use crate::cluster::ClusterNode;
use crate::config::ClusterConfig;
use crate::storage::MemoryStorage;
use crate::transport::MemoryLog;
use crate::Result;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a test-writer subscriber once; later calls are no-ops
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gridrep_core=warn".into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Nodes sharing one [`MemoryLog`], each with its own state directory
pub struct TestCluster {
    ctx: TestContext,
    log: MemoryLog,
}

impl TestCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self {
            ctx: TestContext::new(),
            log: MemoryLog::new(),
        }
    }

    /// The shared replication log
    pub fn log(&self) -> &MemoryLog {
        &self.log
    }

    /// The temporary directory holding every node's state
    pub fn context(&self) -> &TestContext {
        &self.ctx
    }

    /// Configuration for node `name` with short poll and promotion timeouts
    pub fn config(&self, name: &str) -> ClusterConfig {
        ClusterConfig::default()
            .with_node_name(name)
            .with_state_dir(self.ctx.state_dir(name))
            .with_poll_timeout(Duration::from_millis(20))
            .with_promotion_timeout(Duration::from_secs(5), Duration::from_millis(10))
    }

    /// Start node `name` over a fresh in-memory store
    pub fn start_node(&self, name: &str) -> Result<(ClusterNode, Arc<MemoryStorage>)> {
        self.start_with(self.config(name), Arc::new(MemoryStorage::new()))
    }

    /// Start a node with an explicit configuration and store
    pub fn start_with(
        &self,
        config: ClusterConfig,
        storage: Arc<MemoryStorage>,
    ) -> Result<(ClusterNode, Arc<MemoryStorage>)> {
        let node = ClusterNode::start(config, storage.clone(), Arc::new(self.log.clone()))?;
        Ok((node, storage))
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}
