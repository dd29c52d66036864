//! Distributor promotion

use crate::replication::{ActivatableDistributor, ActivatableMerger, LogClient, LogDistributor};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Owns the distributor/follower role of a node
pub struct RoleController {
    client: Arc<LogClient>,
    merger_gate: Arc<ActivatableMerger>,
    distributor_gate: Arc<ActivatableDistributor>,
    distributor: Arc<LogDistributor>,
    is_distributor: AtomicBool,
    promotion: Mutex<()>,
    timeout: Duration,
    poll_interval: Duration,
}

impl RoleController {
    /// Create a controller for a follower node
    pub fn new(
        client: Arc<LogClient>,
        merger_gate: Arc<ActivatableMerger>,
        distributor_gate: Arc<ActivatableDistributor>,
        distributor: Arc<LogDistributor>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            merger_gate,
            distributor_gate,
            distributor,
            is_distributor: AtomicBool::new(false),
            promotion: Mutex::new(()),
            timeout,
            poll_interval,
        }
    }

    /// Is this node the distributor
    pub fn is_distributor(&self) -> bool {
        self.is_distributor.load(Ordering::SeqCst)
    }

    /// Fail fast with `NotADistributor` on followers
    pub fn ensure_distributor(&self) -> Result<()> {
        if !self.is_distributor() {
            return Err(Error::NotADistributor);
        }
        Ok(())
    }

    /// Highest storage offset seen by this node, consumed or published
    pub fn current_offset(&self) -> i64 {
        self.client
            .storage_offset()
            .max(self.distributor.storage_offset())
    }

    /// Promote this node to distributor.
    ///
    /// Waits for the log client to catch up, silences the merger, continues
    /// the observed offset sequence and opens the distributor gate. On error
    /// the node stays a follower.
    pub fn activate_distribution(&self) -> Result<()> {
        let _guard = self.promotion.lock();
        if self.is_distributor() {
            return Err(Error::DistributionAlreadyEnabled);
        }

        info!("Activating distribution");
        self.client.unready();
        self.wait_until_ready()?;

        info!("Turning on distribution.");
        self.merger_gate.set_active(false);
        self.distributor
            .set_storage_offset(self.client.storage_offset());
        self.distributor_gate.set_active(true);
        self.is_distributor.store(true, Ordering::SeqCst);

        info!(
            "Node is now the distributor, continuing after storage offset {}",
            self.distributor.storage_offset()
        );
        Ok(())
    }

    fn wait_until_ready(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let active = self.client.is_active();
            if active && self.client.is_ready() {
                return Ok(());
            }
            if !active {
                let reason = self
                    .client
                    .failure()
                    .unwrap_or_else(|| format!("client is {:?}", self.client.state()));
                warn!("Promotion aborted, log client not active: {}", reason);
                return Err(Error::LogClientStopped(reason));
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("Promotion timed out after {:?}", self.timeout);
                return Err(Error::PromotionTimeout(self.timeout));
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}
