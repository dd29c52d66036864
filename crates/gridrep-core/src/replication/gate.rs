//! Activation gates
//!
//! Boolean switches in front of the distributor and the merger. While a gate
//! is inactive every publish or receive call is silently dropped, so the role
//! of a node can flip without tearing down its log connections.

use super::acceptor::{BinaryDataReceiver, DataBatch};
use super::distributor::BinaryDataDistributor;
use crate::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Gated distributor; starts inactive
pub struct ActivatableDistributor {
    delegate: Arc<dyn BinaryDataDistributor>,
    active: AtomicBool,
}

impl ActivatableDistributor {
    /// Wrap `delegate`
    pub fn new(delegate: Arc<dyn BinaryDataDistributor>) -> Self {
        Self {
            delegate,
            active: AtomicBool::new(false),
        }
    }

    /// Turn publishing on or off
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Is publishing on
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl BinaryDataDistributor for ActivatableDistributor {
    fn distribute_data(&self, batch: DataBatch) -> Result<()> {
        if self.is_active() {
            self.delegate.distribute_data(batch)?;
        }
        Ok(())
    }

    fn distribute_type_dictionary(&self, type_dictionary: &str) -> Result<()> {
        if self.is_active() {
            self.delegate.distribute_type_dictionary(type_dictionary)?;
        }
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        self.delegate.dispose()
    }
}

/// Gated merger; starts active
pub struct ActivatableMerger {
    delegate: Arc<dyn BinaryDataReceiver>,
    active: AtomicBool,
}

impl ActivatableMerger {
    /// Wrap `delegate`
    pub fn new(delegate: Arc<dyn BinaryDataReceiver>) -> Self {
        Self {
            delegate,
            active: AtomicBool::new(true),
        }
    }

    /// Turn merging on or off
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Is merging on
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl BinaryDataReceiver for ActivatableMerger {
    fn receive_data(&self, batch: DataBatch) -> Result<()> {
        if self.is_active() {
            self.delegate.receive_data(batch)?;
        }
        Ok(())
    }

    fn receive_type_dictionary(&self, type_dictionary: &str) -> Result<()> {
        if self.is_active() {
            self.delegate.receive_type_dictionary(type_dictionary)?;
        }
        Ok(())
    }
}
