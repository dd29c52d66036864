//! Write sessions on the distributor node

use super::role::RoleController;
use crate::config::StoreFailurePolicy;
use crate::replication::BinaryDataDistributor;
use crate::storage::{
    DistributingTarget, DistributingTypeDictionaryExporter, EntityRecord, StorageEngine,
    TypeDefinition, encode_entities,
};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, error};

/// Local write followed by distribution, guarded by the node's role
pub(crate) struct WritePath {
    role: Arc<RoleController>,
    engine: Arc<dyn StorageEngine>,
    target: DistributingTarget,
    exporter: DistributingTypeDictionaryExporter,
    policy: StoreFailurePolicy,
}

impl WritePath {
    pub(crate) fn new(
        role: Arc<RoleController>,
        engine: Arc<dyn StorageEngine>,
        distributor: Arc<dyn BinaryDataDistributor>,
        policy: StoreFailurePolicy,
    ) -> Self {
        Self {
            role,
            target: DistributingTarget::new(engine.clone(), distributor.clone()),
            exporter: DistributingTypeDictionaryExporter::new(engine.clone(), distributor),
            engine,
            policy,
        }
    }

    fn commit(&self, records: &[EntityRecord], types: &[TypeDefinition]) -> Result<()> {
        self.role.ensure_distributor()?;

        if !types.is_empty() {
            for definition in types {
                self.handle(self.engine.ensure_type_handler(definition))?;
            }
            self.handle(self.exporter.export())?;
        }

        if records.is_empty() {
            return Ok(());
        }

        let data = encode_entities(records);
        self.handle(self.target.write(data.into()))?;
        debug!("Committed {} record(s)", records.len());
        Ok(())
    }

    fn handle(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            match self.policy {
                StoreFailurePolicy::Exit => {
                    error!("Store call failed, terminating: {}", e);
                    std::process::exit(1);
                }
                StoreFailurePolicy::Propagate => error!("Store call failed: {}", e),
            }
        }
        result
    }
}

/// Collects records and new types for one atomic commit
pub struct Storer {
    write_path: Arc<WritePath>,
    records: Vec<EntityRecord>,
    types: Vec<TypeDefinition>,
}

impl Storer {
    pub(crate) fn new(write_path: Arc<WritePath>) -> Self {
        Self {
            write_path,
            records: Vec::new(),
            types: Vec::new(),
        }
    }

    /// Queue a record; returns its object id
    pub fn store(&mut self, record: EntityRecord) -> u64 {
        let object_id = record.object_id;
        self.records.push(record);
        object_id
    }

    /// Queue several records; returns their object ids
    pub fn store_all(&mut self, records: impl IntoIterator<Item = EntityRecord>) -> Vec<u64> {
        records.into_iter().map(|r| self.store(r)).collect()
    }

    /// Queue a type definition to register with this commit
    pub fn register_type(&mut self, definition: TypeDefinition) {
        self.types.push(definition);
    }

    /// Number of queued records
    pub fn size(&self) -> usize {
        self.records.len()
    }

    /// Nothing queued
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.types.is_empty()
    }

    /// Drop everything queued
    pub fn clear(&mut self) {
        self.records.clear();
        self.types.clear();
    }

    /// Write and distribute everything queued.
    ///
    /// Fails with `NotADistributor` if the node lost or never had the
    /// distributor role; the queue is kept so the caller may retry.
    pub fn commit(&mut self) -> Result<()> {
        self.write_path.commit(&self.records, &self.types)?;
        self.clear();
        Ok(())
    }
}

impl std::fmt::Debug for Storer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storer")
            .field("records", &self.records.len())
            .field("types", &self.types.len())
            .finish()
    }
}
