//! In-memory storage engine
//!
//! Keeps entities and the type dictionary in process memory. Used by tests and
//! single-host development clusters.

use super::entity::{EntityIter, EntityRecord};
use super::type_dictionary::{TypeDefinition, TypeDictionary};
use super::StorageEngine;
use crate::replication::DataBatch;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

#[derive(Default)]
struct State {
    entities: HashMap<u64, EntityRecord>,
    dictionary: TypeDictionary,
    load_counts: HashMap<u64, u64>,
}

/// Storage engine backed by process memory
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<State>,
    writes: AtomicU64,
    imports: AtomicU64,
    gc_runs: AtomicU64,
    shut_down: AtomicBool,
}

impl MemoryStorage {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with pre-registered types
    pub fn with_types(types: impl IntoIterator<Item = TypeDefinition>) -> Self {
        let storage = Self::new();
        storage.state.write().dictionary = types.into_iter().collect();
        storage
    }

    /// Stored entity by object id
    pub fn entity(&self, object_id: u64) -> Option<EntityRecord> {
        self.state.read().entities.get(&object_id).cloned()
    }

    /// Number of stored entities
    pub fn entity_count(&self) -> usize {
        self.state.read().entities.len()
    }

    /// How often an object was loaded into the live graph
    pub fn load_count(&self, object_id: u64) -> u64 {
        self.state
            .read()
            .load_counts
            .get(&object_id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of local application writes
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of replicated imports
    pub fn import_count(&self) -> u64 {
        self.imports.load(Ordering::SeqCst)
    }

    /// Number of garbage collection runs
    pub fn gc_runs(&self) -> u64 {
        self.gc_runs.load(Ordering::SeqCst)
    }

    /// Has the store been shut down
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::disposed("Storage has been shut down"));
        }
        Ok(())
    }

    /// Decode the whole batch first so a bad record stores nothing
    fn apply(&self, batch: &DataBatch) -> Result<usize> {
        self.ensure_running()?;

        let mut records = Vec::new();
        for chunk in batch.chunks() {
            for record in EntityIter::new(chunk.clone()) {
                records.push(record?);
            }
        }

        let mut state = self.state.write();
        if let Some(unknown) = records
            .iter()
            .find(|r| state.dictionary.get(r.type_id).is_none())
        {
            return Err(Error::storage(format!(
                "Entity {} has unknown type id {}",
                unknown.object_id, unknown.type_id
            )));
        }

        let count = records.len();
        for record in records {
            state.entities.insert(record.object_id, record);
        }
        Ok(count)
    }
}

impl StorageEngine for MemoryStorage {
    fn write(&self, batch: &DataBatch) -> Result<()> {
        let count = self.apply(batch)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!("Stored {} entities", count);
        Ok(())
    }

    fn import_data(&self, batch: &DataBatch) -> Result<()> {
        let count = self.apply(batch)?;
        self.imports.fetch_add(1, Ordering::SeqCst);
        debug!("Imported {} entities", count);
        Ok(())
    }

    fn type_dictionary(&self) -> TypeDictionary {
        self.state.read().dictionary.clone()
    }

    fn ensure_type_handler(&self, definition: &TypeDefinition) -> Result<()> {
        self.ensure_running()?;
        self.state.write().dictionary.register(definition.clone())?;
        Ok(())
    }

    fn load_object(&self, object_id: u64) -> Result<()> {
        self.ensure_running()?;
        let mut state = self.state.write();
        if !state.entities.contains_key(&object_id) {
            return Err(Error::storage(format!("Object {} not found", object_id)));
        }
        *state.load_counts.entry(object_id).or_default() += 1;
        Ok(())
    }

    fn issue_full_garbage_collection(&self) -> Result<()> {
        self.ensure_running()?;
        self.gc_runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::encode_entities;
    use bytes::Bytes;

    fn storage() -> MemoryStorage {
        MemoryStorage::with_types([TypeDefinition::new(10, "app.Item")])
    }

    #[test]
    fn test_write_and_load() {
        let storage = storage();
        let data = encode_entities(&[
            EntityRecord::new(10, 1, Bytes::from_static(b"a")),
            EntityRecord::new(10, 2, Bytes::from_static(b"b")),
        ]);
        storage.write(&data.into()).unwrap();

        assert_eq!(storage.entity_count(), 2);
        assert_eq!(storage.write_count(), 1);
        assert_eq!(storage.entity(2).unwrap().body, Bytes::from_static(b"b"));

        storage.load_object(1).unwrap();
        assert_eq!(storage.load_count(1), 1);
        assert!(storage.load_object(99).is_err());
    }

    #[test]
    fn test_unknown_type_stores_nothing() {
        let storage = storage();
        let data = encode_entities(&[
            EntityRecord::new(10, 1, Bytes::new()),
            EntityRecord::new(11, 2, Bytes::new()),
        ]);
        assert!(matches!(
            storage.import_data(&data.into()),
            Err(Error::Storage(_))
        ));
        assert_eq!(storage.entity_count(), 0);
        assert_eq!(storage.import_count(), 0);
    }

    #[test]
    fn test_shutdown_rejects_operations() {
        let storage = storage();
        storage.shutdown().unwrap();
        assert!(storage.is_shut_down());
        assert!(matches!(
            storage.issue_full_garbage_collection(),
            Err(Error::Disposed(_))
        ));
    }
}
