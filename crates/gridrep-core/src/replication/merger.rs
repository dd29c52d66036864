//! Read-side merging into the local store

use super::acceptor::{BinaryDataReceiver, DataBatch};
use crate::storage::{EntityIter, StorageEngine, TypeDictionary};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error};

/// Node-wide lock around every mutation of reference-resolution state.
///
/// Cloned handles share one lock. The node composition creates one barrier
/// and hands it to the merger and to garbage collection.
#[derive(Clone, Default)]
pub struct GraphUpdateBarrier {
    lock: Arc<Mutex<()>>,
}

impl GraphUpdateBarrier {
    /// Create a new barrier
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the barrier
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        f()
    }
}

/// Applies replicated data and type dictionaries to the local store
pub struct StorageMerger {
    engine: Arc<dyn StorageEngine>,
    barrier: GraphUpdateBarrier,
    receive_lock: Mutex<()>,
}

impl StorageMerger {
    /// Create a merger over `engine`
    pub fn new(engine: Arc<dyn StorageEngine>, barrier: GraphUpdateBarrier) -> Self {
        Self {
            engine,
            barrier,
            receive_lock: Mutex::new(()),
        }
    }

    /// Reload every imported non-root object; returns the number reloaded
    fn update_object_graph(&self, batch: &DataBatch) -> Result<usize> {
        debug!("Updating object graph");
        let dictionary = self.engine.type_dictionary();
        let mut updated = 0;

        for chunk in batch.chunks() {
            for entity in EntityIter::new(chunk.clone()) {
                let entity = entity?;
                let definition = dictionary.get(entity.type_id).ok_or_else(|| {
                    Error::storage(format!(
                        "Imported entity {} has unknown type id {}",
                        entity.object_id, entity.type_id
                    ))
                })?;
                // Local roots are never overwritten
                if definition.role.is_root() {
                    continue;
                }
                self.engine.load_object(entity.object_id)?;
                updated += 1;
            }
        }

        Ok(updated)
    }
}

impl BinaryDataReceiver for StorageMerger {
    fn receive_data(&self, batch: DataBatch) -> Result<()> {
        let _guard = self.receive_lock.lock();

        debug!("Importing {} bytes", batch.len());
        self.engine.import_data(&batch)?;

        let updated = self.barrier.run(|| self.update_object_graph(&batch))?;
        debug!("Reloaded {} object(s)", updated);
        Ok(())
    }

    fn receive_type_dictionary(&self, type_dictionary: &str) -> Result<()> {
        let _guard = self.receive_lock.lock();

        let remote = TypeDictionary::parse(type_dictionary)?;
        let local = self.engine.type_dictionary();

        let mut new_types = Vec::new();
        for remote_type in remote.iter() {
            match local.get(remote_type.type_id) {
                None => new_types.push(remote_type),
                Some(local_type) if local_type.equal_structure(remote_type) => {}
                Some(local_type) => {
                    error!("Type dictionary diverged: {} <> {}", local_type, remote_type);
                    return Err(Error::SchemaDivergence {
                        type_id: remote_type.type_id,
                        local: local_type.to_string(),
                        remote: remote_type.to_string(),
                    });
                }
            }
        }

        for remote_type in new_types {
            debug!("New type: {}", remote_type.type_name);
            self.engine.ensure_type_handler(remote_type)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EntityRecord, MemoryStorage, TypeDefinition, TypeRole, encode_entities};
    use bytes::Bytes;

    fn engine() -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage::with_types([
            TypeDefinition::new(1, "Roots").with_role(TypeRole::Root),
            TypeDefinition::new(2, "RootReference").with_role(TypeRole::RootReference),
            TypeDefinition::new(10, "app.Item").with_field("name", "String"),
        ]))
    }

    #[test]
    fn test_receive_data_skips_roots() {
        let engine = engine();
        let merger = StorageMerger::new(engine.clone(), GraphUpdateBarrier::new());

        let data = encode_entities(&[
            EntityRecord::new(1, 100, Bytes::from_static(b"roots")),
            EntityRecord::new(10, 101, Bytes::from_static(b"item")),
            EntityRecord::new(2, 102, Bytes::new()),
        ]);
        merger.receive_data(data.into()).unwrap();

        assert_eq!(engine.import_count(), 1);
        assert_eq!(engine.entity_count(), 3);
        assert_eq!(engine.load_count(101), 1);
        assert_eq!(engine.load_count(100), 0);
        assert_eq!(engine.load_count(102), 0);
    }

    #[test]
    fn test_identical_type_registers_nothing() {
        let engine = engine();
        let merger = StorageMerger::new(engine.clone(), GraphUpdateBarrier::new());
        let before = engine.type_dictionary();

        merger
            .receive_type_dictionary(&before.assemble().unwrap())
            .unwrap();
        assert_eq!(engine.type_dictionary(), before);
    }

    #[test]
    fn test_divergent_type_commits_nothing() {
        let engine = engine();
        let merger = StorageMerger::new(engine.clone(), GraphUpdateBarrier::new());

        let remote: TypeDictionary = vec![
            TypeDefinition::new(11, "app.New"),
            TypeDefinition::new(10, "app.Item").with_field("title", "String"),
        ]
        .into_iter()
        .collect();

        let err = merger
            .receive_type_dictionary(&remote.assemble().unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::SchemaDivergence { type_id: 10, .. }));
        assert!(err.is_fatal());
        assert!(engine.type_dictionary().get(11).is_none());
    }

    #[test]
    fn test_new_type_is_registered() {
        let engine = engine();
        let merger = StorageMerger::new(engine.clone(), GraphUpdateBarrier::new());

        let mut remote = engine.type_dictionary();
        remote.register(TypeDefinition::new(11, "app.New")).unwrap();
        merger
            .receive_type_dictionary(&remote.assemble().unwrap())
            .unwrap();
        assert_eq!(engine.type_dictionary().get(11).unwrap().type_name, "app.New");
    }

    #[test]
    fn test_barrier_is_shared() {
        let barrier = GraphUpdateBarrier::new();
        let other = barrier.clone();
        let inner = barrier.run(|| other.lock.try_lock().is_none());
        assert!(inner);
        assert!(other.lock.try_lock().is_some());
    }
}
