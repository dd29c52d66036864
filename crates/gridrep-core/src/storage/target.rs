//! Write path of the distributor node

use super::StorageEngine;
use crate::replication::{BinaryDataDistributor, DataBatch};
use crate::Result;
use std::sync::Arc;

/// Writes locally, then hands the same bytes to the distributor
pub struct DistributingTarget {
    engine: Arc<dyn StorageEngine>,
    distributor: Arc<dyn BinaryDataDistributor>,
}

impl DistributingTarget {
    /// Create a target over `engine` publishing through `distributor`
    pub fn new(engine: Arc<dyn StorageEngine>, distributor: Arc<dyn BinaryDataDistributor>) -> Self {
        Self {
            engine,
            distributor,
        }
    }

    /// Persist and distribute one committed write
    pub fn write(&self, batch: DataBatch) -> Result<()> {
        self.engine.write(&batch)?;
        self.distributor.distribute_data(batch)
    }
}

/// Exports the local type dictionary to the distributor after a change
pub struct DistributingTypeDictionaryExporter {
    engine: Arc<dyn StorageEngine>,
    distributor: Arc<dyn BinaryDataDistributor>,
}

impl DistributingTypeDictionaryExporter {
    /// Create an exporter over `engine` publishing through `distributor`
    pub fn new(engine: Arc<dyn StorageEngine>, distributor: Arc<dyn BinaryDataDistributor>) -> Self {
        Self {
            engine,
            distributor,
        }
    }

    /// Assemble the current dictionary and distribute it
    pub fn export(&self) -> Result<()> {
        let text = self.engine.type_dictionary().assemble()?;
        self.distributor.distribute_type_dictionary(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EntityRecord, MemoryStorage, TypeDefinition, TypeDictionary, encode_entities};
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Captured {
        data: Mutex<Vec<Bytes>>,
        dictionaries: Mutex<Vec<String>>,
    }

    impl BinaryDataDistributor for Captured {
        fn distribute_data(&self, batch: DataBatch) -> Result<()> {
            self.data.lock().push(batch.to_bytes());
            Ok(())
        }

        fn distribute_type_dictionary(&self, type_dictionary: &str) -> Result<()> {
            self.dictionaries.lock().push(type_dictionary.to_string());
            Ok(())
        }

        fn dispose(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_then_distribute() {
        let engine = Arc::new(MemoryStorage::with_types([TypeDefinition::new(3, "T")]));
        let captured = Arc::new(Captured::default());
        let target = DistributingTarget::new(engine.clone(), captured.clone());

        let data = encode_entities(&[EntityRecord::new(3, 1, Bytes::from_static(b"x"))]);
        target.write(data.clone().into()).unwrap();

        assert_eq!(engine.entity_count(), 1);
        assert_eq!(*captured.data.lock(), vec![data]);
    }

    #[test]
    fn test_failed_local_write_is_not_distributed() {
        let engine = Arc::new(MemoryStorage::new());
        let captured = Arc::new(Captured::default());
        let target = DistributingTarget::new(engine, captured.clone());

        let data = encode_entities(&[EntityRecord::new(3, 1, Bytes::new())]);
        assert!(target.write(data.into()).is_err());
        assert!(captured.data.lock().is_empty());
    }

    #[test]
    fn test_export_dictionary() {
        let engine = Arc::new(MemoryStorage::with_types([TypeDefinition::new(3, "T")]));
        let captured = Arc::new(Captured::default());
        DistributingTypeDictionaryExporter::new(engine.clone(), captured.clone())
            .export()
            .unwrap();

        let exported = TypeDictionary::parse(&captured.dictionaries.lock()[0]).unwrap();
        assert_eq!(exported, engine.type_dictionary());
    }
}
