//! Local storage collaborator
//!
//! The replication core never persists objects itself. It talks to the
//! embedded store through [`StorageEngine`], supplied by the node composition.

pub mod entity;
pub mod memory;
pub mod target;
pub mod type_dictionary;

pub use entity::{ENTITY_HEADER_LENGTH, EntityIter, EntityRecord, encode_entities};
pub use memory::MemoryStorage;
pub use target::{DistributingTarget, DistributingTypeDictionaryExporter};
pub use type_dictionary::{FieldDefinition, TypeDefinition, TypeDictionary, TypeRole};

use crate::Result;
use crate::replication::DataBatch;

/// Embedded object store as seen by replication
pub trait StorageEngine: Send + Sync {
    /// Persist entity data written by the local application
    fn write(&self, batch: &DataBatch) -> Result<()>;

    /// Import replicated entity data, bypassing the application write path
    fn import_data(&self, batch: &DataBatch) -> Result<()>;

    /// Snapshot of the local type dictionary
    fn type_dictionary(&self) -> TypeDictionary;

    /// Register a handler for a type not yet known locally
    fn ensure_type_handler(&self, definition: &TypeDefinition) -> Result<()>;

    /// (Re)load an object into the live object graph
    fn load_object(&self, object_id: u64) -> Result<()>;

    /// Run a full garbage collection
    fn issue_full_garbage_collection(&self) -> Result<()>;

    /// Shut the store down
    fn shutdown(&self) -> Result<()>;
}
