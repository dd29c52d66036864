//! gridrep Core - Replication for an embedded object store
//!
//! This crate replicates an embedded object-graph store across a cluster of
//! nodes through a partitioned, append-only broker log:
//! - Packet codec that splits large messages into header-tagged packets
//! - Packet reassembly and batch dispatch to the local store
//! - Distributor (single writer) and merger (followers) roles behind gates
//! - Offset-tracked log client with a persisted applied offset
//! - Role controller that promotes a caught-up follower to distributor
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             Cluster Node                     │
//! │   (Role Controller, Storer, Lifecycle)      │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │           Replication Layer                  │
//! │ (Distributor, Merger, Gates, Log Client)    │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │         Packet Codec / Transport             │
//! │      (Fragmentation, Headers, Broker)       │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │            Storage Engine                    │
//! │  (Entity Data, Type Dictionary, Objects)    │
//! └─────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod replication;
pub mod storage;
pub mod testing;
pub mod transport;

pub use cluster::{ClusterNode, RoleController, Storer};
pub use config::{ClusterConfig, KafkaConfig, StoreFailurePolicy};
pub use error::{Error, Result};
pub use replication::{DistributionMode, LogClientState, NO_OFFSET};
pub use storage::{EntityRecord, MemoryStorage, StorageEngine, TypeDefinition, TypeDictionary};
pub use transport::{LogConnector, MemoryLog};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_structure() {
        let config = ClusterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(NO_OFFSET, i64::MIN);
    }

    #[test]
    fn test_error_types() {
        let err = Error::NotADistributor;
        assert!(!err.to_string().is_empty());
        assert!(Error::decode("bad header").to_string().contains("bad header"));
    }
}
