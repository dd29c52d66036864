//! Replication protocol and role engine
//!
//! One node (the distributor) publishes every committed write and every type
//! dictionary change to the replication log. All other nodes consume the log
//! and merge the records into their local store.
//!
//! # Architecture
//!
//! ```text
//!  write ──► ActivatableDistributor ──► CachingDistributor ──► LogDistributor
//!                                                                  │ packets
//!                                                                  ▼
//!                                                          replication log
//!                                                                  │
//!  local store ◄── StorageMerger ◄── ActivatableMerger ◄── PacketAcceptor ◄── LogClient
//! ```
//!
//! # Offsets
//!
//! Every packet carries a storage offset that the distributor increments once
//! per packet. Consumers only apply packets whose offset is above the last
//! applied one, which makes at-least-once delivery idempotent. The last
//! applied offset is persisted as decimal text in the node's `offset` file.

pub mod acceptor;
pub mod client;
pub mod distributor;
pub mod gate;
pub mod merger;
pub mod message;
pub mod offset;
pub mod packet;

pub use acceptor::{BinaryDataReceiver, DataBatch, PacketAcceptor};
pub use client::{LogClient, LogClientOptions, LogClientState};
pub use distributor::{BinaryDataDistributor, CachingDistributor, DistributionMode, LogDistributor};
pub use gate::{ActivatableDistributor, ActivatableMerger};
pub use merger::{GraphUpdateBarrier, StorageMerger};
pub use message::Message;
pub use offset::{OffsetFileWriter, OffsetStore};
pub use packet::{MessageType, Packet, PacketCodec, PacketHeader};

/// Offset value meaning "nothing applied or published yet"
pub const NO_OFFSET: i64 = i64::MIN;

/// Ordering key used for every replication record
pub const DEFAULT_ORDERING_KEY: &str = "storage";
