//! Replication log transport
//!
//! The replication log is an ordered, partitioned, append-only broker channel.
//! The core only talks to it through the traits in this module; concrete
//! brokers are supplied by the node composition:
//!
//! - [`memory::MemoryLog`]: in-process log for tests and single-host clusters
//! - `kafka::KafkaConnector`: Apache Kafka via librdkafka (feature `kafka`)

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use memory::MemoryLog;

use crate::Result;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Out-of-band attribute attached to a transport record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// Header key
    pub key: String,
    /// Raw header value
    pub value: Vec<u8>,
}

/// A single record as carried by the replication log
#[derive(Debug, Clone)]
pub struct TransportRecord {
    /// Ordering key; records with the same key land on the same partition
    pub key: Option<String>,
    /// Out-of-band headers, in insertion order
    pub headers: Vec<RecordHeader>,
    /// Record payload
    pub value: Bytes,
    /// Partition assigned by the broker (`-1` before publishing)
    pub partition: i32,
    /// Broker-side position within the partition (`-1` before publishing)
    pub log_offset: i64,
}

impl TransportRecord {
    /// Create an unpublished record carrying `value`
    pub fn new(value: Bytes) -> Self {
        Self {
            key: None,
            headers: Vec::new(),
            value,
            partition: -1,
            log_offset: -1,
        }
    }

    /// Set the ordering key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Append a header. Repeated keys are allowed; readers use the last one.
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.headers.push(RecordHeader {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Value of the last header with the given key
    pub fn last_header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .rev()
            .find(|h| h.key == key)
            .map(|h| h.value.as_slice())
    }
}

/// Publishing side of the replication log
pub trait LogProducer: Send + Sync {
    /// Hand a record to the broker
    fn send(&self, record: TransportRecord) -> Result<()>;

    /// Block until every record handed over so far is acknowledged
    fn flush(&self, timeout: Duration) -> Result<()>;

    /// Flush outstanding records and release the producer
    fn close(&self) -> Result<()>;
}

/// Consuming side of the replication log
pub trait LogConsumer: Send {
    /// Fetch the next round of records, waiting at most `timeout` for the first one.
    ///
    /// An empty round means the consumer has caught up with the tail.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<TransportRecord>>;

    /// Persist the consumer's position for its group
    fn commit(&mut self) -> Result<()>;
}

/// Factory for producers and consumers of one broker.
///
/// Passed explicitly to the node at construction time.
pub trait LogConnector: Send + Sync {
    /// Create a producer for `topic`
    fn producer(&self, topic: &str) -> Result<Arc<dyn LogProducer>>;

    /// Create a consumer of `topic` in consumer group `group_id`
    fn consumer(&self, topic: &str, group_id: &str) -> Result<Box<dyn LogConsumer>>;

    /// Highest storage offset stamped on the last record of the furthest partition.
    ///
    /// Returns `i64::MIN` when the topic holds no records yet.
    fn tail_storage_offset(&self, topic: &str, group_id: &str) -> Result<i64>;
}
