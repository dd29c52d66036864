//! Apache Kafka replication log (feature `kafka`)

use super::{LogConnector, LogConsumer, LogProducer, RecordHeader, TransportRecord};
use crate::config::KafkaConfig;
use crate::replication::NO_OFFSET;
use crate::replication::packet::parse_storage_offset;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use rdkafka::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Maximum records returned by one poll round
const MAX_POLL_RECORDS: usize = 500;

/// Timeout of metadata and watermark requests
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

fn kafka_error(context: &str, e: KafkaError) -> Error {
    Error::transport(format!("{}: {}", context, e))
}

/// First delivery error reported by the broker since the last flush
#[derive(Default)]
struct DeliveryFailures {
    first: Mutex<Option<String>>,
}

impl DeliveryFailures {
    fn record(&self, error: &KafkaError) {
        let mut first = self.first.lock();
        if first.is_none() {
            *first = Some(error.to_string());
        }
    }

    /// Fail without clearing the recorded error
    fn check(&self) -> Result<()> {
        match self.first.lock().as_ref() {
            Some(failure) => Err(delivery_error(failure)),
            None => Ok(()),
        }
    }

    fn take(&self) -> Result<()> {
        match self.first.lock().take() {
            Some(failure) => Err(delivery_error(&failure)),
            None => Ok(()),
        }
    }
}

fn delivery_error(failure: &str) -> Error {
    Error::transport(format!("Delivery failed: {}", failure))
}

/// Collects delivery reports of the producer's background thread
struct DeliveryContext {
    failures: Arc<DeliveryFailures>,
}

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _opaque: Self::DeliveryOpaque) {
        if let Err((e, _)) = result {
            warn!("Kafka delivery failed: {}", e);
            self.failures.record(e);
        }
    }
}

/// Creates Kafka producers and consumers from one client configuration
pub struct KafkaConnector {
    config: KafkaConfig,
}

impl KafkaConnector {
    /// Create a connector
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.config.bootstrap_servers);
        if let Some(protocol) = &self.config.security_protocol {
            config.set("security.protocol", protocol);
        }
        if let Some(mechanism) = &self.config.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &self.config.username {
            config.set("sasl.username", username);
        }
        if let Some(password) = &self.config.password {
            config.set("sasl.password", password);
        }
        for (key, value) in &self.config.properties {
            config.set(key, value);
        }
        config
    }

    fn consumer_config(&self, group_id: &str, reset: &str) -> ClientConfig {
        let mut config = self.client_config();
        config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", reset)
            .set("allow.auto.create.topics", "false")
            .set("isolation.level", "read_committed");
        config
    }
}

impl LogConnector for KafkaConnector {
    fn producer(&self, topic: &str) -> Result<Arc<dyn LogProducer>> {
        let failures = Arc::new(DeliveryFailures::default());
        let producer: ThreadedProducer<DeliveryContext> = self
            .client_config()
            .set("compression.type", "zstd")
            .set("enable.idempotence", "true")
            .create_with_context(DeliveryContext {
                failures: failures.clone(),
            })
            .map_err(|e| kafka_error("Failed to create producer", e))?;

        info!("Kafka producer created for topic {}", topic);
        Ok(Arc::new(KafkaProducer {
            producer,
            failures,
            topic: topic.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    fn consumer(&self, topic: &str, group_id: &str) -> Result<Box<dyn LogConsumer>> {
        let consumer: BaseConsumer = self
            .consumer_config(group_id, "earliest")
            .create()
            .map_err(|e| kafka_error("Failed to create consumer", e))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| kafka_error("Failed to subscribe", e))?;

        info!("Kafka consumer {} subscribed to {}", group_id, topic);
        Ok(Box::new(KafkaConsumer { consumer }))
    }

    fn tail_storage_offset(&self, topic: &str, group_id: &str) -> Result<i64> {
        let consumer: BaseConsumer = self
            .consumer_config(group_id, "latest")
            .create()
            .map_err(|e| kafka_error("Failed to create tail consumer", e))?;

        let metadata = consumer
            .fetch_metadata(Some(topic), METADATA_TIMEOUT)
            .map_err(|e| kafka_error("Failed to fetch metadata", e))?;
        let Some(topic_metadata) = metadata.topics().iter().find(|t| t.name() == topic) else {
            warn!("Kafka topic {} contains no partitions", topic);
            return Ok(NO_OFFSET);
        };

        let mut assignment = TopicPartitionList::new();
        for partition in topic_metadata.partitions() {
            let (low, high) = consumer
                .fetch_watermarks(topic, partition.id(), METADATA_TIMEOUT)
                .map_err(|e| kafka_error("Failed to fetch watermarks", e))?;
            if high > low {
                assignment
                    .add_partition_offset(topic, partition.id(), Offset::Offset(high - 1))
                    .map_err(|e| kafka_error("Failed to build assignment", e))?;
            }
        }

        let expected = assignment.count();
        if expected == 0 {
            warn!("Kafka topic {} contains no committed messages", topic);
            return Ok(NO_OFFSET);
        }
        consumer
            .assign(&assignment)
            .map_err(|e| kafka_error("Failed to assign partitions", e))?;

        // One record per partition: the last one
        let mut tail = NO_OFFSET;
        let mut seen = 0;
        let deadline = Instant::now() + METADATA_TIMEOUT;
        while seen < expected && Instant::now() < deadline {
            match consumer.poll(Duration::from_millis(500)) {
                Some(Ok(message)) => {
                    seen += 1;
                    let record = to_record(&message);
                    match parse_storage_offset(&record) {
                        Ok(offset) => tail = tail.max(offset),
                        Err(e) => warn!("Tail record without storage offset: {}", e),
                    }
                }
                Some(Err(e)) => return Err(kafka_error("Failed to read tail record", e)),
                None => {}
            }
        }

        if seen < expected {
            return Err(Error::transport(format!(
                "Failed to read the last record of {} partition(s)",
                expected - seen
            )));
        }
        Ok(tail)
    }
}

struct KafkaProducer {
    producer: ThreadedProducer<DeliveryContext>,
    failures: Arc<DeliveryFailures>,
    topic: String,
    closed: AtomicBool,
}

impl LogProducer for KafkaProducer {
    fn send(&self, record: TransportRecord) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::disposed("Producer is closed"));
        }
        self.failures.check()?;

        let mut headers = OwnedHeaders::new();
        for header in &record.headers {
            headers = headers.insert(Header {
                key: header.key.as_str(),
                value: Some(header.value.as_slice()),
            });
        }

        let mut base = BaseRecord::<str, [u8]>::to(&self.topic)
            .payload(record.value.as_ref())
            .headers(headers);
        if let Some(key) = record.key.as_deref() {
            base = base.key(key);
        }

        self.producer
            .send(base)
            .map_err(|(e, _)| kafka_error("Failed to enqueue record", e))
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| kafka_error("Failed to flush producer", e))?;
        // Reports of everything sent so far have arrived
        self.failures.take()
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.flush(Duration::from_secs(30))
    }
}

struct KafkaConsumer {
    consumer: BaseConsumer,
}

impl LogConsumer for KafkaConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<TransportRecord>> {
        let mut records = Vec::new();
        let mut wait = timeout;

        while records.len() < MAX_POLL_RECORDS {
            match self.consumer.poll(wait) {
                Some(Ok(message)) => records.push(to_record(&message)),
                Some(Err(e)) => return Err(kafka_error("Poll failed", e)),
                None => break,
            }
            wait = Duration::ZERO;
        }

        debug!("Polled {} record(s)", records.len());
        Ok(records)
    }

    fn commit(&mut self) -> Result<()> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => Ok(()),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(kafka_error("Commit failed", e)),
        }
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> TransportRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| RecordHeader {
                    key: h.key.to_string(),
                    value: h.value.map(<[u8]>::to_vec).unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    TransportRecord {
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned()),
        headers,
        value: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
        partition: message.partition(),
        log_offset: message.offset(),
    }
}
