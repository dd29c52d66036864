//! In-process replication log
//!
//! A partitioned, append-only log shared by every producer and consumer
//! created from the same [`MemoryLog`] handle. Consumer groups keep committed
//! positions; a new group starts at the earliest record.

use super::{LogConnector, LogConsumer, LogProducer, TransportRecord};
use crate::replication::NO_OFFSET;
use crate::replication::packet::{HEADER_STORAGE_OFFSET, parse_storage_offset};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Maximum records returned by one poll round
const MAX_POLL_RECORDS: usize = 500;

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<Vec<TransportRecord>>>,
    committed: HashMap<(String, String), Vec<usize>>,
    poll_failures: HashMap<String, String>,
}

struct Inner {
    partitions: usize,
    state: Mutex<LogState>,
    appended: Condvar,
}

impl Inner {
    fn partitions_of<'a>(&self, state: &'a mut LogState, topic: &str) -> &'a mut Vec<Vec<TransportRecord>> {
        let partitions = self.partitions;
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions])
    }

    fn append(&self, topic: &str, mut record: TransportRecord) {
        let partition = match &record.key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.partitions as u64) as usize
            }
            None => 0,
        };

        let mut state = self.state.lock();
        let log = &mut self.partitions_of(&mut state, topic)[partition];
        record.partition = partition as i32;
        record.log_offset = log.len() as i64;
        log.push(record);
        drop(state);
        self.appended.notify_all();
    }
}

/// In-memory replication log; clones share the same log
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    /// Log with a single partition per topic
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Log with `partitions` partitions per topic (at least one)
    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                state: Mutex::new(LogState::default()),
                appended: Condvar::new(),
            }),
        }
    }

    /// Append a record as-is, bypassing any producer
    pub fn append_raw(&self, topic: &str, record: TransportRecord) {
        self.inner.append(topic, record);
    }

    /// All records of `topic`, partition by partition
    pub fn records(&self, topic: &str) -> Vec<TransportRecord> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of records in `topic`
    pub fn len(&self, topic: &str) -> usize {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Committed positions of a consumer group
    pub fn committed(&self, topic: &str, group_id: &str) -> Option<Vec<usize>> {
        let state = self.inner.state.lock();
        state
            .committed
            .get(&(topic.to_string(), group_id.to_string()))
            .cloned()
    }

    /// Make the next poll on `topic` fail with a transport error
    pub fn fail_next_poll(&self, topic: &str, message: impl Into<String>) {
        self.inner
            .state
            .lock()
            .poll_failures
            .insert(topic.to_string(), message.into());
    }
}

impl LogConnector for MemoryLog {
    fn producer(&self, topic: &str) -> Result<Arc<dyn LogProducer>> {
        Ok(Arc::new(MemoryProducer {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    fn consumer(&self, topic: &str, group_id: &str) -> Result<Box<dyn LogConsumer>> {
        let positions = self
            .committed(topic, group_id)
            .unwrap_or_else(|| vec![0; self.inner.partitions]);

        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            positions,
        }))
    }

    fn tail_storage_offset(&self, topic: &str, _group_id: &str) -> Result<i64> {
        let state = self.inner.state.lock();
        let Some(partitions) = state.topics.get(topic) else {
            return Ok(NO_OFFSET);
        };

        let mut tail = NO_OFFSET;
        for partition in partitions {
            if let Some(last) = partition
                .iter()
                .rev()
                .find(|r| r.last_header(HEADER_STORAGE_OFFSET).is_some())
            {
                tail = tail.max(parse_storage_offset(last)?);
            }
        }
        Ok(tail)
    }
}

struct MemoryProducer {
    inner: Arc<Inner>,
    topic: String,
    closed: AtomicBool,
}

impl LogProducer for MemoryProducer {
    fn send(&self, record: TransportRecord) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::disposed("Producer is closed"));
        }
        self.inner.append(&self.topic, record);
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    topic: String,
    group_id: String,
    positions: Vec<usize>,
}

impl MemoryConsumer {
    fn collect(&mut self, state: &LogState) -> Vec<TransportRecord> {
        let mut records = Vec::new();
        let Some(partitions) = state.topics.get(&self.topic) else {
            return records;
        };

        for (partition, log) in partitions.iter().enumerate() {
            let position = &mut self.positions[partition];
            let available = log.len().saturating_sub(*position);
            let take = available.min(MAX_POLL_RECORDS - records.len());
            records.extend_from_slice(&log[*position..*position + take]);
            *position += take;
            if records.len() == MAX_POLL_RECORDS {
                break;
            }
        }
        records
    }
}

impl LogConsumer for MemoryConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<TransportRecord>> {
        let deadline = Instant::now() + timeout;
        let inner = self.inner.clone();
        let mut state = inner.state.lock();

        loop {
            if let Some(message) = state.poll_failures.remove(&self.topic) {
                return Err(Error::transport(message));
            }

            let records = self.collect(&state);
            if !records.is_empty() {
                return Ok(records);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            inner.appended.wait_for(&mut state, deadline - now);
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.inner.state.lock().committed.insert(
            (self.topic.clone(), self.group_id.clone()),
            self.positions.clone(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(key: &str, value: &'static [u8], offset: Option<i64>) -> TransportRecord {
        let mut record = TransportRecord::new(Bytes::from_static(value)).with_key(key);
        if let Some(offset) = offset {
            record.add_header(HEADER_STORAGE_OFFSET, offset.to_string().into_bytes());
        }
        record
    }

    #[test]
    fn test_produce_and_consume() {
        let log = MemoryLog::new();
        let producer = log.producer("t").unwrap();
        producer.send(record("k", b"a", Some(1))).unwrap();
        producer.send(record("k", b"b", Some(2))).unwrap();

        let mut consumer = log.consumer("t", "g").unwrap();
        let records = consumer.poll(Duration::from_millis(10)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].log_offset, 1);
        assert!(consumer.poll(Duration::from_millis(10)).unwrap().is_empty());
    }

    #[test]
    fn test_group_resumes_from_commit() {
        let log = MemoryLog::new();
        log.append_raw("t", record("k", b"a", Some(1)));

        let mut consumer = log.consumer("t", "g").unwrap();
        assert_eq!(consumer.poll(Duration::from_millis(10)).unwrap().len(), 1);
        consumer.commit().unwrap();
        assert_eq!(log.committed("t", "g"), Some(vec![1]));

        log.append_raw("t", record("k", b"b", Some(2)));
        let mut resumed = log.consumer("t", "g").unwrap();
        let records = resumed.poll(Duration::from_millis(10)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, Bytes::from_static(b"b"));

        let mut fresh = log.consumer("t", "other").unwrap();
        assert_eq!(fresh.poll(Duration::from_millis(10)).unwrap().len(), 2);
    }

    #[test]
    fn test_poll_wakes_on_append() {
        let log = MemoryLog::new();
        let mut consumer = log.consumer("t", "g").unwrap();

        let writer = log.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.append_raw("t", record("k", b"late", Some(1)));
        });

        let records = consumer.poll(Duration::from_secs(5)).unwrap();
        assert_eq!(records.len(), 1);
        handle.join().unwrap();
    }

    #[test]
    fn test_tail_skips_foreign_records() {
        let log = MemoryLog::with_partitions(4);
        assert_eq!(log.tail_storage_offset("t", "g").unwrap(), NO_OFFSET);

        log.append_raw("t", record("a", b"1", Some(10)));
        log.append_raw("t", record("b", b"2", Some(12)));
        log.append_raw("t", record("b", b"3", None));
        assert_eq!(log.tail_storage_offset("t", "g").unwrap(), 12);
    }

    #[test]
    fn test_injected_poll_failure_is_one_shot() {
        let log = MemoryLog::new();
        let mut consumer = log.consumer("t", "g").unwrap();
        log.fail_next_poll("t", "broker down");

        assert!(matches!(
            consumer.poll(Duration::from_millis(10)),
            Err(Error::Transport(_))
        ));
        assert!(consumer.poll(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_closed_producer_rejects_send() {
        let log = MemoryLog::new();
        let producer = log.producer("t").unwrap();
        producer.close().unwrap();
        assert!(producer.send(record("k", b"x", None)).is_err());
    }
}
