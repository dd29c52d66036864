//! Write-side distribution
//!
//! [`LogDistributor`] fragments every committed write and type dictionary into
//! packets, stamps each packet with the next storage offset and publishes it
//! to the replication log under a single ordering key. [`CachingDistributor`]
//! holds back type dictionary updates until the next data write.
//!
//! Two execution modes are supported:
//!
//! - **Sync**: publish on the calling thread and flush the producer before
//!   returning, so broker back-pressure reaches the writer. A failed publish
//!   may leave part of a message on the log, so it closes the distributor
//! - **Async**: queue the work to one dedicated worker thread; FIFO execution
//!   keeps packets in order

use super::acceptor::DataBatch;
use super::packet::{MessageType, PacketCodec};
use super::NO_OFFSET;
use crate::transport::LogProducer;
use crate::{Error, Result};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Capacity of the Async distributor's command queue
const ASYNC_QUEUE_CAPACITY: usize = 1024;

/// Publishing side of replication
pub trait BinaryDataDistributor: Send + Sync {
    /// Publish the binary entity data of one committed write
    fn distribute_data(&self, batch: DataBatch) -> Result<()>;

    /// Publish a full type dictionary document
    fn distribute_type_dictionary(&self, type_dictionary: &str) -> Result<()>;

    /// Release the underlying producer and workers
    fn dispose(&self) -> Result<()>;
}

/// Execution mode of a [`LogDistributor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionMode {
    /// Publish on the calling thread
    #[default]
    Sync,
    /// Publish on a dedicated worker thread
    Async,
}

/// Defers type dictionary updates until the next data write
pub struct CachingDistributor {
    delegate: Arc<dyn BinaryDataDistributor>,
    pending: Mutex<Option<String>>,
}

impl CachingDistributor {
    /// Wrap `delegate`
    pub fn new(delegate: Arc<dyn BinaryDataDistributor>) -> Self {
        Self {
            delegate,
            pending: Mutex::new(None),
        }
    }

    /// Is a type dictionary waiting for the next data write
    pub fn has_pending_type_dictionary(&self) -> bool {
        self.pending.lock().is_some()
    }
}

impl BinaryDataDistributor for CachingDistributor {
    fn distribute_data(&self, batch: DataBatch) -> Result<()> {
        let mut pending = self.pending.lock();
        if let Some(type_dictionary) = pending.take() {
            if let Err(e) = self.delegate.distribute_type_dictionary(&type_dictionary) {
                *pending = Some(type_dictionary);
                return Err(e);
            }
        }
        self.delegate.distribute_data(batch)
    }

    fn distribute_type_dictionary(&self, type_dictionary: &str) -> Result<()> {
        *self.pending.lock() = Some(type_dictionary.to_string());
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        self.pending.lock().take();
        self.delegate.dispose()
    }
}

/// Fragments, stamps and sends packets
struct Publisher {
    producer: Arc<dyn LogProducer>,
    codec: PacketCodec,
    ordering_key: String,
    storage_offset: AtomicI64,
    flush_timeout: Duration,
}

impl Publisher {
    fn publish(&self, message_type: MessageType, chunks: &[Bytes]) -> Result<()> {
        let packets = self.codec.fragment(message_type, chunks)?;
        let count = packets.len();

        for mut packet in packets {
            packet.storage_offset = self.storage_offset.fetch_add(1, Ordering::SeqCst) + 1;
            self.producer.send(packet.into_record(&self.ordering_key))?;
        }

        debug!("Published {} message in {} packet(s)", message_type, count);
        Ok(())
    }
}

/// Commands sent to the Async distributor worker
enum DistributorCommand {
    /// Publish one message
    Publish(MessageType, Vec<Bytes>),
    /// Flush the producer and report back
    Flush(Sender<Result<()>>),
    /// Stop the worker after everything queued before
    Shutdown,
}

enum Execution {
    Sync {
        publish_lock: Mutex<()>,
    },
    Async {
        sender: Sender<DistributorCommand>,
        handle: Mutex<Option<JoinHandle<()>>>,
    },
}

/// Publishes replication messages to the log
pub struct LogDistributor {
    publisher: Arc<Publisher>,
    execution: Execution,
    disposed: AtomicBool,
    failure: Arc<Mutex<Option<String>>>,
}

impl LogDistributor {
    /// Create a distributor publishing through `producer`
    pub fn new(
        producer: Arc<dyn LogProducer>,
        codec: PacketCodec,
        ordering_key: impl Into<String>,
        mode: DistributionMode,
        flush_timeout: Duration,
    ) -> Result<Self> {
        let publisher = Arc::new(Publisher {
            producer,
            codec,
            ordering_key: ordering_key.into(),
            storage_offset: AtomicI64::new(NO_OFFSET),
            flush_timeout,
        });
        let failure = Arc::new(Mutex::new(None));

        let execution = match mode {
            DistributionMode::Sync => Execution::Sync {
                publish_lock: Mutex::new(()),
            },
            DistributionMode::Async => {
                let (sender, receiver) = bounded(ASYNC_QUEUE_CAPACITY);
                let worker_publisher = publisher.clone();
                let worker_failure = failure.clone();
                let handle = thread::Builder::new()
                    .name("storage-distributor".to_string())
                    .spawn(move || Self::worker_thread(worker_publisher, receiver, worker_failure))?;
                Execution::Async {
                    sender,
                    handle: Mutex::new(Some(handle)),
                }
            }
        };

        info!("Log distributor started ({:?})", mode);

        Ok(Self {
            publisher,
            execution,
            disposed: AtomicBool::new(false),
            failure,
        })
    }

    /// Execution mode
    pub fn mode(&self) -> DistributionMode {
        match self.execution {
            Execution::Sync { .. } => DistributionMode::Sync,
            Execution::Async { .. } => DistributionMode::Async,
        }
    }

    /// Last storage offset handed out
    pub fn storage_offset(&self) -> i64 {
        self.publisher.storage_offset.load(Ordering::SeqCst)
    }

    /// Seed the offset counter; the next packet gets `offset + 1`
    pub fn set_storage_offset(&self, offset: i64) {
        self.publisher.storage_offset.store(offset, Ordering::SeqCst);
    }

    /// Error that stopped the distributor, if any
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Block until everything published so far is acknowledged by the broker
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        match &self.execution {
            Execution::Sync { publish_lock } => {
                let _guard = publish_lock.lock();
                self.publisher.producer.flush(self.publisher.flush_timeout)
            }
            Execution::Async { sender, .. } => {
                let (reply, response) = bounded(1);
                self.send_command(sender, DistributorCommand::Flush(reply))?;
                response.recv().map_err(|_| self.worker_gone())?
            }
        }
    }

    fn publish(&self, message_type: MessageType, chunks: Vec<Bytes>) -> Result<()> {
        self.ensure_open()?;
        match &self.execution {
            Execution::Sync { publish_lock } => {
                let _guard = publish_lock.lock();
                let result = self
                    .publisher
                    .publish(message_type, &chunks)
                    .and_then(|()| self.publisher.producer.flush(self.publisher.flush_timeout));
                if let Err(e) = &result {
                    error!("Distributor failed to publish: {}", e);
                    *self.failure.lock() = Some(e.to_string());
                }
                result
            }
            Execution::Async { sender, .. } => {
                self.send_command(sender, DistributorCommand::Publish(message_type, chunks))
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::disposed("Distributor has been disposed"));
        }
        if let Some(failure) = self.failure() {
            return Err(Error::transport(format!("Distributor failed: {}", failure)));
        }
        Ok(())
    }

    fn send_command(
        &self,
        sender: &Sender<DistributorCommand>,
        command: DistributorCommand,
    ) -> Result<()> {
        sender.send(command).map_err(|_| self.worker_gone())
    }

    fn worker_gone(&self) -> Error {
        match self.failure() {
            Some(failure) => Error::transport(format!("Distributor failed: {}", failure)),
            None => Error::disposed("Distributor worker has stopped"),
        }
    }

    /// Background worker of the Async mode
    fn worker_thread(
        publisher: Arc<Publisher>,
        receiver: Receiver<DistributorCommand>,
        failure: Arc<Mutex<Option<String>>>,
    ) {
        while let Ok(command) = receiver.recv() {
            match command {
                DistributorCommand::Publish(message_type, chunks) => {
                    if let Err(e) = publisher.publish(message_type, &chunks) {
                        error!("Distributor worker failed to publish: {}", e);
                        *failure.lock() = Some(e.to_string());
                        break;
                    }
                }
                DistributorCommand::Flush(reply) => {
                    let _ = reply.send(publisher.producer.flush(publisher.flush_timeout));
                }
                DistributorCommand::Shutdown => break,
            }
        }
        debug!("Distributor worker stopped");
    }
}

impl BinaryDataDistributor for LogDistributor {
    fn distribute_data(&self, batch: DataBatch) -> Result<()> {
        self.publish(MessageType::Data, batch.chunks().to_vec())
    }

    fn distribute_type_dictionary(&self, type_dictionary: &str) -> Result<()> {
        self.publish(
            MessageType::TypeDictionary,
            vec![Bytes::copy_from_slice(type_dictionary.as_bytes())],
        )
    }

    fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Execution::Async { sender, handle } = &self.execution {
            let _ = sender.send(DistributorCommand::Shutdown);
            if let Some(handle) = handle.lock().take() {
                handle
                    .join()
                    .map_err(|_| Error::invalid_state("Distributor worker panicked"))?;
            }
        }

        self.publisher.producer.close()?;
        info!("Log distributor disposed");
        Ok(())
    }
}

impl Drop for LogDistributor {
    fn drop(&mut self) {
        let _ = BinaryDataDistributor::dispose(self);
    }
}
