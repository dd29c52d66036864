//! Offset-tracked log client
//!
//! Consumes the replication log on a dedicated thread, forwards every packet
//! whose storage offset is above the last applied one to the
//! [`PacketAcceptor`], and persists progress through the
//! [`OffsetFileWriter`]. While a message is only partially received, the
//! persisted offset stays just before its first packet.
//!
//! ```text
//! STOPPED ──start──► ACTIVE ──stop_at_latest_offset──► DRAINING ──► FINISHED
//!                      │                                   │
//!                      └────────── poll/merge error ───────┴──► FAILED
//! ```

use super::acceptor::PacketAcceptor;
use super::offset::{OffsetFileWriter, OffsetStore};
use super::packet::{Packet, is_replication_record, parse_storage_offset};
use crate::transport::{LogConnector, LogConsumer, TransportRecord};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Observable state of a [`LogClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogClientState {
    /// Not consuming
    Stopped,
    /// Consuming and applying records
    Active,
    /// Consuming up to the tail captured at the drain request
    Draining,
    /// Loop terminated cleanly
    Finished,
    /// Loop aborted on an error
    Failed,
}

/// Connection settings of a [`LogClient`]
#[derive(Debug, Clone)]
pub struct LogClientOptions {
    /// Replication topic
    pub topic: String,
    /// Consumer group id
    pub group_id: String,
    /// Maximum wait of one poll round
    pub poll_timeout: Duration,
    /// Persist the applied offset to the offset file
    pub persist_offsets: bool,
}

/// State shared between the consumer thread and control callers
struct Shared {
    active: AtomicBool,
    /// Bumped by every `unready()`
    unready_epoch: AtomicU64,
    /// One past the epoch in which the last empty poll round started
    ready_mark: AtomicU64,
    finished: AtomicBool,
    exited: AtomicBool,
    drain_requested: AtomicBool,
    draining: AtomicBool,
    shutdown: AtomicBool,
    storage_offset: AtomicI64,
    failure: Mutex<Option<String>>,
}

/// Owned by the consumer thread
struct Worker {
    shared: Arc<Shared>,
    consumer: Box<dyn LogConsumer>,
    connector: Arc<dyn LogConnector>,
    acceptor: PacketAcceptor,
    offsets: Arc<OffsetStore>,
    writer: Option<OffsetFileWriter>,
    options: LogClientOptions,
}

/// Consumes the replication log and feeds the packet acceptor
pub struct LogClient {
    shared: Arc<Shared>,
    group_id: String,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LogClient {
    /// Subscribe to the topic and start consuming after `start_offset`
    pub fn start(
        options: LogClientOptions,
        connector: Arc<dyn LogConnector>,
        acceptor: PacketAcceptor,
        offsets: Arc<OffsetStore>,
        start_offset: i64,
    ) -> Result<Self> {
        let consumer = connector.consumer(&options.topic, &options.group_id)?;
        let writer = if options.persist_offsets {
            Some(OffsetFileWriter::new(offsets.clone())?)
        } else {
            None
        };

        let shared = Arc::new(Shared {
            active: AtomicBool::new(true),
            unready_epoch: AtomicU64::new(0),
            ready_mark: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            drain_requested: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            storage_offset: AtomicI64::new(start_offset),
            failure: Mutex::new(None),
        });

        let group_id = options.group_id.clone();
        let worker = Worker {
            shared: shared.clone(),
            consumer,
            connector,
            acceptor,
            offsets,
            writer,
            options,
        };
        let handle = thread::Builder::new()
            .name("storage-log-client".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            group_id,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Consumer group id
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Is the loop consuming
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Has a poll round that started after the last `unready()` come back empty
    pub fn is_ready(&self) -> bool {
        self.shared.ready_mark.load(Ordering::SeqCst)
            > self.shared.unready_epoch.load(Ordering::SeqCst)
    }

    /// Has the loop terminated cleanly
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// Require a fresh empty poll round before `is_ready()` is true again
    pub fn unready(&self) {
        self.shared.unready_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Last applied storage offset
    pub fn storage_offset(&self) -> i64 {
        self.shared.storage_offset.load(Ordering::SeqCst)
    }

    /// Error that aborted the loop, if any
    pub fn failure(&self) -> Option<String> {
        self.shared.failure.lock().clone()
    }

    /// Current state
    pub fn state(&self) -> LogClientState {
        if self.shared.failure.lock().is_some() {
            LogClientState::Failed
        } else if self.is_finished() {
            LogClientState::Finished
        } else if self.shared.draining.load(Ordering::SeqCst)
            && !self.shared.exited.load(Ordering::SeqCst)
        {
            LogClientState::Draining
        } else if self.is_active() {
            LogClientState::Active
        } else {
            LogClientState::Stopped
        }
    }

    /// Consume up to the current tail, persist the offset, create the
    /// `stopped` marker and terminate
    pub fn stop_at_latest_offset(&self) {
        info!("Stop at latest offset requested");
        self.shared.drain_requested.store(true, Ordering::SeqCst);
    }

    /// Poll until the loop finished, failed, or `timeout` elapsed.
    ///
    /// Returns `LogClientStopped` as soon as the loop exits without finishing.
    pub fn wait_until_finished(&self, timeout: Duration, interval: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            // Read before the outcome flags, which the loop sets first
            let exited = self.shared.exited.load(Ordering::SeqCst);
            if self.is_finished() {
                return Ok(());
            }
            if let Some(failure) = self.failure() {
                return Err(Error::LogClientStopped(failure));
            }
            if exited {
                return Err(Error::LogClientStopped(
                    "Log client stopped before the drain completed".to_string(),
                ));
            }
            if Instant::now() >= deadline {
                return Err(Error::invalid_state(format!(
                    "Log client did not finish within {:?}",
                    timeout
                )));
            }
            thread::sleep(interval);
        }
    }

    /// Stop the loop and join its thread; idempotent
    pub fn dispose(&self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.active.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.lock().take() {
            handle
                .join()
                .map_err(|_| Error::invalid_state("Log client thread panicked"))?;
            info!("Log client stopped at offset {}", self.storage_offset());
        }
        Ok(())
    }
}

impl Drop for LogClient {
    fn drop(&mut self) {
        let _ = self.dispose();
    }
}

impl Worker {
    fn run(mut self) {
        info!(
            "Starting reading {} with storage offset {}",
            self.options.topic,
            self.shared.storage_offset.load(Ordering::SeqCst)
        );

        match self.consume_loop() {
            Ok(true) => self.shared.finished.store(true, Ordering::SeqCst),
            Ok(false) => warn!("Log client interrupted before the drain completed"),
            Err(e) => {
                error!("Log client aborted: {}", e);
                *self.shared.failure.lock() = Some(e.to_string());
            }
        }

        self.shared.active.store(false, Ordering::SeqCst);
        self.acceptor.dispose();
        if let Some(writer) = &self.writer {
            writer.dispose();
        }
        self.shared.exited.store(true, Ordering::SeqCst);
    }

    /// Returns `Ok(false)` if shut down in the middle of a drain
    fn consume_loop(&mut self) -> Result<bool> {
        while self.shared.active.load(Ordering::SeqCst) {
            if self.shared.drain_requested.load(Ordering::SeqCst) {
                return self.drain();
            }

            let round = self.shared.unready_epoch.load(Ordering::SeqCst);
            let records = self.consumer.poll(self.options.poll_timeout)?;
            let empty = records.is_empty();
            self.consume(records)?;
            // Caught up with the tail
            if empty {
                self.shared.ready_mark.fetch_max(round + 1, Ordering::SeqCst);
            }
            self.consumer.commit()?;
        }
        Ok(true)
    }

    fn drain(&mut self) -> Result<bool> {
        self.shared.draining.store(true, Ordering::SeqCst);
        self.shared.active.store(false, Ordering::SeqCst);

        info!("Checking latest storage offset...");
        let stop_at = self
            .connector
            .tail_storage_offset(&self.options.topic, &self.options.group_id)?;
        info!("Stopping at storage offset {}", stop_at);

        while self.shared.storage_offset.load(Ordering::SeqCst) < stop_at {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let records = self.consumer.poll(self.options.poll_timeout)?;
            self.consume(records)?;
        }

        if let Some(writer) = &self.writer {
            let offset = self.resume_offset();
            if writer.last_written_offset() != offset {
                writer.write_sync(offset)?;
            }
        }

        if let Err(e) = self.offsets.mark_stopped() {
            error!("Failed to create 'stopped' file: {}", e);
        }

        self.consumer.commit()?;
        info!(
            "Completed updates. Stopped at offset {}",
            self.shared.storage_offset.load(Ordering::SeqCst)
        );
        Ok(true)
    }

    /// Forward not yet applied packets; foreign records are dropped
    fn consume(&mut self, records: Vec<TransportRecord>) -> Result<()> {
        let mut applied = self.shared.storage_offset.load(Ordering::SeqCst);
        let mut packets = Vec::new();

        for record in records {
            if !is_replication_record(&record) {
                warn!(
                    "Dropping foreign record at partition {} position {}",
                    record.partition, record.log_offset
                );
                continue;
            }

            let offset = parse_storage_offset(&record)?;
            if offset > applied {
                packets.push(Packet::from_record(&record)?);
                applied = offset;
            } else {
                debug!("Skipping already applied storage offset {}", offset);
            }
        }

        if packets.is_empty() {
            return Ok(());
        }

        debug!("Applying {} packet(s) up to offset {}", packets.len(), applied);
        self.acceptor.accept(packets)?;
        self.shared.storage_offset.store(applied, Ordering::SeqCst);
        if let Some(writer) = &self.writer {
            writer.try_write(self.resume_offset());
        }
        Ok(())
    }

    /// Offset to persist: a restart must replay every packet of a message
    /// that is still being assembled
    fn resume_offset(&self) -> i64 {
        let applied = self.shared.storage_offset.load(Ordering::SeqCst);
        match self.acceptor.pending_first_offset() {
            Some(first) => first.saturating_sub(1).min(applied),
            None => applied,
        }
    }
}
