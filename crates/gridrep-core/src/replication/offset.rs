//! Offset persistence
//!
//! The last applied storage offset is kept as decimal text in the `offset`
//! file of the node's state directory. A completed drain leaves a `stopped`
//! marker next to it.

use super::NO_OFFSET;
use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the offset file
pub const OFFSET_FILE_NAME: &str = "offset";

/// Name of the drain-completed marker
pub const STOPPED_MARKER_NAME: &str = "stopped";

/// Offset file and stopped marker of one state directory
#[derive(Debug)]
pub struct OffsetStore {
    dir: PathBuf,
}

impl OffsetStore {
    /// Open the store, creating the directory if needed
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Path of the offset file
    pub fn offset_path(&self) -> PathBuf {
        self.dir.join(OFFSET_FILE_NAME)
    }

    /// Path of the stopped marker
    pub fn stopped_path(&self) -> PathBuf {
        self.dir.join(STOPPED_MARKER_NAME)
    }

    /// Read the persisted offset, creating the file with the sentinel if missing
    pub fn load_or_create(&self) -> Result<i64> {
        let path = self.offset_path();
        if !path.exists() {
            info!("Creating offset file {}", path.display());
            self.write(NO_OFFSET)?;
            return Ok(NO_OFFSET);
        }

        let text = fs::read_to_string(&path)?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(NO_OFFSET);
        }
        text.parse::<i64>().map_err(|e| {
            Error::storage(format!(
                "Invalid offset file {}: {:?} ({})",
                path.display(),
                text,
                e
            ))
        })
    }

    /// Replace the persisted offset
    pub fn write(&self, offset: i64) -> Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", OFFSET_FILE_NAME));
        fs::write(&tmp, offset.to_string())?;
        fs::rename(&tmp, self.offset_path())?;
        Ok(())
    }

    /// Create the stopped marker
    pub fn mark_stopped(&self) -> Result<()> {
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.stopped_path())?;
        Ok(())
    }

    /// Does the stopped marker exist
    pub fn is_stopped(&self) -> bool {
        self.stopped_path().exists()
    }

    /// Remove the stopped marker
    pub fn clear_stopped(&self) -> Result<()> {
        match fs::remove_file(self.stopped_path()) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

enum WriterCommand {
    Write(i64),
    Shutdown,
}

/// Best-effort, single-flight offset writer.
///
/// At most one write is in flight; requests arriving meanwhile are dropped.
/// Writes happen on a dedicated thread so the consumer loop never blocks on
/// disk I/O.
pub struct OffsetFileWriter {
    store: Arc<OffsetStore>,
    sender: Sender<WriterCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
    in_flight: Arc<AtomicBool>,
    last_written: Arc<AtomicI64>,
}

impl OffsetFileWriter {
    /// Start a writer for `store`
    pub fn new(store: Arc<OffsetStore>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let in_flight = Arc::new(AtomicBool::new(false));
        let last_written = Arc::new(AtomicI64::new(NO_OFFSET));

        let handle = {
            let store = store.clone();
            let in_flight = in_flight.clone();
            let last_written = last_written.clone();
            thread::Builder::new()
                .name("offset-file-writer".to_string())
                .spawn(move || Self::writer_thread(store, receiver, in_flight, last_written))?
        };

        Ok(Self {
            store,
            sender,
            handle: Mutex::new(Some(handle)),
            in_flight,
            last_written,
        })
    }

    /// Request a write; returns `false` if dropped because a write is in flight
    pub fn try_write(&self, offset: i64) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        if self.sender.send(WriterCommand::Write(offset)).is_err() {
            self.in_flight.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Write on the calling thread once any in-flight write has finished
    pub fn write_sync(&self, offset: i64) -> Result<()> {
        while self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            thread::sleep(Duration::from_millis(1));
        }

        let result = self.store.write(offset);
        if result.is_ok() {
            self.last_written.store(offset, Ordering::SeqCst);
        }
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    /// Last offset that reached the file
    pub fn last_written_offset(&self) -> i64 {
        self.last_written.load(Ordering::SeqCst)
    }

    /// Stop the writer thread
    pub fn dispose(&self) {
        let _ = self.sender.send(WriterCommand::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn writer_thread(
        store: Arc<OffsetStore>,
        receiver: Receiver<WriterCommand>,
        in_flight: Arc<AtomicBool>,
        last_written: Arc<AtomicI64>,
    ) {
        while let Ok(command) = receiver.recv() {
            match command {
                WriterCommand::Write(offset) => {
                    match store.write(offset) {
                        Ok(()) => {
                            last_written.store(offset, Ordering::SeqCst);
                            debug!("Offset {} written", offset);
                        }
                        Err(e) => warn!("Failed to write offset {}: {}", offset, e),
                    }
                    in_flight.store(false, Ordering::SeqCst);
                }
                WriterCommand::Shutdown => break,
            }
        }
    }
}

impl Drop for OffsetFileWriter {
    fn drop(&mut self) {
        self.dispose();
    }
}
