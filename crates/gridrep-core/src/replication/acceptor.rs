//! Packet batch acceptor
//!
//! Consumes the packets of one consumption round, reassembles them into
//! messages and dispatches completed messages to a [`BinaryDataReceiver`].
//! Adjacent completed messages of the same type are coalesced into one
//! receiver call.

use super::message::Message;
use super::packet::{MessageType, Packet};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Binary entity data of one or more consecutive messages, as an ordered chunk list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataBatch {
    chunks: Vec<Bytes>,
}

impl DataBatch {
    /// Create a batch from ordered chunks
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        Self { chunks }
    }

    /// Ordered chunks
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Total number of bytes
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// No bytes at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contiguous copy of all chunks (no copy for a single chunk)
    pub fn to_bytes(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            chunks => {
                let mut buf = BytesMut::with_capacity(self.len());
                for chunk in chunks {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }
}

impl From<Bytes> for DataBatch {
    fn from(bytes: Bytes) -> Self {
        Self { chunks: vec![bytes] }
    }
}

/// Receiving end of reassembled replication messages
pub trait BinaryDataReceiver: Send + Sync {
    /// Apply binary entity data
    fn receive_data(&self, batch: DataBatch) -> Result<()>;

    /// Apply a full type dictionary document
    fn receive_type_dictionary(&self, type_dictionary: &str) -> Result<()>;
}

/// Completed messages, released on every exit path
struct Completed(Vec<Message>);

impl Drop for Completed {
    fn drop(&mut self) {
        for message in &mut self.0 {
            message.dispose();
        }
    }
}

/// Reassembles packet bursts and forwards complete messages
pub struct PacketAcceptor {
    receiver: Arc<dyn BinaryDataReceiver>,
    pending: Mutex<Option<Message>>,
}

impl PacketAcceptor {
    /// Create an acceptor dispatching to `receiver`
    pub fn new(receiver: Arc<dyn BinaryDataReceiver>) -> Self {
        Self {
            receiver,
            pending: Mutex::new(None),
        }
    }

    /// Is a message partially assembled
    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Storage offset of the first packet of the partially assembled message
    pub fn pending_first_offset(&self) -> Option<i64> {
        self.pending.lock().as_ref().and_then(Message::first_offset)
    }

    /// Accept one batch of packets in arrival order.
    ///
    /// A message may span batches. A protocol error discards the in-progress
    /// message and is returned; nothing of the failing batch is dispatched.
    pub fn accept(&self, packets: Vec<Packet>) -> Result<()> {
        let mut completed = Completed(Vec::new());

        {
            let mut pending = self.pending.lock();
            for packet in packets {
                let message = match pending.take() {
                    None => Message::from_packet(packet)?,
                    Some(mut message) => {
                        message.add_packet(packet)?;
                        message
                    }
                };

                if message.is_complete() {
                    completed.0.push(message);
                } else {
                    *pending = Some(message);
                }
            }
        }

        self.dispatch(&completed.0)
    }

    fn dispatch(&self, messages: &[Message]) -> Result<()> {
        for run in messages.chunk_by(|a, b| a.message_type() == b.message_type()) {
            match run[0].message_type() {
                MessageType::Data => {
                    let chunks = run.iter().map(Message::buffer).collect::<Result<Vec<_>>>()?;
                    debug!("Dispatching {} data message(s)", run.len());
                    self.receiver.receive_data(DataBatch::from_chunks(chunks))?;
                }
                MessageType::TypeDictionary => {
                    // Each dictionary is a full replacement; only the newest one matters
                    let last = &run[run.len() - 1];
                    let bytes = last.buffer()?;
                    let text = std::str::from_utf8(&bytes).map_err(|e| {
                        Error::decode(format!("Type dictionary is not valid UTF-8: {}", e))
                    })?;
                    debug!("Dispatching type dictionary ({} in run)", run.len());
                    self.receiver.receive_type_dictionary(text)?;
                }
            }
        }
        Ok(())
    }

    /// Discard any partially assembled message
    pub fn dispose(&self) {
        if let Some(mut message) = self.pending.lock().take() {
            debug!(
                "Discarding incomplete {} message ({}/{} packets)",
                message.message_type(),
                message.received_count(),
                message.packet_count()
            );
            message.dispose();
        }
    }
}
