//! Packet codec
//!
//! A replicated message (one committed write or one type dictionary) is split
//! into packets no larger than the transport's record limit. The packet
//! metadata travels out of band as record headers, never inside the payload:
//!
//! ```text
//! message-type    UTF-8 enum name (DATA | TYPE_DICTIONARY)
//! message-length  i32 big-endian, total message bytes
//! packet-index    i32 big-endian, 0-based
//! packet-count    i32 big-endian, > 0
//! storage-offset  UTF-8 decimal i64, stamped per packet by the distributor
//! ```

use crate::transport::TransportRecord;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;

/// Maximum payload bytes per packet accepted by the default transport
pub const MAX_PACKET_SIZE: usize = 1_000_000;

/// Header key of the message type
pub const HEADER_MESSAGE_TYPE: &str = "message-type";
/// Header key of the total message length
pub const HEADER_MESSAGE_LENGTH: &str = "message-length";
/// Header key of the packet index
pub const HEADER_PACKET_INDEX: &str = "packet-index";
/// Header key of the packet count
pub const HEADER_PACKET_COUNT: &str = "packet-count";
/// Header key of the storage offset
pub const HEADER_STORAGE_OFFSET: &str = "storage-offset";

const PACKET_HEADERS: [&str; 5] = [
    HEADER_MESSAGE_TYPE,
    HEADER_MESSAGE_LENGTH,
    HEADER_PACKET_INDEX,
    HEADER_PACKET_COUNT,
    HEADER_STORAGE_OFFSET,
];

/// Kind of replicated message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Full type dictionary document
    TypeDictionary,
    /// Raw binary entity data of one committed write
    Data,
}

impl MessageType {
    /// Wire name of the message type
    pub fn name(self) -> &'static str {
        match self {
            Self::TypeDictionary => "TYPE_DICTIONARY",
            Self::Data => "DATA",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TYPE_DICTIONARY" => Ok(Self::TypeDictionary),
            "DATA" => Ok(Self::Data),
            other => Err(Error::decode(format!("Unknown message type: {}", other))),
        }
    }
}

/// Packet metadata as carried in the transport headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type of the message this packet belongs to
    pub message_type: MessageType,
    /// Total length of the message in bytes
    pub message_length: u32,
    /// Position of this packet within the message
    pub packet_index: u32,
    /// Number of packets of the message
    pub packet_count: u32,
    /// Replication offset stamped by the distributor
    pub storage_offset: i64,
}

/// One size-bounded slice of a replicated message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Type of the message this packet belongs to
    pub message_type: MessageType,
    /// Total length of the message in bytes
    pub message_length: u32,
    /// Position of this packet within the message
    pub packet_index: u32,
    /// Number of packets of the message
    pub packet_count: u32,
    /// Replication offset; `i64::MIN` until the distributor stamps it
    pub storage_offset: i64,
    /// Packet payload
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet, checking the metadata invariants
    pub fn new(
        message_type: MessageType,
        message_length: u32,
        packet_index: u32,
        packet_count: u32,
        storage_offset: i64,
        payload: Bytes,
    ) -> Result<Self> {
        if packet_count == 0 {
            return Err(Error::protocol("Packet count must be positive"));
        }
        if packet_index >= packet_count {
            return Err(Error::protocol(format!(
                "Packet index {} out of range for packet count {}",
                packet_index, packet_count
            )));
        }
        if payload.len() > message_length as usize {
            return Err(Error::protocol(format!(
                "Packet payload of {} bytes exceeds message length {}",
                payload.len(),
                message_length
            )));
        }

        Ok(Self {
            message_type,
            message_length,
            packet_index,
            packet_count,
            storage_offset,
            payload,
        })
    }

    /// Rebuild a packet from a transport record
    pub fn from_record(record: &TransportRecord) -> Result<Self> {
        let header = parse_header(record)?;
        Self::new(
            header.message_type,
            header.message_length,
            header.packet_index,
            header.packet_count,
            header.storage_offset,
            record.value.clone(),
        )
    }

    /// Metadata of this packet
    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            message_type: self.message_type,
            message_length: self.message_length,
            packet_index: self.packet_index,
            packet_count: self.packet_count,
            storage_offset: self.storage_offset,
        }
    }

    /// Is this the terminal packet of its message
    pub fn is_last(&self) -> bool {
        self.packet_index + 1 == self.packet_count
    }

    /// Convert into a transport record published under `key`
    pub fn into_record(self, key: &str) -> TransportRecord {
        let mut record = TransportRecord::new(self.payload).with_key(key);
        record.add_header(HEADER_MESSAGE_TYPE, self.message_type.name().as_bytes());
        record.add_header(HEADER_MESSAGE_LENGTH, encode_int(self.message_length));
        record.add_header(HEADER_PACKET_INDEX, encode_int(self.packet_index));
        record.add_header(HEADER_PACKET_COUNT, encode_int(self.packet_count));
        record.add_header(
            HEADER_STORAGE_OFFSET,
            self.storage_offset.to_string().into_bytes(),
        );
        record
    }
}

/// Splits payloads into packets of a bounded size
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl PacketCodec {
    /// Create a codec with the given packet size limit
    pub fn new(max_packet_size: usize) -> Result<Self> {
        if max_packet_size == 0 || max_packet_size > i32::MAX as usize {
            return Err(Error::config(format!(
                "max_packet_size must be in 1..={}, got {}",
                i32::MAX,
                max_packet_size
            )));
        }
        Ok(Self { max_packet_size })
    }

    /// Packet size limit in bytes
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Number of packets a message of `length` bytes is split into
    pub fn packet_count(&self, length: usize) -> usize {
        if length == 0 {
            1
        } else {
            length.div_ceil(self.max_packet_size)
        }
    }

    /// Slice the logical concatenation of `chunks` into packets.
    ///
    /// Packets are numbered `0..N-1` and carry the unstamped offset
    /// `i64::MIN`. An empty payload yields a single empty packet.
    pub fn fragment(&self, message_type: MessageType, chunks: &[Bytes]) -> Result<Vec<Packet>> {
        let total: usize = chunks.iter().map(Bytes::len).sum();
        if total > i32::MAX as usize {
            return Err(Error::protocol(format!(
                "Message of {} bytes exceeds the maximum message length {}",
                total,
                i32::MAX
            )));
        }

        let message_length = total as u32;
        let packet_count = self.packet_count(total) as u32;
        let mut packets = Vec::with_capacity(packet_count as usize);
        let mut cursor = ChunkCursor::new(chunks);

        for packet_index in 0..packet_count {
            let size = (total - cursor.consumed).min(self.max_packet_size);
            packets.push(Packet {
                message_type,
                message_length,
                packet_index,
                packet_count,
                storage_offset: i64::MIN,
                payload: cursor.take(size),
            });
        }

        Ok(packets)
    }
}

/// Reads consecutive byte ranges across a list of chunks
struct ChunkCursor<'a> {
    chunks: &'a [Bytes],
    chunk: usize,
    position: usize,
    consumed: usize,
}

impl<'a> ChunkCursor<'a> {
    fn new(chunks: &'a [Bytes]) -> Self {
        Self {
            chunks,
            chunk: 0,
            position: 0,
            consumed: 0,
        }
    }

    fn skip_exhausted(&mut self) {
        while self.chunk < self.chunks.len() && self.position >= self.chunks[self.chunk].len() {
            self.chunk += 1;
            self.position = 0;
        }
    }

    /// Take `size` bytes; zero-copy when they lie within one chunk
    fn take(&mut self, size: usize) -> Bytes {
        self.skip_exhausted();
        if size == 0 {
            return Bytes::new();
        }

        let current = &self.chunks[self.chunk];
        if current.len() - self.position >= size {
            let slice = current.slice(self.position..self.position + size);
            self.position += size;
            self.consumed += size;
            return slice;
        }

        let mut buf = BytesMut::with_capacity(size);
        while buf.len() < size {
            self.skip_exhausted();
            let current = &self.chunks[self.chunk];
            let n = (size - buf.len()).min(current.len() - self.position);
            buf.extend_from_slice(&current[self.position..self.position + n]);
            self.position += n;
        }
        self.consumed += size;
        buf.freeze()
    }
}

/// Does the record carry any replication metadata at all
pub fn is_replication_record(record: &TransportRecord) -> bool {
    PACKET_HEADERS
        .iter()
        .any(|key| record.last_header(key).is_some())
}

/// Extract the packet metadata of a transport record
pub fn parse_header(record: &TransportRecord) -> Result<PacketHeader> {
    let message_type = std::str::from_utf8(required(record, HEADER_MESSAGE_TYPE)?)
        .map_err(|e| Error::decode(format!("Invalid {}: {}", HEADER_MESSAGE_TYPE, e)))?
        .parse()?;

    Ok(PacketHeader {
        message_type,
        message_length: decode_int(HEADER_MESSAGE_LENGTH, required(record, HEADER_MESSAGE_LENGTH)?)?,
        packet_index: decode_int(HEADER_PACKET_INDEX, required(record, HEADER_PACKET_INDEX)?)?,
        packet_count: decode_int(HEADER_PACKET_COUNT, required(record, HEADER_PACKET_COUNT)?)?,
        storage_offset: parse_storage_offset(record)?,
    })
}

/// Extract only the storage offset of a transport record
pub fn parse_storage_offset(record: &TransportRecord) -> Result<i64> {
    let raw = required(record, HEADER_STORAGE_OFFSET)?;
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            Error::decode(format!(
                "Invalid {}: {:?}",
                HEADER_STORAGE_OFFSET,
                String::from_utf8_lossy(raw)
            ))
        })
}

fn required<'a>(record: &'a TransportRecord, key: &str) -> Result<&'a [u8]> {
    record
        .last_header(key)
        .ok_or_else(|| Error::decode(format!("Missing header {}", key)))
}

fn encode_int(value: u32) -> Vec<u8> {
    (value as i32).to_be_bytes().to_vec()
}

fn decode_int(key: &str, bytes: &[u8]) -> Result<u32> {
    let raw: [u8; 4] = bytes.try_into().map_err(|_| {
        Error::decode(format!("{} must be 4 bytes, got {}", key, bytes.len()))
    })?;
    let value = i32::from_be_bytes(raw);
    u32::try_from(value).map_err(|_| Error::decode(format!("{} is negative: {}", key, value)))
}
