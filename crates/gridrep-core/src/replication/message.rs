//! Message reassembly
//!
//! A [`Message`] accumulates the packets of one logical payload, strictly in
//! index order, into a buffer sized to the declared message length.

use super::packet::{MessageType, Packet};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};

/// Lifecycle state of a [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// No packet received yet
    Empty,
    /// Some but not all packets received
    Accumulating,
    /// All packets received; the buffer is readable
    Complete,
    /// Buffer released
    Disposed,
}

#[derive(Debug)]
enum Buffer {
    Filling(BytesMut),
    Complete(Bytes),
    Released,
}

/// One logical payload being reassembled from packets
#[derive(Debug)]
pub struct Message {
    message_type: MessageType,
    length: u32,
    packet_count: u32,
    received_count: u32,
    first_offset: Option<i64>,
    buffer: Buffer,
}

impl Message {
    /// Create an empty message with the declared metadata
    pub fn new(message_type: MessageType, length: u32, packet_count: u32) -> Result<Self> {
        if packet_count == 0 {
            return Err(Error::protocol("Message packet count must be positive"));
        }

        Ok(Self {
            message_type,
            length,
            packet_count,
            received_count: 0,
            first_offset: None,
            buffer: Buffer::Filling(BytesMut::new()),
        })
    }

    /// Start a message from its first packet
    pub fn from_packet(packet: Packet) -> Result<Self> {
        let mut message = Self::new(packet.message_type, packet.message_length, packet.packet_count)?;
        message.add_packet(packet)?;
        Ok(message)
    }

    /// Message type
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Declared total length in bytes
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Declared number of packets
    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    /// Number of packets accepted so far
    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    /// Storage offset of the first accepted packet
    pub fn first_offset(&self) -> Option<i64> {
        self.first_offset
    }

    /// Current lifecycle state
    pub fn state(&self) -> MessageState {
        match &self.buffer {
            Buffer::Released => MessageState::Disposed,
            Buffer::Complete(_) => MessageState::Complete,
            Buffer::Filling(_) if self.received_count == 0 => MessageState::Empty,
            Buffer::Filling(_) => MessageState::Accumulating,
        }
    }

    /// All packets received and buffer not yet released
    pub fn is_complete(&self) -> bool {
        matches!(self.buffer, Buffer::Complete(_))
    }

    /// Append the next packet.
    ///
    /// The packet must be of the message's type and metadata and carry the
    /// next expected index. Any violation is a protocol error.
    pub fn add_packet(&mut self, packet: Packet) -> Result<()> {
        let buf = match &mut self.buffer {
            Buffer::Filling(buf) => buf,
            Buffer::Complete(_) => {
                return Err(Error::invalid_state(
                    "Message is already complete; start a new message",
                ));
            }
            Buffer::Released => return Err(Error::disposed("Message buffer was released")),
        };

        if packet.message_type != self.message_type {
            return Err(Error::protocol(format!(
                "Packet of type {} received while assembling a {} message",
                packet.message_type, self.message_type
            )));
        }
        if packet.packet_index != self.received_count {
            return Err(Error::protocol(format!(
                "Expected packet index {} but received {}",
                self.received_count, packet.packet_index
            )));
        }
        if packet.message_length != self.length || packet.packet_count != self.packet_count {
            return Err(Error::protocol(format!(
                "Packet metadata {}/{} does not match message {}/{}",
                packet.message_length, packet.packet_count, self.length, self.packet_count
            )));
        }
        if buf.len() + packet.payload.len() > self.length as usize {
            return Err(Error::protocol(format!(
                "Packet {} overflows message length {}",
                packet.packet_index, self.length
            )));
        }

        if self.received_count == 0 {
            self.first_offset = Some(packet.storage_offset);
        }

        let last = packet.is_last();
        if last && self.received_count == 0 {
            // Single-packet message: keep the payload without copying
            if packet.payload.len() != self.length as usize {
                return Err(Error::protocol(format!(
                    "Message length {} but received {} bytes",
                    self.length,
                    packet.payload.len()
                )));
            }
            self.received_count = 1;
            self.buffer = Buffer::Complete(packet.payload);
            return Ok(());
        }

        if buf.capacity() == 0 {
            buf.reserve(self.length as usize);
        }
        buf.extend_from_slice(&packet.payload);
        self.received_count += 1;

        if last {
            if buf.len() != self.length as usize {
                return Err(Error::protocol(format!(
                    "Message length {} but received {} bytes",
                    self.length,
                    buf.len()
                )));
            }
            let complete = std::mem::take(buf).freeze();
            self.buffer = Buffer::Complete(complete);
        }

        Ok(())
    }

    /// Reassembled payload; only readable once complete
    pub fn buffer(&self) -> Result<Bytes> {
        match &self.buffer {
            Buffer::Complete(bytes) => Ok(bytes.clone()),
            Buffer::Filling(_) => Err(Error::invalid_state(format!(
                "Message incomplete: {}/{} packets",
                self.received_count, self.packet_count
            ))),
            Buffer::Released => Err(Error::disposed("Message buffer was released")),
        }
    }

    /// Release the buffer
    pub fn dispose(&mut self) {
        self.buffer = Buffer::Released;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::packet::PacketCodec;

    fn packets(len: usize, max: usize) -> (Bytes, Vec<Packet>) {
        let data: Bytes = (0..len).map(|i| (i * 7) as u8).collect::<Vec<u8>>().into();
        let packets = PacketCodec::new(max)
            .unwrap()
            .fragment(MessageType::Data, std::slice::from_ref(&data))
            .unwrap();
        (data, packets)
    }

    #[test]
    fn test_reassemble_in_order() {
        let (data, packets) = packets(50, 16);
        let mut iter = packets.into_iter();
        let mut message = Message::from_packet(iter.next().unwrap()).unwrap();
        assert_eq!(message.state(), MessageState::Accumulating);
        assert!(message.buffer().is_err());

        for packet in iter {
            message.add_packet(packet).unwrap();
        }

        assert_eq!(message.state(), MessageState::Complete);
        assert_eq!(message.received_count(), 4);
        assert_eq!(message.buffer().unwrap(), data);
    }

    #[test]
    fn test_rejects_wrong_index() {
        let (_, packets) = packets(50, 16);
        let mut message = Message::from_packet(packets[0].clone()).unwrap();

        let err = message.add_packet(packets[2].clone()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.is_fatal());

        let err = Message::from_packet(packets[1].clone()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_rejects_wrong_type() {
        let (_, packets) = packets(50, 16);
        let mut message = Message::from_packet(packets[0].clone()).unwrap();

        let mut foreign = packets[1].clone();
        foreign.message_type = MessageType::TypeDictionary;
        assert!(matches!(message.add_packet(foreign), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_complete_rejects_more_packets() {
        let (_, packets) = packets(10, 16);
        let mut message = Message::from_packet(packets[0].clone()).unwrap();
        assert!(message.is_complete());
        assert!(matches!(
            message.add_packet(packets[0].clone()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_dispose_releases_buffer() {
        let (_, packets) = packets(0, 16);
        let mut message = Message::from_packet(packets[0].clone()).unwrap();
        assert_eq!(message.buffer().unwrap().len(), 0);

        message.dispose();
        assert_eq!(message.state(), MessageState::Disposed);
        assert!(matches!(message.buffer(), Err(Error::Disposed(_))));
    }

    #[test]
    fn test_length_mismatch_is_protocol_error() {
        let packet = Packet::new(MessageType::Data, 8, 0, 1, 1, Bytes::from_static(b"abc")).unwrap();
        assert!(matches!(Message::from_packet(packet), Err(Error::Protocol(_))));
    }
}
