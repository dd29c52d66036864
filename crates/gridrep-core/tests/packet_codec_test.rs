//! Packet codec integration tests
//!
//! Fragmentation through transport records and back through the acceptor:
//! - Round trip over boundary sizes and random payloads
//! - Large DATA message split across several packets
//! - Malformed packet streams

use bytes::Bytes;
use gridrep_core::replication::packet::{HEADER_PACKET_INDEX, parse_header};
use gridrep_core::replication::{
    BinaryDataReceiver, DataBatch, Message, MessageType, Packet, PacketAcceptor, PacketCodec,
};
use gridrep_core::{Error, Result};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Default)]
struct Collector {
    data: Mutex<Vec<Bytes>>,
    dictionaries: Mutex<Vec<String>>,
}

impl BinaryDataReceiver for Collector {
    fn receive_data(&self, batch: DataBatch) -> Result<()> {
        self.data.lock().push(batch.to_bytes());
        Ok(())
    }

    fn receive_type_dictionary(&self, type_dictionary: &str) -> Result<()> {
        self.dictionaries.lock().push(type_dictionary.to_string());
        Ok(())
    }
}

fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

/// Send every packet through a transport record and reassemble it
fn rejoin(packets: Vec<Packet>) -> Bytes {
    let mut packets = packets
        .into_iter()
        .map(|p| Packet::from_record(&p.into_record("storage")).unwrap());
    let mut message = Message::from_packet(packets.next().unwrap()).unwrap();
    for packet in packets {
        message.add_packet(packet).unwrap();
    }
    assert!(message.is_complete());
    message.buffer().unwrap()
}

#[test]
fn test_round_trip_boundary_sizes() {
    let max = 64;
    let codec = PacketCodec::new(max).unwrap();

    for len in [0, 1, max - 1, max, max + 1, 3 * max] {
        let data = payload(len);
        let packets = codec.fragment(MessageType::Data, &[data.clone()]).unwrap();
        assert_eq!(packets.len(), codec.packet_count(len), "length {}", len);
        assert!(packets.iter().all(|p| p.payload.len() <= max));
        assert_eq!(rejoin(packets), data, "length {}", len);
    }
}

#[test]
fn test_large_data_message_splits_into_three_packets() {
    let codec = PacketCodec::default();
    let data = payload(2_500_000);

    let packets = codec.fragment(MessageType::Data, &[data.clone()]).unwrap();
    assert_eq!(packets.len(), 3);

    let records: Vec<_> = packets
        .into_iter()
        .map(|p| p.into_record("storage"))
        .collect();
    for (i, record) in records.iter().enumerate() {
        let header = parse_header(record).unwrap();
        assert_eq!(header.message_type, MessageType::Data);
        assert_eq!(header.packet_index, i as u32);
        assert_eq!(header.packet_count, 3);
        assert_eq!(header.message_length, 2_500_000);
    }
    assert_eq!(records[2].value.len(), 500_000);

    let collector = Arc::new(Collector::default());
    let acceptor = PacketAcceptor::new(collector.clone());
    let packets: Vec<_> = records
        .iter()
        .map(|r| Packet::from_record(r).unwrap())
        .collect();
    acceptor.accept(packets).unwrap();

    let data_calls = collector.data.lock();
    assert_eq!(data_calls.len(), 1);
    assert_eq!(data_calls[0], data);
}

#[test]
fn test_message_split_across_poll_rounds() {
    let codec = PacketCodec::new(10).unwrap();
    let data = payload(35);
    let mut packets = codec.fragment(MessageType::Data, &[data.clone()]).unwrap();
    let tail = packets.split_off(2);

    let collector = Arc::new(Collector::default());
    let acceptor = PacketAcceptor::new(collector.clone());

    acceptor.accept(packets).unwrap();
    assert!(acceptor.has_pending());
    assert!(collector.data.lock().is_empty());

    acceptor.accept(tail).unwrap();
    assert!(!acceptor.has_pending());
    assert_eq!(collector.data.lock().as_slice(), &[data]);
}

#[test]
fn test_out_of_order_packet_rejected() {
    let codec = PacketCodec::new(10).unwrap();
    let mut packets = codec.fragment(MessageType::Data, &[payload(30)]).unwrap();
    packets.swap(1, 2);

    let collector = Arc::new(Collector::default());
    let acceptor = PacketAcceptor::new(collector.clone());

    let err = acceptor.accept(packets).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(err.is_fatal());
    assert!(!acceptor.has_pending());
    assert!(collector.data.lock().is_empty());
}

#[test]
fn test_corrupt_index_header_is_decode_error() {
    let codec = PacketCodec::default();
    let packet = codec
        .fragment(MessageType::Data, &[payload(4)])
        .unwrap()
        .remove(0);
    let mut record = packet.into_record("storage");
    record.add_header(HEADER_PACKET_INDEX, vec![1, 2]);

    let err = Packet::from_record(&record).unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
}

proptest! {
    #[test]
    fn prop_fragment_rejoin_round_trip(
        data in proptest::collection::vec(any::<u8>(), 0..4096),
        max in 1usize..512,
    ) {
        let codec = PacketCodec::new(max).unwrap();
        let data = Bytes::from(data);
        let packets = codec.fragment(MessageType::Data, &[data.clone()]).unwrap();

        prop_assert_eq!(packets.len(), codec.packet_count(data.len()));
        for (i, packet) in packets.iter().enumerate() {
            prop_assert_eq!(packet.packet_index, i as u32);
            prop_assert!(packet.payload.len() <= max);
        }
        prop_assert_eq!(rejoin(packets), data);
    }

    #[test]
    fn prop_chunked_payload_matches_contiguous(
        chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..200), 0..8),
        max in 1usize..256,
    ) {
        let codec = PacketCodec::new(max).unwrap();
        let contiguous: Vec<u8> = chunks.concat();
        let chunks: Vec<Bytes> = chunks.into_iter().map(Bytes::from).collect();

        let packets = codec.fragment(MessageType::Data, &chunks).unwrap();
        prop_assert_eq!(rejoin(packets), Bytes::from(contiguous));
    }
}
