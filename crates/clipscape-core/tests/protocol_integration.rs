//! Integration tests for the clipscape-core wire codecs.
//!
//! These tests drive the public API the way the network crate does: split an
//! outbound message, decode each wire string at the receiving boundary, and
//! feed chunk envelopes to a reassembler.

use clipscape_core::protocol::channel::{split_message_with, CHUNK_PREFIX};
use clipscape_core::protocol::discovery::{encode_announcement, Admission};
use clipscape_core::protocol::signaling::{encode_frame, FrameDecoder};
use clipscape_core::{
    split_message, ChannelMessage, ChunkReassembler, DiscoveryCollector, PeerId,
    SignalingMessage, CHUNK_SIZE,
};

/// Decodes every wire string and returns the messages the application would see.
fn deliver(wire: &[String]) -> Vec<String> {
    let mut reassembler = ChunkReassembler::new();
    let mut delivered = Vec::new();
    for text in wire {
        match ChannelMessage::decode(text).expect("wire string must decode") {
            ChannelMessage::Plain(msg) => delivered.push(msg),
            ChannelMessage::Chunk(env) => {
                if let Some(msg) = reassembler.accept(env).expect("envelope must be valid") {
                    delivered.push(msg);
                }
            }
            other => panic!("unexpected control message {other:?}"),
        }
    }
    assert_eq!(reassembler.pending(), 0, "no chunk set may be left behind");
    delivered
}

#[test]
fn test_sizes_around_threshold_reassemble_identically() {
    for size in [CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 5 * CHUNK_SIZE] {
        // Arrange
        let original: String = (0..size).map(|i| (b'a' + (i % 26) as u8) as char).collect();

        // Act
        let wire = split_message(&original);
        let delivered = deliver(&wire);

        // Assert
        assert_eq!(delivered.len(), 1, "size {size} must deliver one message");
        assert_eq!(delivered[0].as_bytes(), original.as_bytes(), "size {size}");
        if size <= CHUNK_SIZE {
            assert_eq!(wire.len(), 1);
            assert!(!wire[0].starts_with(CHUNK_PREFIX), "size {size} goes verbatim");
        } else {
            assert!(wire.len() > 1, "size {size} must be chunked");
        }
    }
}

#[test]
fn test_multibyte_payload_reassembles_identically() {
    // Arrange: 3-byte and 4-byte characters straddle every chunk boundary.
    let original = "日本語🙂".repeat(CHUNK_SIZE / 4);

    // Act
    let delivered = deliver(&split_message(&original));

    // Assert
    assert_eq!(delivered, vec![original]);
}

#[test]
fn test_chunks_delivered_in_reverse_order_still_reassemble() {
    // Arrange
    let original = "xyz".repeat(100);
    let mut wire = split_message_with(&original, "rev00001", 64);
    wire.reverse();

    // Act
    let delivered = deliver(&wire);

    // Assert
    assert_eq!(delivered, vec![original]);
}

#[test]
fn test_interleaved_chunk_sets_do_not_mix() {
    // Arrange
    let first = "1".repeat(50);
    let second = "2".repeat(50);
    let a = split_message_with(&first, "set-aaaa", 16);
    let b = split_message_with(&second, "set-bbbb", 16);
    let interleaved: Vec<String> = a
        .iter()
        .zip(b.iter())
        .flat_map(|(x, y)| [x.clone(), y.clone()])
        .collect();

    // Act
    let mut delivered = deliver(&interleaved);
    delivered.sort();

    // Assert
    assert_eq!(delivered, vec![first, second]);
}

#[test]
fn test_discovery_pass_filters_self_and_duplicates() {
    // Arrange
    let local = "192.168.1.10".parse().unwrap();
    let mut collector = DiscoveryCollector::new(local);
    let replies = [
        ("192.168.1.10", "me", 9999),
        ("192.168.1.20", "desk", 9999),
        ("192.168.1.20", "desk-again", 9999),
        ("192.168.1.30", "laptop", 9998),
    ];

    // Act
    let admissions: Vec<Admission> = replies
        .iter()
        .map(|(ip, name, port)| collector.offer(ip.parse().unwrap(), &encode_announcement(name, *port)))
        .collect();
    let records = collector.finish();

    // Assert
    assert_eq!(admissions[0], Admission::OwnAddress);
    assert_eq!(admissions[2], Admission::Duplicate);
    let ids: Vec<PeerId> = records.iter().map(|r| r.peer_id()).collect();
    assert_eq!(
        ids,
        vec![
            "192.168.1.20:9999".parse::<PeerId>().unwrap(),
            "192.168.1.30:9998".parse::<PeerId>().unwrap(),
        ]
    );
}

#[test]
fn test_signaling_offer_and_answer_through_stream_decoder() {
    // Arrange
    let offer = SignalingMessage::offer("v=0\r\nm=application\r\n", "desk", 9999);
    let answer = SignalingMessage::answer("v=0\r\n", "laptop", 9998);

    // Act: each side decodes the other's frame as it arrives in two reads.
    let mut results = Vec::new();
    for msg in [&offer, &answer] {
        let frame = encode_frame(msg).unwrap();
        let mut decoder = FrameDecoder::new();
        let (head, tail) = frame.split_at(frame.len() / 2);
        assert!(decoder.push(head).unwrap().is_none());
        results.push(decoder.push(tail).unwrap().unwrap());
    }

    // Assert
    assert_eq!(results[0].clone().into_offer().unwrap().signaling_port, 9999);
    assert_eq!(results[1].clone().into_answer().unwrap().device_name, "laptop");
}
