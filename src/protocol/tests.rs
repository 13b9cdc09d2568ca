use super::*;
use crate::identity::{MessageId, PeerId};

fn peer(name: &str) -> PeerId {
    PeerId::new(name).unwrap()
}

fn chat(sender: &str, recipient: Option<&str>, text: &[u8]) -> MeshRelayMessage {
    MeshRelayMessage::originate(
        MessageBody::Chat(MessageContent::Plain(text.to_vec())),
        peer(sender),
        recipient.map(peer),
        MessagePriority::Normal,
        5,
        1_000,
    )
}

#[test]
fn test_priority_ordering() {
    assert!(MessagePriority::Urgent > MessagePriority::High);
    assert!(MessagePriority::High > MessagePriority::Normal);
    assert!(MessagePriority::Normal > MessagePriority::Low);
    assert_eq!(MessagePriority::default(), MessagePriority::Normal);
}

#[test]
fn test_priority_byte_conversion() {
    for p in MessagePriority::ALL {
        assert_eq!(MessagePriority::from_byte(p.to_byte()), Some(p));
    }
    assert_eq!(MessagePriority::from_byte(9), None);
}

#[test]
fn test_kind_byte_conversion() {
    assert_eq!(MessageKind::from_byte(0x01), Some(MessageKind::Chat));
    assert_eq!(MessageKind::from_byte(0x02), Some(MessageKind::Ack));
    assert_eq!(MessageKind::from_byte(0x03), Some(MessageKind::TopologyAnnounce));
    assert_eq!(MessageKind::from_byte(0x00), None);
}

#[test]
fn test_chat_encode_decode() {
    let msg = chat("alice", Some("carol"), b"hello mesh");
    let decoded = MeshRelayMessage::decode(&msg.encode()).unwrap();
    assert_eq!(decoded, msg);
    assert_eq!(decoded.kind(), MessageKind::Chat);
    assert!(!decoded.is_broadcast());
}

#[test]
fn test_broadcast_has_no_recipient() {
    let msg = chat("alice", None, b"all");
    let decoded = MeshRelayMessage::decode(&msg.encode()).unwrap();
    assert!(decoded.is_broadcast());
    assert_eq!(decoded.metadata.final_recipient, None);
}

#[test]
fn test_ack_and_announce_decode() {
    let acked = MessageId::generate();
    let ack = MeshRelayMessage::originate(
        MessageBody::Ack { acked },
        peer("carol"),
        Some(peer("alice")),
        MessagePriority::High,
        5,
        2_000,
    );
    let decoded = MeshRelayMessage::decode(&ack.encode()).unwrap();
    assert_eq!(decoded.body, MessageBody::Ack { acked });

    let announce = MeshRelayMessage::originate(
        MessageBody::TopologyAnnounce {
            neighbors: vec![
                TopologyNeighbor { peer: peer("b"), quality: 1.0 },
                TopologyNeighbor { peer: peer("c"), quality: 0.0 },
            ],
        },
        peer("a"),
        None,
        MessagePriority::Low,
        2,
        3_000,
    );
    let decoded = MeshRelayMessage::decode(&announce.encode()).unwrap();
    match decoded.body {
        MessageBody::TopologyAnnounce { neighbors } => {
            assert_eq!(neighbors.len(), 2);
            assert_eq!(neighbors[0].quality, 1.0);
            assert_eq!(neighbors[1].quality, 0.0);
        }
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn test_relayed_by_increments_hop_and_path() {
    let msg = chat("alice", Some("carol"), b"x");
    let next = msg.relayed_by(&peer("bob"), 5_000);

    assert_eq!(next.metadata.hop_count, msg.metadata.hop_count + 1);
    assert_eq!(next.metadata.routing_path, vec![peer("bob")]);
    assert_eq!(next.relayed_at_ms, 5_000);
    // original snapshot untouched
    assert_eq!(msg.metadata.hop_count, 0);
    assert!(msg.metadata.routing_path.is_empty());
    assert!(next.metadata.has_visited(&peer("bob")));
}

#[test]
fn test_hash_stable_across_hops() {
    let msg = chat("alice", Some("carol"), b"same content");
    let relayed = msg.relayed_by(&peer("bob"), 9_000);
    assert_eq!(msg.metadata.message_hash, relayed.metadata.message_hash);

    let decoded = MeshRelayMessage::decode(&relayed.encode()).unwrap();
    assert_eq!(decoded.metadata.message_hash, msg.metadata.message_hash);
}

#[test]
fn test_can_relay_stops_at_ttl() {
    let mut msg = chat("alice", None, b"x");
    msg.metadata.ttl = 2;
    assert!(msg.metadata.can_relay());
    let one = msg.relayed_by(&peer("b"), 0);
    assert!(one.metadata.can_relay());
    let two = one.relayed_by(&peer("c"), 0);
    assert_eq!(two.metadata.hop_count, 2);
    assert!(!two.metadata.can_relay());
}

#[test]
fn test_decode_rejects_tampered_body() {
    let msg = chat("alice", Some("carol"), b"original");
    let mut bytes = msg.encode();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    assert!(matches!(
        MeshRelayMessage::decode(&bytes),
        Err(ProtocolError::HashMismatch)
    ));
}

#[test]
fn test_decode_rejects_short_input() {
    assert!(matches!(
        MeshRelayMessage::decode(&[PROTOCOL_VERSION, 0x01]),
        Err(ProtocolError::MessageTooShort { .. })
    ));

    let bytes = chat("alice", None, b"payload").encode();
    assert!(matches!(
        MeshRelayMessage::decode(&bytes[..bytes.len() - 3]),
        Err(ProtocolError::MessageTooShort { .. })
    ));
}

#[test]
fn test_decode_rejects_bad_header_fields() {
    let mut bytes = chat("alice", None, b"x").encode();
    bytes[0] = 99;
    assert!(matches!(
        MeshRelayMessage::decode(&bytes),
        Err(ProtocolError::UnsupportedVersion(99))
    ));

    let mut bytes = chat("alice", None, b"x").encode();
    bytes[1] = 0x7f;
    assert!(matches!(
        MeshRelayMessage::decode(&bytes),
        Err(ProtocolError::InvalidMessageKind(0x7f))
    ));

    let mut bytes = chat("alice", None, b"x").encode();
    bytes[2] = 0x10;
    assert!(matches!(
        MeshRelayMessage::decode(&bytes),
        Err(ProtocolError::InvalidPriority(0x10))
    ));
}

#[test]
fn test_decode_rejects_hop_count_over_ttl() {
    let mut bytes = chat("alice", None, b"x").encode();
    // ttl at offset 3, hop_count at offset 4
    bytes[3] = 1;
    bytes[4] = 2;
    assert!(matches!(
        MeshRelayMessage::decode(&bytes),
        Err(ProtocolError::HopCountExceedsTtl { hop_count: 2, ttl: 1 })
    ));
}

#[test]
fn test_decode_rejects_trailing_bytes() {
    let mut bytes = chat("alice", None, b"x").encode();
    bytes.push(0);
    assert!(matches!(
        MeshRelayMessage::decode(&bytes),
        Err(ProtocolError::Malformed(_))
    ));
}

#[test]
fn test_encrypted_content_flag_survives() {
    let msg = MeshRelayMessage::originate(
        MessageBody::Chat(MessageContent::Encrypted(vec![1, 2, 3])),
        peer("alice"),
        Some(peer("carol")),
        MessagePriority::Urgent,
        3,
        0,
    );
    let decoded = MeshRelayMessage::decode(&msg.encode()).unwrap();
    match decoded.body {
        MessageBody::Chat(content) => {
            assert!(content.is_encrypted());
            assert_eq!(content.bytes(), &[1, 2, 3]);
        }
        other => panic!("unexpected body {:?}", other),
    }
}
