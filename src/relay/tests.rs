use super::*;
use crate::config::{
    DispatchConfig, NoiseConfig, QueueConfig, RelayConfig, RelayProbabilityConfig, RoutingConfig,
    SpamConfig,
};
use crate::dispatch::AdaptiveCipherDispatcher;
use crate::identity::{IdentityResolver, LocalIdentity, PeerId};
use crate::noise::NoiseSessionManager;
use crate::protocol::{MeshRelayMessage, MessageBody, MessageContent, MessageKind, MessagePriority};
use crate::queue::{InMemoryQueueRepository, OfflineMessageQueue, QueuePartition, QueuedMessageStatus};
use crate::routing::RoutingService;
use std::sync::Arc;
use std::time::Duration;

struct TestNode {
    id: PeerId,
    engine: MeshRelayEngine,
    rx: RelayReceivers,
}

impl TestNode {
    fn frames(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn deliveries(&mut self) -> Vec<LocalDelivery> {
        let mut out = Vec::new();
        while let Ok(d) = self.rx.delivery.try_recv() {
            out.push(d);
        }
        out
    }
}

fn p(name: &str) -> PeerId {
    PeerId::new(name).unwrap()
}

fn relay_config() -> RelayConfig {
    RelayConfig {
        default_ttl: 3,
        probability: RelayProbabilityConfig::always(),
        ..Default::default()
    }
}

fn node_with(config: RelayConfig) -> TestNode {
    let identity = Arc::new(LocalIdentity::generate());
    let id = identity.local_id();
    let dispatcher = Arc::new(AdaptiveCipherDispatcher::from_config(DispatchConfig::default()));
    let sessions = Arc::new(NoiseSessionManager::new(
        identity.keypair().clone(),
        NoiseConfig::default(),
        dispatcher,
    ));
    let routing = Arc::new(RoutingService::new(id.clone(), RoutingConfig::default()));
    let queue = Arc::new(OfflineMessageQueue::new(
        QueueConfig::default(),
        Arc::new(InMemoryQueueRepository::new()),
    ));
    let (channels, rx) = relay_channels(64);
    let engine = MeshRelayEngine::new(config, identity, sessions, routing, queue, channels);
    TestNode { id, engine, rx }
}

fn node() -> TestNode {
    node_with(relay_config())
}

fn chat_from(sender: &PeerId, to: Option<&PeerId>, ttl: u8, text: &[u8]) -> MeshRelayMessage {
    MeshRelayMessage::originate(
        MessageBody::Chat(MessageContent::Plain(text.to_vec())),
        sender.clone(),
        to.cloned(),
        MessagePriority::Normal,
        ttl,
        0,
    )
}

async fn establish(a: &TestNode, b: &TestNode) {
    let msg1 = a.engine.sessions().initiate_handshake(&b.id).await.unwrap();
    let msg2 = b
        .engine
        .sessions()
        .process_handshake_message(&a.id, &msg1)
        .await
        .unwrap()
        .unwrap();
    let msg3 = a
        .engine
        .sessions()
        .process_handshake_message(&b.id, &msg2)
        .await
        .unwrap()
        .unwrap();
    assert!(
        b.engine
            .sessions()
            .process_handshake_message(&a.id, &msg3)
            .await
            .unwrap()
            .is_none()
    );
}

// ===== Pipeline =====

#[tokio::test]
async fn test_malformed_envelope_dropped_and_counted() {
    let a = node();
    let outcome = a.engine.process_incoming(b"garbage", &p("x"), 0).await;
    assert_eq!(outcome, RelayOutcome::Dropped(DropReason::Malformed));

    let stats = a.engine.statistics(0);
    assert_eq!(stats.total_processed, 1);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.total_dropped, 1);
}

#[tokio::test]
async fn test_duplicate_suppressed_exactly_once() {
    let mut a = node();
    let msg = chat_from(&p("x"), None, 3, b"hello");
    let bytes = msg.encode();

    let first = a.engine.process_incoming(&bytes, &p("x"), 0).await;
    assert!(first.was_delivered());
    let second = a.engine.process_incoming(&bytes, &p("y"), 10).await;
    assert_eq!(second, RelayOutcome::Dropped(DropReason::Duplicate));

    // a copy relayed by someone else carries the same hash
    let relayed = msg.relayed_by(&p("y"), 20).encode();
    let third = a.engine.process_incoming(&relayed, &p("y"), 20).await;
    assert_eq!(third, RelayOutcome::Dropped(DropReason::Duplicate));

    assert_eq!(a.deliveries().len(), 1);
}

#[tokio::test]
async fn test_local_delivery_sends_ack() {
    let mut a = node();
    let x = p("x");
    a.engine.peer_connected(&x, 1.0, 0);

    let msg = chat_from(&x, Some(&a.id), 3, b"for a");
    let outcome = a.engine.process_incoming(&msg.encode(), &x, 0).await;
    assert_eq!(
        outcome,
        RelayOutcome::Processed {
            delivered: true,
            forward: ForwardOutcome::NotForwarded,
        }
    );

    let deliveries = a.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].plaintext, b"for a");
    assert_eq!(deliveries[0].sender, x);
    assert_eq!(deliveries[0].message_id, msg.original_message_id);
    assert!(!deliveries[0].was_encrypted);

    let frames = a.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind, MessageKind::Ack);
    assert_eq!(frames[0].next_hop, x);
    let ack = MeshRelayMessage::decode(&frames[0].bytes).unwrap();
    assert_eq!(
        ack.body,
        MessageBody::Ack {
            acked: msg.original_message_id
        }
    );
    // acks are not awaited, so nothing stays queued
    assert!(a.engine.queue().is_empty().unwrap());
}

#[tokio::test]
async fn test_retransmission_is_acked_again_not_redelivered() {
    let mut c = node();
    let x = p("x");
    c.engine.peer_connected(&x, 1.0, 0);

    let msg = chat_from(&x, Some(&c.id), 3, b"did you get this");
    let bytes = msg.encode();
    assert!(c.engine.process_incoming(&bytes, &x, 0).await.was_delivered());
    assert_eq!(c.deliveries().len(), 1);
    assert_eq!(c.frames().len(), 1);

    // the first ack was lost and the sender retries the same envelope
    let retry = c.engine.process_incoming(&bytes, &x, 40_000).await;
    assert_eq!(retry, RelayOutcome::Dropped(DropReason::Duplicate));
    assert!(c.deliveries().is_empty());

    let frames = c.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind, MessageKind::Ack);
    assert_eq!(frames[0].next_hop, x);
    let ack = MeshRelayMessage::decode(&frames[0].bytes).unwrap();
    assert_eq!(
        ack.body,
        MessageBody::Ack {
            acked: msg.original_message_id
        }
    );
    assert_eq!(c.engine.statistics(40_000).acks_resent, 1);
}

#[tokio::test]
async fn test_duplicates_not_for_us_are_not_acked() {
    let mut a = node();
    let x = p("x");
    a.engine.peer_connected(&x, 1.0, 0);

    let broadcast = chat_from(&x, None, 1, b"all").encode();
    a.engine.process_incoming(&broadcast, &x, 0).await;
    let relayed = chat_from(&x, Some(&p("far")), 1, b"not ours").encode();
    a.engine.process_incoming(&relayed, &x, 0).await;
    a.frames();

    a.engine.process_incoming(&broadcast, &x, 10).await;
    a.engine.process_incoming(&relayed, &x, 10).await;
    assert!(a.frames().is_empty());
    assert_eq!(a.engine.statistics(10).acks_resent, 0);
}

#[tokio::test]
async fn test_auto_ack_disabled() {
    let mut a = node_with(RelayConfig {
        auto_ack: false,
        ..relay_config()
    });
    let x = p("x");
    a.engine.peer_connected(&x, 1.0, 0);
    let msg = chat_from(&x, Some(&a.id), 3, b"quiet");
    a.engine.process_incoming(&msg.encode(), &x, 0).await;
    assert_eq!(a.deliveries().len(), 1);
    assert!(a.frames().is_empty());
}

#[tokio::test]
async fn test_relay_increments_hop_and_extends_path() {
    let mut a = node();
    let (n1, n2) = (p("n1"), p("n2"));
    a.engine.peer_connected(&n1, 1.0, 0);
    a.engine.peer_connected(&n2, 1.0, 0);

    let msg = chat_from(&p("s"), Some(&n2), 5, b"through a");
    let outcome = a.engine.process_incoming(&msg.encode(), &n1, 0).await;
    assert_eq!(outcome.relayed_to(), std::slice::from_ref(&n2));
    assert!(!outcome.was_delivered());

    let frames = a.frames();
    assert_eq!(frames.len(), 1);
    let relayed = MeshRelayMessage::decode(&frames[0].bytes).unwrap();
    assert_eq!(relayed.metadata.hop_count, msg.metadata.hop_count + 1);
    assert_eq!(relayed.metadata.routing_path, vec![a.id.clone()]);
    assert_eq!(relayed.metadata.message_hash, msg.metadata.message_hash);
    assert!(a.deliveries().is_empty());
}

#[tokio::test]
async fn test_no_relay_once_hops_reach_ttl() {
    let mut a = node();
    a.engine.peer_connected(&p("n1"), 1.0, 0);
    a.engine.peer_connected(&p("n2"), 1.0, 0);

    let msg = chat_from(&p("s"), Some(&p("n2")), 1, b"x").relayed_by(&p("n1"), 0);
    assert!(!msg.metadata.can_relay());
    let outcome = a.engine.process_incoming(&msg.encode(), &p("n1"), 0).await;
    assert_eq!(outcome, RelayOutcome::Dropped(DropReason::TtlExhausted));
    assert!(a.frames().is_empty());

    // an exhausted broadcast is still delivered locally
    let bcast = chat_from(&p("s"), None, 1, b"y").relayed_by(&p("n1"), 0);
    let outcome = a.engine.process_incoming(&bcast.encode(), &p("n1"), 0).await;
    assert_eq!(
        outcome,
        RelayOutcome::Processed {
            delivered: true,
            forward: ForwardOutcome::TtlExhausted,
        }
    );
    assert!(a.frames().is_empty());
}

#[tokio::test]
async fn test_broadcast_relayed_to_all_but_origin_and_path() {
    let mut a = node();
    for n in ["n1", "n2", "n3", "s"] {
        a.engine.peer_connected(&p(n), 1.0, 0);
    }
    let msg = chat_from(&p("s"), None, 5, b"all").relayed_by(&p("n3"), 0);
    let outcome = a.engine.process_incoming(&msg.encode(), &p("n1"), 0).await;
    assert!(outcome.was_delivered());
    // not back to n1 (sender of this copy), s (origin) or n3 (already visited)
    assert_eq!(outcome.relayed_to(), &[p("n2")]);
    assert_eq!(a.frames().len(), 1);
}

#[tokio::test]
async fn test_probability_gate_spares_local_delivery() {
    let mut a = node_with(RelayConfig {
        probability: RelayProbabilityConfig {
            steps: Vec::new(),
            floor: 0.0,
        },
        ..relay_config()
    });
    a.engine.peer_connected(&p("n1"), 1.0, 0);
    a.engine.peer_connected(&p("n2"), 1.0, 0);

    let msg = chat_from(&p("s"), None, 5, b"storm");
    let outcome = a.engine.process_incoming(&msg.encode(), &p("n1"), 0).await;
    assert_eq!(
        outcome,
        RelayOutcome::Processed {
            delivered: true,
            forward: ForwardOutcome::ProbabilisticSkip,
        }
    );
    assert_eq!(a.deliveries().len(), 1);
    assert!(a.frames().is_empty());
    let stats = a.engine.statistics(0);
    assert_eq!(stats.total_probabilistic_skip, 1);
    assert_eq!(stats.current_relay_probability, 0.0);
}

#[tokio::test]
async fn test_spam_gate_blocks_flooding_sender() {
    let a = node_with(RelayConfig {
        spam: SpamConfig {
            max_messages_per_window: 2,
            ..SpamConfig::default()
        },
        ..relay_config()
    });
    let s = p("spammer");
    for i in 0..2 {
        let msg = chat_from(&s, None, 3, &[i]);
        assert!(a.engine.process_incoming(&msg.encode(), &s, 0).await.was_delivered());
    }
    let msg = chat_from(&s, None, 3, b"more");
    assert_eq!(
        a.engine.process_incoming(&msg.encode(), &s, 0).await,
        RelayOutcome::Blocked(SpamReason::Flooding)
    );
    let msg = chat_from(&s, None, 3, b"again");
    assert_eq!(
        a.engine.process_incoming(&msg.encode(), &s, 1).await,
        RelayOutcome::Blocked(SpamReason::Blocked)
    );
    assert_eq!(a.engine.statistics(1).total_blocked, 2);
    assert!(a.engine.spam().is_blocked(&s, 1));
}

#[tokio::test]
async fn test_looped_message_dropped() {
    let a = node();
    let msg = chat_from(&p("s"), Some(&p("z")), 5, b"loop")
        .relayed_by(&a.id, 0)
        .relayed_by(&p("n1"), 0);
    let outcome = a.engine.process_incoming(&msg.encode(), &p("n1"), 0).await;
    assert_eq!(outcome, RelayOutcome::Dropped(DropReason::Loop));
}

#[tokio::test]
async fn test_unroutable_message_queued_for_relay() {
    let mut a = node();
    a.engine.peer_connected(&p("n1"), 1.0, 0);
    let msg = chat_from(&p("s"), Some(&p("far")), 5, b"later");
    let outcome = a.engine.process_incoming(&msg.encode(), &p("n1"), 0).await;
    assert_eq!(
        outcome,
        RelayOutcome::Processed {
            delivered: false,
            forward: ForwardOutcome::Queued,
        }
    );
    let queued = a
        .engine
        .queue()
        .get(&msg.original_message_id)
        .unwrap()
        .unwrap();
    assert_eq!(queued.partition, QueuePartition::Relay);
    assert_eq!(queued.relay_metadata().unwrap().hop_count, 0);
    assert_eq!(a.engine.statistics(0).active_relay_count, 1);
    assert!(a.frames().is_empty());
}

// ===== Encryption =====

#[tokio::test]
async fn test_encrypted_message_round_trip() {
    let mut a = node();
    let mut b = node();
    establish(&a, &b).await;
    a.engine.peer_connected(&b.id, 1.0, 0);

    let id = a
        .engine
        .send_message(Some(b.id.clone()), b"secret", MessagePriority::High, true, 0)
        .await
        .unwrap();
    let frames = a.frames();
    assert_eq!(frames.len(), 1);
    let envelope = MeshRelayMessage::decode(&frames[0].bytes).unwrap();
    let MessageBody::Chat(content) = &envelope.body else {
        panic!("expected chat");
    };
    assert!(content.is_encrypted());
    assert_ne!(content.bytes(), b"secret");

    let outcome = b.engine.process_incoming(&frames[0].bytes, &a.id, 10).await;
    assert!(outcome.was_delivered());
    let deliveries = b.deliveries();
    assert_eq!(deliveries[0].message_id, id);
    assert_eq!(deliveries[0].plaintext, b"secret");
    assert!(deliveries[0].was_encrypted);
}

#[tokio::test]
async fn test_undecryptable_message_counted() {
    let mut a = node();
    let msg = MeshRelayMessage::originate(
        MessageBody::Chat(MessageContent::Encrypted(vec![0u8; 40])),
        p("x"),
        Some(a.id.clone()),
        MessagePriority::Normal,
        3,
        0,
    );
    let outcome = a.engine.process_incoming(&msg.encode(), &p("x"), 0).await;
    assert_eq!(outcome, RelayOutcome::Dropped(DropReason::AuthenticationFailed));
    assert!(a.deliveries().is_empty());
    assert_eq!(a.engine.statistics(0).authentication_failures, 1);
}

#[tokio::test]
async fn test_encrypt_without_session_is_an_error() {
    let a = node();
    let err = a
        .engine
        .send_message(Some(p("nobody")), b"x", MessagePriority::Normal, true, 0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RelayError::Noise(crate::noise::NoiseError::SessionNotEstablished(_))
    ));
    let err = a
        .engine
        .send_message(None, b"x", MessagePriority::Normal, true, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::EncryptedBroadcast));
}

#[tokio::test]
async fn test_oversize_content_rejected() {
    let a = node();
    let payload = vec![0u8; crate::protocol::MAX_CONTENT_SIZE + 1];
    let err = a
        .engine
        .send_message(None, &payload, MessagePriority::Normal, false, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::ContentTooLarge { .. }));
}

// ===== Scenarios =====

#[tokio::test]
async fn test_store_and_forward_through_relay() {
    let mut a = node();
    let mut b = node();
    let mut c = node();
    a.engine.peer_connected(&b.id, 1.0, 0);
    b.engine.peer_connected(&a.id, 1.0, 0);

    // C is offline: A hands the message to B, B holds it
    let id = a
        .engine
        .send_message(Some(c.id.clone()), b"hello c", MessagePriority::Normal, false, 0)
        .await
        .unwrap();
    assert_eq!(a.engine.queue().pending_ids().unwrap(), vec![id]);
    let frames = a.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].next_hop, b.id);

    let outcome = b.engine.process_incoming(&frames[0].bytes, &a.id, 10).await;
    assert_eq!(
        outcome,
        RelayOutcome::Processed {
            delivered: false,
            forward: ForwardOutcome::Queued,
        }
    );
    assert!(b.frames().is_empty());
    assert_eq!(b.engine.queue().pending_ids().unwrap(), vec![id]);

    // C reconnects to B
    assert_eq!(c.engine.peer_connected(&b.id, 1.0, 20), 0);
    assert_eq!(b.engine.peer_connected(&c.id, 1.0, 20), 1);
    let frames = b.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].next_hop, c.id);
    let relayed = MeshRelayMessage::decode(&frames[0].bytes).unwrap();
    assert_eq!(relayed.metadata.hop_count, 1);
    assert_eq!(relayed.metadata.ttl, 3);
    assert_eq!(relayed.metadata.routing_path, vec![b.id.clone()]);

    let outcome = c.engine.process_incoming(&frames[0].bytes, &b.id, 30).await;
    assert!(outcome.was_delivered());
    let deliveries = c.deliveries();
    assert_eq!(deliveries[0].plaintext, b"hello c");
    assert_eq!(deliveries[0].sender, a.id);

    // C's ack travels back through B, clearing both queues
    let acks = c.frames();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].kind, MessageKind::Ack);
    assert_eq!(acks[0].next_hop, b.id);

    let outcome = b.engine.process_incoming(&acks[0].bytes, &c.id, 40).await;
    assert_eq!(outcome.relayed_to(), std::slice::from_ref(&a.id));
    assert!(b.engine.queue().pending_ids().unwrap().is_empty());

    let acks = b.frames();
    a.engine.process_incoming(&acks[0].bytes, &b.id, 50).await;
    assert!(a.engine.queue().pending_ids().unwrap().is_empty());
    assert!(a.engine.queue().is_deleted(&id));
}

#[tokio::test]
async fn test_directed_message_sent_directly_when_reachable() {
    let mut a = node();
    let b = node();
    a.engine.peer_connected(&b.id, 0.9, 0);
    let id = a
        .engine
        .send_message(Some(b.id.clone()), b"hi", MessagePriority::Normal, false, 0)
        .await
        .unwrap();
    let frames = a.frames();
    assert_eq!(frames[0].next_hop, b.id);
    let queued = a.engine.queue().get(&id).unwrap().unwrap();
    assert_eq!(queued.status(), QueuedMessageStatus::AwaitingAck);
    assert_eq!(queued.attempts, 1);
}

#[tokio::test]
async fn test_broadcast_originated_not_queued() {
    let mut a = node();
    a.engine.peer_connected(&p("n1"), 1.0, 0);
    a.engine.peer_connected(&p("n2"), 1.0, 0);
    a.engine
        .send_message(None, b"all", MessagePriority::Low, false, 0)
        .await
        .unwrap();
    assert_eq!(a.frames().len(), 2);
    assert!(a.engine.queue().is_empty().unwrap());
}

#[tokio::test]
async fn test_own_broadcast_echo_dropped() {
    let mut a = node();
    a.engine.peer_connected(&p("n1"), 1.0, 0);
    a.engine
        .send_message(None, b"echo", MessagePriority::Low, false, 0)
        .await
        .unwrap();
    let frame = a.frames().remove(0);
    let echo = MeshRelayMessage::decode(&frame.bytes)
        .unwrap()
        .relayed_by(&p("n1"), 5)
        .encode();
    assert_eq!(
        a.engine.process_incoming(&echo, &p("n1"), 5).await,
        RelayOutcome::Dropped(DropReason::Duplicate)
    );
}

// ===== Topology, lifecycle, maintenance =====

#[tokio::test]
async fn test_topology_announcement_extends_routing() {
    let mut a = node();
    let mut b = node();
    let c = p("c");
    a.engine.peer_connected(&b.id, 1.0, 0);
    b.engine.peer_connected(&a.id, 1.0, 0);
    b.engine.peer_connected(&c, 0.8, 0);

    b.engine.announce_topology(0).unwrap();
    let frames = b.frames();
    let to_a = frames.iter().find(|f| f.next_hop == a.id).unwrap();
    assert_eq!(to_a.kind, MessageKind::TopologyAnnounce);

    a.engine.process_incoming(&to_a.bytes, &b.id, 10).await;
    assert!(a.engine.routing().knows(&c));
    assert_eq!(a.engine.routing().estimated_network_size(), 3);

    // a message for c now routes via b
    a.engine
        .send_message(Some(c.clone()), b"via b", MessagePriority::Normal, false, 20)
        .await
        .unwrap();
    let frames = a.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].next_hop, b.id);
}

#[tokio::test]
async fn test_remove_peer_cancels_queued_relay_work() {
    let mut a = node();
    let n1 = p("n1");
    a.engine.peer_connected(&n1, 1.0, 0);
    let msg = chat_from(&p("s"), Some(&p("gone")), 5, b"drop me");
    a.engine.process_incoming(&msg.encode(), &n1, 0).await;
    assert!(!a.engine.queue().is_empty().unwrap());

    a.engine.remove_peer(&p("gone")).await;
    assert!(a.engine.queue().is_empty().unwrap());

    a.engine.remove_peer(&n1).await;
    assert!(!a.engine.routing().is_direct_neighbor(&n1));
    assert!(a.frames().is_empty());
}

#[tokio::test]
async fn test_peer_disconnect_holds_new_messages() {
    let mut a = node();
    let b = p("b");
    a.engine.peer_connected(&b, 1.0, 0);
    a.engine.peer_disconnected(&b);
    let id = a
        .engine
        .send_message(Some(b.clone()), b"wait", MessagePriority::Normal, false, 0)
        .await
        .unwrap();
    assert!(a.frames().is_empty());
    assert_eq!(
        a.engine.queue().get(&id).unwrap().unwrap().status(),
        QueuedMessageStatus::Pending
    );

    assert_eq!(a.engine.peer_connected(&b, 1.0, 100), 1);
    assert_eq!(a.frames()[0].message_id, id);
}

#[tokio::test]
async fn test_maintenance_resends_after_ack_timeout() {
    let mut a = node();
    let b = p("b");
    a.engine.peer_connected(&b, 1.0, 0);
    let id = a
        .engine
        .send_message(Some(b.clone()), b"retry me", MessagePriority::Normal, false, 0)
        .await
        .unwrap();
    assert_eq!(a.frames().len(), 1);

    let report = a.engine.maintenance_tick(30_000).await;
    assert_eq!(report.resent, 0);
    let queued = a.engine.queue().get(&id).unwrap().unwrap();
    assert_eq!(queued.status(), QueuedMessageStatus::Retrying);
    let retry_at = queued.retry_after_ms.unwrap();

    let report = a.engine.maintenance_tick(retry_at).await;
    assert_eq!(report.resent, 1);
    let frames = a.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].message_id, id);
    assert_eq!(a.engine.queue().get(&id).unwrap().unwrap().attempts, 2);
}

#[tokio::test]
async fn test_maintenance_sends_unsent_once_route_appears() {
    let mut a = node();
    let id = a
        .engine
        .send_message(Some(p("far")), b"eventually", MessagePriority::Normal, false, 0)
        .await
        .unwrap();
    assert_eq!(a.engine.maintenance_tick(1_000).await.resent, 0);

    a.engine.routing().add_connection(&p("n1"), 1.0, 2_000);
    let report = a.engine.maintenance_tick(2_000).await;
    assert_eq!(report.resent, 1);
    assert_eq!(a.frames()[0].message_id, id);
}

#[tokio::test]
async fn test_maintenance_delivers_synced_message_addressed_to_us() {
    let mut c = node();
    let (x, n) = (p("x"), p("n"));
    let msg = chat_from(&x, Some(&c.id), 3, b"carried for you");
    let outcome = c
        .engine
        .queue()
        .enqueue_transferred(&msg, u64::MAX, 0)
        .unwrap();
    assert!(outcome.is_queued());
    c.engine.peer_connected(&n, 1.0, 10);
    c.frames();

    let report = c.engine.maintenance_tick(20).await;
    assert_eq!(report.delivered_from_queue, 1);
    assert_eq!(report.resent, 0);

    let deliveries = c.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].plaintext, b"carried for you");
    assert_eq!(deliveries[0].sender, x);

    // only the ack leaves; the chat itself is not forwarded
    let frames = c.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind, MessageKind::Ack);
    assert!(!c.engine.queue().contains(&msg.original_message_id).unwrap());
    assert!(c.engine.queue().is_deleted(&msg.original_message_id));
}

#[tokio::test]
async fn test_synced_copy_of_delivered_message_not_delivered_twice() {
    let mut c = node();
    let x = p("x");
    c.engine.peer_connected(&x, 1.0, 0);
    let msg = chat_from(&x, Some(&c.id), 3, b"once");
    assert!(c.engine.process_incoming(&msg.encode(), &x, 0).await.was_delivered());
    c.deliveries();
    c.frames();

    c.engine
        .queue()
        .enqueue_transferred(&msg, u64::MAX, 10)
        .unwrap();
    let report = c.engine.maintenance_tick(20).await;
    assert_eq!(report.delivered_from_queue, 1);
    assert!(c.deliveries().is_empty());
    let frames = c.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind, MessageKind::Ack);
    assert!(c.engine.queue().is_empty().unwrap());
}

#[tokio::test]
async fn test_maintenance_purges_expired() {
    let a = node();
    a.engine
        .send_message(Some(p("far")), b"stale", MessagePriority::Low, false, 0)
        .await
        .unwrap();
    let report = a.engine.maintenance_tick(6 * 3600 * 1000).await;
    assert_eq!(report.expired_messages, 1);
    assert!(a.engine.queue().is_empty().unwrap());
}

#[tokio::test]
async fn test_statistics_efficiency() {
    let mut a = node();
    a.engine.peer_connected(&p("n2"), 1.0, 0);
    let to_a = chat_from(&p("s"), Some(&a.id), 3, b"1");
    let onward = chat_from(&p("s"), Some(&p("n2")), 3, b"2");
    a.engine.process_incoming(&to_a.encode(), &p("n1"), 0).await;
    a.engine.process_incoming(&onward.encode(), &p("n1"), 0).await;
    a.engine.process_incoming(b"junk", &p("n1"), 0).await;
    a.engine.process_incoming(&onward.encode(), &p("n1"), 0).await;
    a.frames();

    let stats = a.engine.statistics(0);
    assert_eq!(stats.total_processed, 4);
    assert_eq!(stats.total_delivered_to_self, 1);
    assert_eq!(stats.total_relayed, 1);
    assert_eq!(stats.total_dropped, 2);
    assert!((stats.relay_efficiency - 0.5).abs() < 1e-9);
    assert_eq!(stats.network_size, 2);
}

#[tokio::test(start_paused = true)]
async fn test_spawned_maintenance_can_be_aborted() {
    let a = Arc::new(node().engine);
    let handle = spawn_maintenance(a.clone(), Duration::from_secs(1));
    tokio::time::sleep(Duration::from_secs(3)).await;
    handle.abort();
    let err = handle.await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(Arc::strong_count(&a), 1);
}

#[test]
fn test_outcome_helpers() {
    let hops = vec![p("a")];
    let relayed = RelayOutcome::Processed {
        delivered: false,
        forward: ForwardOutcome::Relayed(hops.clone()),
    };
    assert_eq!(relayed.relayed_to(), hops.as_slice());
    assert!(!relayed.was_delivered());
    assert!(RelayOutcome::Dropped(DropReason::Duplicate).relayed_to().is_empty());
    assert_eq!(DropReason::TtlExhausted.to_string(), "ttl exhausted");
}
