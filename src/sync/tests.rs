use super::*;
use crate::config::{QueueConfig, SyncConfig};
use crate::identity::{MessageId, PeerId};
use crate::protocol::{MeshRelayMessage, MessageBody, MessageContent, MessagePriority};
use crate::queue::{
    InMemoryQueueRepository, OfflineMessageQueue, QueuePartition, QueuedMessageStatus,
};
use std::sync::{Arc, Mutex};

fn p(name: &str) -> PeerId {
    PeerId::new(name).unwrap()
}

struct Side {
    queue: Arc<OfflineMessageQueue>,
    sync: Arc<QueueSyncCoordinator>,
}

fn side_with(config: SyncConfig) -> Side {
    let queue = Arc::new(OfflineMessageQueue::new(
        QueueConfig::default(),
        Arc::new(InMemoryQueueRepository::new()),
    ));
    let sync = Arc::new(QueueSyncCoordinator::new(config, queue.clone()));
    Side { queue, sync }
}

fn side() -> Side {
    side_with(SyncConfig::default())
}

fn envelope(text: &str) -> MeshRelayMessage {
    MeshRelayMessage::originate(
        MessageBody::Chat(MessageContent::Plain(text.as_bytes().to_vec())),
        p("sender"),
        Some(p("recipient")),
        MessagePriority::Normal,
        5,
        0,
    )
}

fn hold(side: &Side, message: &MeshRelayMessage, now: u64) {
    assert!(
        side.queue
            .enqueue(message, QueuePartition::Direct, now)
            .unwrap()
            .is_queued()
    );
}

/// In-process responder that records every frame it is sent.
struct Loopback {
    remote: PeerId,
    local: PeerId,
    responder: Arc<QueueSyncCoordinator>,
    now: u64,
    frames: Mutex<Vec<SyncFrame>>,
}

impl Loopback {
    fn to(side: &Side, now: u64) -> Self {
        Self {
            remote: p("responder"),
            local: p("initiator"),
            responder: side.sync.clone(),
            now,
            frames: Mutex::new(Vec::new()),
        }
    }

    fn frames(&self) -> Vec<SyncFrame> {
        self.frames.lock().unwrap().clone()
    }

    fn pushed_ids(&self) -> Vec<MessageId> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                SyncFrame::Push { messages, .. } => Some(messages),
                _ => None,
            })
            .flatten()
            .map(|m| m.id)
            .collect()
    }
}

impl SyncPeer for Loopback {
    fn peer_id(&self) -> &PeerId {
        &self.remote
    }

    async fn exchange(&self, frame: SyncFrame) -> Result<SyncFrame, SyncError> {
        self.frames.lock().unwrap().push(frame.clone());
        self.responder.handle_frame(&self.local, frame, self.now)
    }
}

/// Peer that never answers.
struct Silent(PeerId);

impl SyncPeer for Silent {
    fn peer_id(&self) -> &PeerId {
        &self.0
    }

    async fn exchange(&self, _frame: SyncFrame) -> Result<SyncFrame, SyncError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Err(SyncError::Transport("unreachable".into()))
    }
}

/// Peer that answers every frame with the same canned reply.
struct Canned(PeerId, SyncFrame);

impl SyncPeer for Canned {
    fn peer_id(&self) -> &PeerId {
        &self.0
    }

    async fn exchange(&self, _frame: SyncFrame) -> Result<SyncFrame, SyncError> {
        Ok(self.1.clone())
    }
}

// ===== Hashing =====

#[test]
fn test_queue_hash_tracks_pending_set() {
    let a = side();
    let b = side();
    let empty = a.sync.queue_hash(0).unwrap();
    assert_eq!(empty, b.sync.queue_hash(0).unwrap());

    let (m1, m2) = (envelope("one"), envelope("two"));
    hold(&a, &m1, 0);
    let after_one = a.sync.queue_hash(0).unwrap();
    assert_ne!(after_one, empty);

    hold(&a, &m2, 0);
    hold(&b, &m2, 0);
    hold(&b, &m1, 0);
    // insertion order does not matter
    assert_eq!(a.sync.queue_hash(0).unwrap(), b.sync.queue_hash(0).unwrap());

    a.queue.acknowledge(&m2.original_message_id, 0).unwrap();
    assert_eq!(a.sync.queue_hash(0).unwrap(), after_one);
}

// ===== Rounds =====

#[tokio::test]
async fn test_equal_queues_already_synced() {
    let a = side();
    let b = side();
    for text in ["one", "two"] {
        let m = envelope(text);
        hold(&a, &m, 0);
        hold(&b, &m, 0);
    }
    let peer = Loopback::to(&b, 0);
    assert_eq!(a.sync.initiate_sync(&peer, 0).await, SyncOutcome::AlreadySynced);
    assert_eq!(peer.frames().len(), 1);
}

#[tokio::test]
async fn test_only_missing_message_transferred() {
    let a = side();
    let b = side();
    let (m1, m2, m3) = (envelope("one"), envelope("two"), envelope("three"));
    for m in [&m1, &m2, &m3] {
        hold(&a, m, 0);
    }
    for m in [&m1, &m2] {
        hold(&b, m, 0);
    }
    assert_ne!(a.sync.queue_hash(0).unwrap(), b.sync.queue_hash(0).unwrap());

    let peer = Loopback::to(&b, 0);
    let outcome = a.sync.initiate_sync(&peer, 0).await;
    let SyncOutcome::Success {
        received,
        updated,
        skipped,
        sent,
        final_hash,
        ..
    } = outcome
    else {
        panic!("unexpected outcome {:?}", outcome);
    };
    assert_eq!((received, updated, skipped, sent), (0, 0, 0, 1));
    assert_eq!(peer.pushed_ids(), vec![m3.original_message_id]);

    let copy = b.queue.get(&m3.original_message_id).unwrap().unwrap();
    assert_eq!(copy.partition, QueuePartition::Relay);
    assert_eq!(copy.status(), QueuedMessageStatus::Pending);
    assert_eq!(copy.attempts, 0);

    assert_eq!(b.queue.pending_ids().unwrap(), a.queue.pending_ids().unwrap());
    assert_eq!(b.sync.queue_hash(0).unwrap(), final_hash);
}

#[tokio::test]
async fn test_initiator_fetches_what_it_lacks() {
    let a = side();
    let b = side();
    let (m1, m2) = (envelope("one"), envelope("two"));
    hold(&a, &m1, 0);
    hold(&b, &m1, 0);
    hold(&b, &m2, 0);

    let peer = Loopback::to(&b, 0);
    match a.sync.initiate_sync(&peer, 0).await {
        SyncOutcome::Success { received, sent, .. } => {
            assert_eq!(received, 1);
            assert_eq!(sent, 0);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(a.queue.contains(&m2.original_message_id).unwrap());
    assert!(peer.pushed_ids().is_empty());
}

#[tokio::test]
async fn test_later_expiry_propagates() {
    let a = side();
    let b = side();
    let (m1, m2) = (envelope("one"), envelope("two"));
    hold(&a, &m1, 0);
    hold(&b, &m1, 5_000);
    hold(&b, &m2, 5_000);

    let peer = Loopback::to(&b, 6_000);
    match a.sync.initiate_sync(&peer, 6_000).await {
        SyncOutcome::Success {
            received, updated, ..
        } => assert_eq!((received, updated), (1, 1)),
        other => panic!("unexpected outcome {:?}", other),
    }
    let ours = a.queue.get(&m1.original_message_id).unwrap().unwrap();
    let theirs = b.queue.get(&m1.original_message_id).unwrap().unwrap();
    assert_eq!(ours.expires_at_ms, theirs.expires_at_ms);
}

#[tokio::test]
async fn test_deleted_message_not_resurrected() {
    let a = side();
    let b = side();
    let (m1, m2) = (envelope("one"), envelope("two"));
    for m in [&m1, &m2] {
        hold(&a, m, 0);
        hold(&b, m, 0);
    }
    b.queue.remove(&m2.original_message_id, 0).unwrap();

    // responder refuses it
    let peer = Loopback::to(&b, 0);
    match a.sync.initiate_sync(&peer, 0).await {
        SyncOutcome::Success { sent, .. } => assert_eq!(sent, 0),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!b.queue.contains(&m2.original_message_id).unwrap());

    // initiator does not fetch it
    let peer = Loopback::to(&a, 0);
    match b.sync.initiate_sync(&peer, 0).await {
        SyncOutcome::Success { received, .. } => assert_eq!(received, 0),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!b.queue.contains(&m2.original_message_id).unwrap());

    // nor does a direct merge
    let copy = a.queue.get(&m2.original_message_id).unwrap().unwrap();
    let merged = b.sync.merge(vec![copy], 0).unwrap();
    assert_eq!(merged.skipped, 1);
    assert!(!b.queue.contains(&m2.original_message_id).unwrap());
}

#[tokio::test]
async fn test_transfer_split_into_batches() {
    let small = || SyncConfig {
        max_messages_per_frame: 2,
        ..SyncConfig::default()
    };
    let a = side_with(small());
    let b = side_with(small());
    for i in 0..5 {
        hold(&a, &envelope(&format!("m{}", i)), 0);
    }

    let peer = Loopback::to(&b, 0);
    match a.sync.initiate_sync(&peer, 0).await {
        SyncOutcome::Success { sent, .. } => assert_eq!(sent, 5),
        other => panic!("unexpected outcome {:?}", other),
    }
    let pushes = peer
        .frames()
        .into_iter()
        .filter(|f| matches!(f, SyncFrame::Push { .. }))
        .count();
    assert_eq!(pushes, 3);
    assert_eq!(b.queue.len().unwrap(), 5);
}

// ===== Failures =====

#[tokio::test]
async fn test_initiator_rate_limited() {
    let a = side();
    let b = side();
    let peer = Loopback::to(&b, 0);
    assert!(a.sync.initiate_sync(&peer, 0).await.is_success());
    assert_eq!(
        a.sync.initiate_sync(&peer, 1_000).await,
        SyncOutcome::RateLimited(RateLimitReason::TooSoon { retry_in_ms: 29_000 })
    );
    assert!(a.sync.initiate_sync(&peer, 30_000).await.is_success());
}

#[tokio::test]
async fn test_responder_rate_limited() {
    let a = side();
    let b = side();
    hold(&a, &envelope("one"), 0);
    let first = Loopback::to(&b, 0);
    assert!(a.sync.initiate_sync(&first, 0).await.is_success());

    // a second initiator sharing the same id is refused by the responder
    let other = side();
    hold(&other, &envelope("two"), 0);
    let second = Loopback::to(&b, 1_000);
    assert_eq!(
        other.sync.initiate_sync(&second, 1_000).await,
        SyncOutcome::RateLimited(RateLimitReason::TooSoon { retry_in_ms: 29_000 })
    );
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out() {
    let a = side();
    hold(&a, &envelope("one"), 0);
    let outcome = a.sync.initiate_sync(&Silent(p("silent")), 0).await;
    assert_eq!(outcome, SyncOutcome::Timeout);
}

#[tokio::test]
async fn test_unexpected_reply_is_error() {
    let a = side();
    let reply = SyncFrame::PushAck {
        received: 0,
        updated: 0,
        skipped: 0,
        messages: Vec::new(),
    };
    match a.sync.initiate_sync(&Canned(p("odd"), reply), 0).await {
        SyncOutcome::Error(message) => assert!(message.contains("push_ack")),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_push_without_request_refused() {
    let b = side();
    let push = SyncFrame::Push {
        messages: Vec::new(),
        fetch: Vec::new(),
    };
    assert!(matches!(
        b.sync.handle_frame(&p("x"), push, 0),
        Err(SyncError::UnexpectedFrame(_))
    ));
}

#[test]
fn test_push_after_round_expired_refused() {
    let a = side();
    let b = side();
    let m = envelope("one");
    hold(&a, &m, 0);
    let request = SyncFrame::Request {
        queue_hash: a.sync.queue_hash(0).unwrap(),
        entries: vec![SyncEntry {
            id: m.original_message_id,
            expires_at_ms: u64::MAX,
        }],
        deleted: Vec::new(),
    };
    assert!(matches!(
        b.sync.handle_frame(&p("x"), request, 0).unwrap(),
        SyncFrame::Response { .. }
    ));
    let push = SyncFrame::Push {
        messages: Vec::new(),
        fetch: Vec::new(),
    };
    let late = SyncConfig::default().exchange_timeout_ms + 1;
    assert!(b.sync.handle_frame(&p("x"), push, late).is_err());
}

#[test]
fn test_merge_rejects_mismatched_record() {
    let a = side();
    let b = side();
    let m = envelope("one");
    hold(&a, &m, 0);
    let mut forged = a.queue.get(&m.original_message_id).unwrap().unwrap();
    forged.id = MessageId::generate();
    let merged = b.sync.merge(vec![forged], 0).unwrap();
    assert_eq!(merged, MergeCounts { received: 0, updated: 0, skipped: 1 });
    assert!(b.queue.is_empty().unwrap());
}

#[test]
fn test_merge_ignores_peer_record_fields() {
    let a = side();
    let b = side();
    let m = envelope("one");
    hold(&a, &m, 0);
    let mut forged = a.queue.get(&m.original_message_id).unwrap().unwrap();
    forged.recipient = p("someone-else");
    forged.priority = MessagePriority::Urgent;
    forged.expires_at_ms = u64::MAX;
    forged.attempts = 9;

    let merged = b.sync.merge(vec![forged], 1_000).unwrap();
    assert_eq!(merged.received, 1);

    let stored = b.queue.get(&m.original_message_id).unwrap().unwrap();
    let lifetime = b.queue.policy().expiry_ms(MessagePriority::Normal);
    assert_eq!(stored.recipient, p("recipient"));
    assert_eq!(stored.priority, MessagePriority::Normal);
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.expires_at_ms, 1_000 + lifetime);
    assert_eq!(
        b.queue.purge_expired(1_000 + lifetime).unwrap(),
        vec![m.original_message_id]
    );
}

#[test]
fn test_merge_caps_refreshed_expiry() {
    let a = side();
    let b = side();
    let m = envelope("one");
    hold(&a, &m, 0);
    hold(&b, &m, 0);
    let mut copy = a.queue.get(&m.original_message_id).unwrap().unwrap();
    copy.expires_at_ms = u64::MAX;

    let merged = b.sync.merge(vec![copy], 2_000).unwrap();
    assert_eq!(merged.updated, 1);
    let lifetime = b.queue.policy().expiry_ms(MessagePriority::Normal);
    assert_eq!(
        b.queue.get(&m.original_message_id).unwrap().unwrap().expires_at_ms,
        2_000 + lifetime
    );
}

#[test]
fn test_prune_and_forget() {
    let b = side();
    let request = SyncFrame::Request {
        queue_hash: [1u8; 32],
        entries: Vec::new(),
        deleted: Vec::new(),
    };
    b.sync.handle_frame(&p("x"), request, 0).unwrap();
    b.sync.forget_peer(&p("x"));
    let request = SyncFrame::Request {
        queue_hash: [1u8; 32],
        entries: Vec::new(),
        deleted: Vec::new(),
    };
    // forgotten peers start with a fresh budget
    assert!(b.sync.handle_frame(&p("x"), request, 1).is_ok());
    assert_eq!(b.sync.prune(2 * 3_600_000), 1);
}
