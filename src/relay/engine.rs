//! The relay engine: inbound pipeline, origination, peer lifecycle and
//! maintenance.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::stats::RelayCounters;
use super::{
    DropReason, ForwardOutcome, LocalDelivery, MaintenanceReport, OutboundFrame, RelayChannels,
    RelayError, RelayOutcome, RelayProbabilityCurve, RelayStatistics, SeenMessageStore,
    SpamPrevention, SpamVerdict,
};
use crate::config::RelayConfig;
use crate::identity::{IdentityResolver, MessageId, PeerId, RecipientMatch, now_ms};
use crate::noise::{NoiseSessionManager, TAG_SIZE};
use crate::protocol::{
    MAX_CONTENT_SIZE, MeshRelayMessage, MessageBody, MessageContent, MessageKind, MessagePriority,
};
use crate::queue::{OfflineMessageQueue, QueuePartition, QueuedMessage};
use crate::routing::RoutingService;

/// Most neighbours carried in one topology announcement.
const MAX_ANNOUNCED_NEIGHBORS: usize = u8::MAX as usize;

/// Deduplicating, routing, queueing relay for one node.
///
/// One instance per process; every transport feeds `process_incoming` and
/// drains the outbound channel.
pub struct MeshRelayEngine {
    config: RelayConfig,
    local_id: PeerId,
    identity: Arc<dyn IdentityResolver>,
    sessions: Arc<NoiseSessionManager>,
    routing: Arc<RoutingService>,
    queue: Arc<OfflineMessageQueue>,
    seen: SeenMessageStore,
    spam: SpamPrevention,
    curve: RelayProbabilityCurve,
    counters: Mutex<RelayCounters>,
    channels: RelayChannels,
}

impl MeshRelayEngine {
    pub fn new(
        config: RelayConfig,
        identity: Arc<dyn IdentityResolver>,
        sessions: Arc<NoiseSessionManager>,
        routing: Arc<RoutingService>,
        queue: Arc<OfflineMessageQueue>,
        channels: RelayChannels,
    ) -> Self {
        let seen = SeenMessageStore::new(
            config.dedup_window_secs.saturating_mul(1000),
            config.dedup_capacity,
        );
        let spam = SpamPrevention::new(config.spam.clone());
        let curve = RelayProbabilityCurve::new(config.probability.clone());
        let local_id = identity.local_id();
        Self {
            config,
            local_id,
            identity,
            sessions,
            routing,
            queue,
            seen,
            spam,
            curve,
            counters: Mutex::new(RelayCounters::default()),
            channels,
        }
    }

    fn counters(&self) -> MutexGuard<'_, RelayCounters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn count(&self, update: impl FnOnce(&mut RelayCounters)) {
        update(&mut self.counters());
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn routing(&self) -> &Arc<RoutingService> {
        &self.routing
    }

    pub fn queue(&self) -> &Arc<OfflineMessageQueue> {
        &self.queue
    }

    pub fn sessions(&self) -> &Arc<NoiseSessionManager> {
        &self.sessions
    }

    pub fn spam(&self) -> &SpamPrevention {
        &self.spam
    }

    fn origin_ttl(&self) -> u8 {
        self.config.default_ttl.min(self.config.max_ttl).max(1)
    }

    // === Origination ===

    /// Originate a chat message. With `encrypt` the payload is sealed with
    /// the Noise session to `recipient`, which must be established.
    ///
    /// Directed messages are queued until acknowledged; broadcasts go to
    /// every direct neighbour once.
    pub async fn send_message(
        &self,
        recipient: Option<PeerId>,
        payload: &[u8],
        priority: MessagePriority,
        encrypt: bool,
        current_time_ms: u64,
    ) -> Result<MessageId, RelayError> {
        let max = if encrypt {
            MAX_CONTENT_SIZE - TAG_SIZE
        } else {
            MAX_CONTENT_SIZE
        };
        if payload.len() > max {
            return Err(RelayError::ContentTooLarge {
                size: payload.len(),
                max,
            });
        }

        let content = if encrypt {
            let Some(peer) = recipient.as_ref() else {
                return Err(RelayError::EncryptedBroadcast);
            };
            MessageContent::Encrypted(self.sessions.encrypt(payload, peer).await?)
        } else {
            MessageContent::Plain(payload.to_vec())
        };

        self.originate(MessageBody::Chat(content), recipient, priority, current_time_ms)
    }

    /// Broadcast our direct links so other nodes learn multi-hop distances.
    pub fn announce_topology(&self, current_time_ms: u64) -> Result<MessageId, RelayError> {
        let mut neighbors = self.routing.local_announcement(current_time_ms);
        neighbors.truncate(MAX_ANNOUNCED_NEIGHBORS);
        self.originate(
            MessageBody::TopologyAnnounce { neighbors },
            None,
            MessagePriority::Low,
            current_time_ms,
        )
    }

    fn originate(
        &self,
        body: MessageBody,
        recipient: Option<PeerId>,
        priority: MessagePriority,
        current_time_ms: u64,
    ) -> Result<MessageId, RelayError> {
        let message = MeshRelayMessage::originate(
            body,
            self.local_id.clone(),
            recipient,
            priority,
            self.origin_ttl(),
            current_time_ms,
        );
        let id = message.original_message_id;
        // echoes of our own message must not be relayed back out
        self.seen.insert(&message.metadata.message_hash, current_time_ms);

        if message.is_broadcast() {
            let hops = self.broadcast(&message, &[]);
            debug!(
                message_id = %id,
                kind = %message.kind(),
                neighbors = hops.len(),
                "Broadcast originated"
            );
            return Ok(id);
        }

        let outcome = self
            .queue
            .enqueue(&message, QueuePartition::Direct, current_time_ms)?;
        let next_hop = self.select_next_hop(&message, &[], current_time_ms);

        if !outcome.is_queued() {
            debug!(message_id = %id, outcome = ?outcome, "Originated message not queued");
            if let Some(hop) = next_hop {
                self.emit(&hop, &message);
            }
            return Ok(id);
        }

        match next_hop {
            Some(hop) => {
                self.send_queued(&id, &hop, &message, current_time_ms);
            }
            None => {
                debug!(
                    message_id = %id,
                    kind = %message.kind(),
                    "No next hop, message held in queue"
                );
            }
        }
        Ok(id)
    }

    // === Inbound pipeline ===

    /// Run one inbound envelope from direct neighbour `from` through the
    /// pipeline. Never fails; problems become counters and logs.
    pub async fn process_incoming(
        &self,
        bytes: &[u8],
        from: &PeerId,
        current_time_ms: u64,
    ) -> RelayOutcome {
        self.count(|c| c.processed += 1);
        self.routing.observe(from, current_time_ms);

        let message = match MeshRelayMessage::decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %from.short(), error = %e, "Dropping malformed envelope");
                self.count(|c| {
                    c.malformed += 1;
                    c.dropped += 1;
                });
                return RelayOutcome::Dropped(DropReason::Malformed);
            }
        };
        let id = message.original_message_id;
        let meta = &message.metadata;

        if !self.seen.insert(&meta.message_hash, current_time_ms) {
            debug!(message_id = %id, peer = %from.short(), "Duplicate message dropped");
            self.count(|c| c.dropped += 1);
            // the sender is retrying, so our first ack was lost
            self.reack_duplicate(&message, current_time_ms);
            return RelayOutcome::Dropped(DropReason::Duplicate);
        }
        if meta.original_sender == self.local_id || meta.has_visited(&self.local_id) {
            debug!(message_id = %id, "Looped message dropped");
            self.count(|c| c.dropped += 1);
            return RelayOutcome::Dropped(DropReason::Loop);
        }

        if let SpamVerdict::Block(reason) =
            self.spam
                .assess(&meta.original_sender, bytes.len(), current_time_ms)
        {
            debug!(
                message_id = %id,
                sender = %meta.original_sender.short(),
                reason = %reason,
                "Message blocked"
            );
            self.count(|c| c.blocked += 1);
            return RelayOutcome::Blocked(reason);
        }

        let network_size = self.routing.estimated_network_size();
        let relay_allowed = self
            .curve
            .should_relay(network_size, &mut rand::thread_rng());

        let recipient = self.identity.match_recipient(meta.final_recipient.as_ref());
        let can_relay = meta.can_relay();

        let mut delivered = false;
        if recipient.is_local() {
            match self.consume_locally(&message, current_time_ms).await {
                Ok(d) => delivered = d,
                Err(reason) => {
                    self.count(|c| c.dropped += 1);
                    return RelayOutcome::Dropped(reason);
                }
            }
        } else if let MessageBody::Ack { acked } = &message.body {
            // acks passing through still clear our relay copy
            self.purge_acked(acked, current_time_ms);
        }

        let forward = match recipient {
            RecipientMatch::Persistent | RecipientMatch::Ephemeral => ForwardOutcome::NotForwarded,
            RecipientMatch::Broadcast | RecipientMatch::Other => {
                if !can_relay {
                    ForwardOutcome::TtlExhausted
                } else if !relay_allowed {
                    ForwardOutcome::ProbabilisticSkip
                } else {
                    self.forward(&message, from, current_time_ms)
                }
            }
        };

        match &forward {
            ForwardOutcome::Relayed(hops) => {
                debug!(
                    message_id = %id,
                    hops = hops.len(),
                    hop_count = meta.hop_count + 1,
                    "Message relayed"
                );
                self.count(|c| c.relayed += 1);
            }
            ForwardOutcome::Queued => self.count(|c| c.queued += 1),
            ForwardOutcome::ProbabilisticSkip => {
                debug!(message_id = %id, network_size, "Relay skipped by probability gate");
                self.count(|c| c.probabilistic_skip += 1);
            }
            ForwardOutcome::TtlExhausted if !delivered => {
                debug!(message_id = %id, ttl = meta.ttl, "TTL exhausted, dropping");
                self.count(|c| c.dropped += 1);
                return RelayOutcome::Dropped(DropReason::TtlExhausted);
            }
            _ => {}
        }

        RelayOutcome::Processed { delivered, forward }
    }

    /// Handle a message addressed to us (or broadcast). Returns whether an
    /// application delivery was made.
    async fn consume_locally(
        &self,
        message: &MeshRelayMessage,
        current_time_ms: u64,
    ) -> Result<bool, DropReason> {
        let meta = &message.metadata;
        match &message.body {
            MessageBody::Chat(content) => {
                let sender = self
                    .identity
                    .persistent_for(&meta.original_sender)
                    .unwrap_or_else(|| meta.original_sender.clone());
                let plaintext = match content {
                    MessageContent::Plain(bytes) => bytes.clone(),
                    MessageContent::Encrypted(ciphertext) => {
                        match self.sessions.decrypt(ciphertext, &sender).await {
                            Ok(plaintext) => plaintext,
                            Err(e) => {
                                warn!(
                                    message_id = %message.original_message_id,
                                    sender = %sender.short(),
                                    error = %e,
                                    "Failed to decrypt message addressed to us"
                                );
                                self.count(|c| c.authentication_failures += 1);
                                return Err(DropReason::AuthenticationFailed);
                            }
                        }
                    }
                };

                let delivery = LocalDelivery {
                    message_id: message.original_message_id,
                    sender,
                    priority: meta.priority,
                    plaintext,
                    was_encrypted: content.is_encrypted(),
                    broadcast: message.is_broadcast(),
                };
                if let Err(e) = self.channels.delivery.try_send(delivery) {
                    warn!(
                        message_id = %message.original_message_id,
                        error = %e,
                        "Local delivery channel unavailable, message dropped"
                    );
                    self.count(|c| c.dropped += 1);
                    return Ok(false);
                }
                self.count(|c| c.delivered_to_self += 1);

                if !message.is_broadcast() && self.config.auto_ack {
                    self.send_ack(message, current_time_ms);
                }
                Ok(true)
            }
            MessageBody::Ack { acked } => {
                self.purge_acked(acked, current_time_ms);
                Ok(false)
            }
            MessageBody::TopologyAnnounce { neighbors } => {
                self.routing
                    .apply_announcement(&meta.original_sender, neighbors, current_time_ms);
                Ok(false)
            }
        }
    }

    fn send_ack(&self, message: &MeshRelayMessage, current_time_ms: u64) {
        let body = MessageBody::Ack {
            acked: message.original_message_id,
        };
        let to = message.metadata.original_sender.clone();
        if let Err(e) = self.originate(body, Some(to), message.metadata.priority, current_time_ms) {
            warn!(
                message_id = %message.original_message_id,
                error = %e,
                "Failed to originate ack"
            );
        }
    }

    /// Directed at this node's persistent or ephemeral identity.
    fn addressed_to_us(&self, message: &MeshRelayMessage) -> bool {
        matches!(
            self.identity
                .match_recipient(message.metadata.final_recipient.as_ref()),
            RecipientMatch::Persistent | RecipientMatch::Ephemeral
        )
    }

    /// Ack a retransmitted chat already delivered here, without delivering
    /// it again.
    fn reack_duplicate(&self, message: &MeshRelayMessage, current_time_ms: u64) {
        if !self.config.auto_ack
            || message.kind() != MessageKind::Chat
            || !self.addressed_to_us(message)
        {
            return;
        }
        debug!(
            message_id = %message.original_message_id,
            sender = %message.metadata.original_sender.short(),
            "Re-acking retransmitted message"
        );
        self.send_ack(message, current_time_ms);
        self.count(|c| c.acks_resent += 1);
    }

    fn purge_acked(&self, acked: &MessageId, current_time_ms: u64) {
        self.count(|c| c.acks_processed += 1);
        match self.queue.acknowledge(acked, current_time_ms) {
            Ok(true) => debug!(message_id = %acked, "Ack cleared queued message"),
            Ok(false) => {}
            Err(e) => warn!(message_id = %acked, error = %e, "Failed to apply ack to queue"),
        }
    }

    /// Nodes a relayed copy must not go back to.
    fn relay_exclusions(&self, message: &MeshRelayMessage, from: Option<&PeerId>) -> Vec<PeerId> {
        let meta = &message.metadata;
        let mut exclude = Vec::with_capacity(meta.routing_path.len() + 3);
        exclude.push(self.local_id.clone());
        exclude.push(meta.original_sender.clone());
        if let Some(from) = from {
            exclude.push(from.clone());
        }
        exclude.extend(meta.routing_path.iter().cloned());
        exclude
    }

    fn forward(
        &self,
        message: &MeshRelayMessage,
        from: &PeerId,
        current_time_ms: u64,
    ) -> ForwardOutcome {
        let exclude = self.relay_exclusions(message, Some(from));
        let next = message.relayed_by(&self.local_id, current_time_ms);

        if message.is_broadcast() {
            let hops = self.broadcast(&next, &exclude);
            return if hops.is_empty() {
                ForwardOutcome::NoNeighbors
            } else {
                ForwardOutcome::Relayed(hops)
            };
        }

        if let Some(hop) = self.select_next_hop(message, &exclude, current_time_ms)
            && self.emit(&hop, &next)
        {
            return ForwardOutcome::Relayed(vec![hop]);
        }

        match self
            .queue
            .enqueue(message, QueuePartition::Relay, current_time_ms)
        {
            Ok(outcome) if outcome.is_queued() => {
                debug!(
                    message_id = %message.original_message_id,
                    "No next hop, holding message for relay"
                );
                ForwardOutcome::Queued
            }
            Ok(outcome) => {
                debug!(
                    message_id = %message.original_message_id,
                    outcome = ?outcome,
                    "No next hop and queue refused message"
                );
                ForwardOutcome::NoNeighbors
            }
            Err(e) => {
                warn!(
                    message_id = %message.original_message_id,
                    error = %e,
                    "Failed to queue message for relay"
                );
                ForwardOutcome::NoNeighbors
            }
        }
    }

    /// Routing first, then the best direct neighbour.
    fn select_next_hop(
        &self,
        message: &MeshRelayMessage,
        exclude: &[PeerId],
        current_time_ms: u64,
    ) -> Option<PeerId> {
        let destination = message.metadata.final_recipient.as_ref()?;
        let candidates: Vec<PeerId> = self
            .routing
            .direct_neighbors()
            .into_iter()
            .filter(|n| !exclude.contains(n))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let decision = self.routing.determine_optimal_route(
            destination,
            &candidates,
            message.metadata.priority,
            current_time_ms,
        );
        if decision.next_hop.is_some() {
            return decision.next_hop;
        }
        debug!(
            destination = %destination.short(),
            reason = %decision.reason,
            "No route, falling back to best direct neighbour"
        );
        self.routing.best_direct_neighbor(exclude, current_time_ms)
    }

    fn broadcast(&self, message: &MeshRelayMessage, exclude: &[PeerId]) -> Vec<PeerId> {
        self.routing
            .direct_neighbors()
            .into_iter()
            .filter(|n| !exclude.contains(n))
            .filter(|n| self.emit(n, message))
            .collect()
    }

    /// Hand an envelope to the transport. Failures count as drops.
    fn emit(&self, next_hop: &PeerId, message: &MeshRelayMessage) -> bool {
        let frame = OutboundFrame {
            next_hop: next_hop.clone(),
            message_id: message.original_message_id,
            kind: message.kind(),
            bytes: message.encode(),
        };
        match self.channels.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(peer = %next_hop.short(), "Outbound channel full, dropping frame");
                self.count(|c| c.dropped += 1);
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(peer = %next_hop.short(), "Outbound channel closed, dropping frame");
                self.count(|c| c.dropped += 1);
                false
            }
        }
    }

    /// Send a queued message and record the attempt.
    fn send_queued(
        &self,
        id: &MessageId,
        next_hop: &PeerId,
        message: &MeshRelayMessage,
        current_time_ms: u64,
    ) -> bool {
        if let Err(e) = self.queue.mark_sending(id, current_time_ms) {
            warn!(message_id = %id, error = %e, "Cannot start delivery attempt");
            return false;
        }
        let sent = self.emit(next_hop, message);
        let recorded = if sent {
            let await_ack = message.kind() == MessageKind::Chat;
            self.queue.mark_sent(id, await_ack, current_time_ms)
        } else {
            self.queue.mark_failed(id, current_time_ms).map(|_| ())
        };
        if let Err(e) = recorded {
            warn!(message_id = %id, error = %e, "Failed to record delivery attempt");
        }
        sent
    }

    /// Send a queued record to `next_hop`, relaying it if it was carried
    /// for someone else.
    fn send_from_queue(
        &self,
        queued: &QueuedMessage,
        envelope: MeshRelayMessage,
        next_hop: &PeerId,
        current_time_ms: u64,
    ) -> bool {
        let outgoing = match queued.partition {
            QueuePartition::Direct => envelope,
            QueuePartition::Relay => {
                if !envelope.metadata.can_relay() {
                    debug!(message_id = %queued.id, "Queued relay message out of hops");
                    self.discard(queued, current_time_ms);
                    return false;
                }
                envelope.relayed_by(&self.local_id, current_time_ms)
            }
        };
        let sent = self.send_queued(&queued.id, next_hop, &outgoing, current_time_ms);
        if sent && queued.partition == QueuePartition::Relay {
            self.count(|c| c.relayed += 1);
        }
        sent
    }

    fn decode_queued(&self, queued: &QueuedMessage, current_time_ms: u64) -> Option<MeshRelayMessage> {
        match queued.message() {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!(message_id = %queued.id, error = %e, "Discarding undecodable queued message");
                self.discard(queued, current_time_ms);
                None
            }
        }
    }

    fn discard(&self, queued: &QueuedMessage, current_time_ms: u64) {
        if let Err(e) = self.queue.remove(&queued.id, current_time_ms) {
            warn!(message_id = %queued.id, error = %e, "Failed to remove queued message");
        }
    }

    /// Consume a queued record addressed to this node, such as one taken
    /// in by queue sync, then clear it from the queue.
    async fn deliver_from_queue(
        &self,
        queued: &QueuedMessage,
        envelope: &MeshRelayMessage,
        current_time_ms: u64,
    ) {
        if self
            .seen
            .insert(&envelope.metadata.message_hash, current_time_ms)
        {
            if let Err(reason) = self.consume_locally(envelope, current_time_ms).await {
                debug!(
                    message_id = %queued.id,
                    reason = %reason,
                    "Queued message for us not consumed"
                );
                self.count(|c| c.dropped += 1);
            }
        } else {
            self.reack_duplicate(envelope, current_time_ms);
        }
        if let Err(e) = self.queue.acknowledge(&queued.id, current_time_ms) {
            warn!(message_id = %queued.id, error = %e, "Failed to clear consumed queued message");
        }
    }

    /// Try to send a queued record along the current best route.
    fn retry_queued(&self, queued: &QueuedMessage, current_time_ms: u64) -> bool {
        let Some(envelope) = self.decode_queued(queued, current_time_ms) else {
            return false;
        };
        let exclude = match queued.partition {
            QueuePartition::Direct => Vec::new(),
            QueuePartition::Relay => self.relay_exclusions(&envelope, None),
        };
        match self.select_next_hop(&envelope, &exclude, current_time_ms) {
            Some(hop) => self.send_from_queue(queued, envelope, &hop, current_time_ms),
            None => false,
        }
    }

    /// Whether `queued` was addressed to this node and has been consumed.
    async fn take_if_local(&self, queued: &QueuedMessage, current_time_ms: u64) -> bool {
        let Ok(envelope) = queued.message() else {
            return false;
        };
        if !self.addressed_to_us(&envelope) {
            return false;
        }
        self.deliver_from_queue(queued, &envelope, current_time_ms).await;
        true
    }

    // === Peer lifecycle ===

    /// A direct link came up: record it and flush messages queued for the
    /// peer. Returns how many were sent.
    pub fn peer_connected(&self, peer: &PeerId, quality: f64, current_time_ms: u64) -> usize {
        self.routing.add_connection(peer, quality, current_time_ms);
        info!(peer = %peer.short(), quality, "Peer connected");
        self.flush_peer(peer, current_time_ms)
    }

    /// Send everything queued for `peer` directly to it.
    pub fn flush_peer(&self, peer: &PeerId, current_time_ms: u64) -> usize {
        let ready = match self.queue.sendable_for(peer) {
            Ok(ready) => ready,
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "Failed to read queue for flush");
                return 0;
            }
        };
        let mut sent = 0;
        for queued in &ready {
            let Some(envelope) = self.decode_queued(queued, current_time_ms) else {
                continue;
            };
            if self.send_from_queue(queued, envelope, peer, current_time_ms) {
                sent += 1;
            }
        }
        if sent > 0 {
            info!(peer = %peer.short(), count = sent, "Flushed queued messages");
        }
        sent
    }

    /// A direct link went down.
    pub fn peer_disconnected(&self, peer: &PeerId) {
        self.routing.remove_connection(peer);
        info!(peer = %peer.short(), "Peer disconnected");
    }

    /// Forget a peer: its session, topology node, cached routes, retry
    /// timers and relay entries bound for it.
    pub async fn remove_peer(&self, peer: &PeerId) {
        self.sessions.remove_session(peer).await;
        self.routing.remove_peer(peer);
        match self.queue.cancel_peer(peer) {
            Ok(cancelled) => debug!(
                peer = %peer.short(),
                timers = cancelled.timers_cancelled,
                relay_discarded = cancelled.relay_discarded.len(),
                "Peer queue work cancelled"
            ),
            Err(e) => warn!(peer = %peer.short(), error = %e, "Failed to cancel queued work"),
        }
        info!(peer = %peer.short(), "Peer removed");
    }

    // === Maintenance ===

    /// One maintenance pass: expiry, pruning, routing upkeep, due retries
    /// and rekey checks.
    pub async fn maintenance_tick(&self, current_time_ms: u64) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match self.queue.purge_expired(current_time_ms) {
            Ok(purged) => report.expired_messages = purged.len(),
            Err(e) => warn!(error = %e, "Failed to purge expired messages"),
        }
        report.tombstones_pruned = self.queue.prune_tombstones(current_time_ms);
        report.dedup_pruned = self.seen.prune(current_time_ms);
        report.spam_pruned = self.spam.prune(current_time_ms);
        report.routing = self.routing.tick(current_time_ms);

        match self.queue.process_timers(current_time_ms) {
            Ok(due) => {
                for queued in &due {
                    if self.take_if_local(queued, current_time_ms).await {
                        report.delivered_from_queue += 1;
                    } else if self.retry_queued(queued, current_time_ms) {
                        report.resent += 1;
                    } else {
                        if let Err(e) = self.queue.defer(&queued.id, current_time_ms) {
                            warn!(message_id = %queued.id, error = %e, "Failed to defer retry");
                        }
                        report.deferred += 1;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to process retry timers"),
        }

        match self.queue.unsent() {
            Ok(unsent) => {
                for queued in &unsent {
                    if self.take_if_local(queued, current_time_ms).await {
                        report.delivered_from_queue += 1;
                    } else if self.retry_queued(queued, current_time_ms) {
                        report.resent += 1;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to read unsent messages"),
        }

        report.rekey_due = self.sessions.check_rekey(current_time_ms).await;

        if report.resent > 0 || report.expired_messages > 0 || report.delivered_from_queue > 0 {
            debug!(
                resent = report.resent,
                delivered = report.delivered_from_queue,
                deferred = report.deferred,
                expired = report.expired_messages,
                "Relay maintenance pass"
            );
        }
        report
    }

    /// Point-in-time telemetry.
    pub fn statistics(&self, current_time_ms: u64) -> RelayStatistics {
        let spam_score = self.spam.average_score(current_time_ms);
        let active_relay_count = self
            .queue
            .statistics(current_time_ms)
            .map(|s| s.relay)
            .unwrap_or(0);
        let network_size = self.routing.estimated_network_size();
        let probability = self.curve.probability(network_size);
        self.counters()
            .snapshot(spam_score, active_relay_count, network_size, probability)
    }
}

impl std::fmt::Debug for MeshRelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshRelayEngine")
            .field("local_id", &self.local_id)
            .field("seen", &self.seen.len())
            .finish()
    }
}

/// Run `maintenance_tick` every `period` until the handle is aborted.
pub fn spawn_maintenance(engine: Arc<MeshRelayEngine>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_ms = period.as_millis() as u64, "Relay maintenance started");
        loop {
            tick.tick().await;
            engine.maintenance_tick(now_ms()).await;
        }
    })
}
