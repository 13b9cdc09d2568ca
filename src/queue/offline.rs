//! The queue proper: admission, status updates, timers and maintenance.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{
    DeletedIdLog, QueueError, QueuePartition, QueueRepository, QueueStatistics, QueuedMessage,
    QueuedMessageStatus, RetryPolicy, RetryScheduler, TimerKind,
};
use crate::config::QueueConfig;
use crate::identity::{MessageId, PeerId};
use crate::protocol::{MeshRelayMessage, MessagePriority};

/// Result of offering a message to the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Stored; `evicted` lists entries dropped to make room.
    Queued { evicted: Vec<MessageId> },
    /// Already queued.
    Duplicate,
    /// The id was deleted recently and may not come back.
    Deleted,
    /// Every eviction candidate outranked the new message.
    Dropped,
}

impl EnqueueOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, EnqueueOutcome::Queued { .. })
    }
}

/// What happened after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { retry_after_ms: u64 },
    /// Out of attempts or expired; the message stays `Failed`.
    Exhausted,
}

/// Effect of cancelling a peer's queued work.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerCancellation {
    pub timers_cancelled: usize,
    /// Relay-partition entries whose only destination was the peer.
    pub relay_discarded: Vec<MessageId>,
}

struct QueueState {
    scheduler: RetryScheduler,
    tombstones: DeletedIdLog,
    favorites: HashSet<PeerId>,
    revision: u64,
}

/// Eviction rank within a partition: lower goes first. Terminal entries
/// before live ones, then lower priority, then older.
fn eviction_key(m: &QueuedMessage) -> (bool, u8, u64, MessageId) {
    (
        m.status().is_pending(),
        m.priority.to_byte(),
        m.queued_at_ms,
        m.id,
    )
}

/// Offline store with retry scheduling.
///
/// Every operation runs under one internal lock, so repository state,
/// timers and the revision counter move together.
pub struct OfflineMessageQueue {
    config: QueueConfig,
    policy: RetryPolicy,
    repository: Arc<dyn QueueRepository>,
    state: Mutex<QueueState>,
}

impl OfflineMessageQueue {
    pub fn new(config: QueueConfig, repository: Arc<dyn QueueRepository>) -> Self {
        let policy = RetryPolicy::new(config.retry.clone());
        let tombstones = DeletedIdLog::new(
            config.tombstone_capacity,
            config.tombstone_max_age_secs.saturating_mul(1000),
        );
        let scheduler = match repository.list() {
            Ok(stored) => resume_timers(&stored, policy.ack_timeout_ms()),
            Err(e) => {
                warn!(error = %e, "Failed to read stored messages, retry timers not resumed");
                RetryScheduler::new()
            }
        };
        Self {
            config,
            policy,
            repository,
            state: Mutex::new(QueueState {
                scheduler,
                tombstones,
                favorites: HashSet::new(),
                revision: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Mark a contact as favorite (higher per-contact cap) or not.
    pub fn set_favorite(&self, peer: &PeerId, favorite: bool) {
        let mut state = self.lock();
        if favorite {
            state.favorites.insert(peer.clone());
        } else {
            state.favorites.remove(peer);
        }
    }

    pub fn is_favorite(&self, peer: &PeerId) -> bool {
        self.lock().favorites.contains(peer)
    }

    /// Mutation counter; changes whenever the stored set or a status does.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Queue a directed envelope.
    pub fn enqueue(
        &self,
        message: &MeshRelayMessage,
        partition: QueuePartition,
        current_time_ms: u64,
    ) -> Result<EnqueueOutcome, QueueError> {
        let expiry_ms = self.policy.expiry_ms(message.metadata.priority);
        let queued = QueuedMessage::from_envelope(message, partition, expiry_ms, current_time_ms)?;
        self.enqueue_message(queued, current_time_ms)
    }

    /// Queue a prepared record.
    pub fn enqueue_message(
        &self,
        message: QueuedMessage,
        current_time_ms: u64,
    ) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.lock();

        if state.tombstones.contains(&message.id) {
            return Ok(EnqueueOutcome::Deleted);
        }
        if message.is_expired(current_time_ms) {
            return Ok(EnqueueOutcome::Dropped);
        }
        if self.repository.get(&message.id)?.is_some() {
            return Ok(EnqueueOutcome::Duplicate);
        }

        let stored = self.repository.list()?;
        let mut evicted: Vec<MessageId> = Vec::new();

        let contact_cap = if state.favorites.contains(&message.recipient) {
            self.config.favorite_contact_cap
        } else {
            self.config.contact_cap
        };
        if !self.make_room(
            &stored,
            &message,
            contact_cap,
            |m| m.recipient == message.recipient,
            &mut evicted,
        ) {
            debug!(
                message_id = %message.id,
                recipient = %message.recipient.short(),
                "Contact queue full, message dropped"
            );
            return Ok(EnqueueOutcome::Dropped);
        }

        let partition_cap = match message.partition {
            QueuePartition::Direct => self.config.direct_capacity(),
            QueuePartition::Relay => self.config.relay_capacity(),
        };
        if !self.make_room(
            &stored,
            &message,
            partition_cap,
            |m| m.partition == message.partition,
            &mut evicted,
        ) {
            debug!(
                message_id = %message.id,
                partition = ?message.partition,
                "Queue partition full, message dropped"
            );
            return Ok(EnqueueOutcome::Dropped);
        }

        for id in &evicted {
            self.repository.remove(id)?;
            state.scheduler.cancel(id);
        }
        if !evicted.is_empty() {
            info!(
                count = evicted.len(),
                recipient = %message.recipient.short(),
                "Evicted queued messages to admit new one"
            );
        }

        self.repository.upsert(&message)?;
        state.revision += 1;
        debug!(
            message_id = %message.id,
            recipient = %message.recipient.short(),
            priority = %message.priority,
            partition = ?message.partition,
            "Message queued"
        );
        Ok(EnqueueOutcome::Queued { evicted })
    }

    /// Pick evictions among `stored` entries matching `scope` until one
    /// slot is free under `cap`. Returns false if the new message itself
    /// would be the one to go.
    fn make_room(
        &self,
        stored: &[QueuedMessage],
        incoming: &QueuedMessage,
        cap: usize,
        scope: impl Fn(&QueuedMessage) -> bool,
        evicted: &mut Vec<MessageId>,
    ) -> bool {
        let scoped: Vec<&QueuedMessage> = stored
            .iter()
            .filter(|m| scope(m) && !evicted.contains(&m.id))
            .collect();
        let mut count = scoped.len();

        // relay entries never displace direct ones; a direct message may
        // displace relay entries of any priority
        let displaceable = |m: &QueuedMessage| {
            incoming.partition == QueuePartition::Direct && m.partition == QueuePartition::Relay
        };
        let mut candidates: Vec<&QueuedMessage> = scoped
            .into_iter()
            .filter(|m| {
                incoming.partition == QueuePartition::Direct
                    || m.partition == QueuePartition::Relay
            })
            .collect();
        candidates.sort_by_key(|m| (!displaceable(*m), eviction_key(*m)));

        let mut victims = candidates.into_iter();
        while count >= cap {
            let Some(victim) = victims.next() else {
                return false;
            };
            if !displaceable(victim)
                && victim.status().is_pending()
                && victim.priority > incoming.priority
            {
                return false;
            }
            evicted.push(victim.id);
            count -= 1;
        }
        true
    }

    pub fn get(&self, id: &MessageId) -> Result<Option<QueuedMessage>, QueueError> {
        self.repository.get(id)
    }

    pub fn contains(&self, id: &MessageId) -> Result<bool, QueueError> {
        Ok(self.repository.get(id)?.is_some())
    }

    /// Number of stored records, including failed ones awaiting expiry.
    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.repository.list()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Records for the given ids, skipping unknown ones.
    pub fn messages(&self, ids: &[MessageId]) -> Result<Vec<QueuedMessage>, QueueError> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(m) = self.repository.get(id)? {
                found.push(m);
            }
        }
        Ok(found)
    }

    /// Sorted ids of every message in the pending view.
    pub fn pending_ids(&self) -> Result<Vec<MessageId>, QueueError> {
        let mut ids: Vec<MessageId> = self
            .repository
            .list()?
            .into_iter()
            .filter(|m| m.status().is_pending())
            .map(|m| m.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Messages for `peer` ready to send now, most urgent then oldest first.
    pub fn sendable_for(&self, peer: &PeerId) -> Result<Vec<QueuedMessage>, QueueError> {
        let mut ready: Vec<QueuedMessage> = self
            .repository
            .list()?
            .into_iter()
            .filter(|m| m.recipient == *peer && m.status().is_sendable())
            .collect();
        sort_for_sending(&mut ready);
        Ok(ready)
    }

    /// Never-attempted messages, most urgent then oldest first.
    pub fn unsent(&self) -> Result<Vec<QueuedMessage>, QueueError> {
        let mut ready = self.repository.list_by_status(QueuedMessageStatus::Pending)?;
        sort_for_sending(&mut ready);
        Ok(ready)
    }

    fn load(&self, id: &MessageId) -> Result<QueuedMessage, QueueError> {
        self.repository
            .get(id)?
            .ok_or(QueueError::UnknownMessage(*id))
    }

    /// Start a delivery attempt.
    pub fn mark_sending(
        &self,
        id: &MessageId,
        current_time_ms: u64,
    ) -> Result<QueuedMessage, QueueError> {
        let mut state = self.lock();
        let mut message = self.load(id)?;
        message.transition(QueuedMessageStatus::Sending)?;
        message.attempts = message.attempts.saturating_add(1);
        message.last_attempt_at_ms = Some(current_time_ms);
        message.retry_after_ms = None;
        state.scheduler.cancel(id);
        self.repository.upsert(&message)?;
        state.revision += 1;
        Ok(message)
    }

    /// The transport accepted the message. With `await_ack` it waits for an
    /// acknowledgement until the ack timeout; otherwise it counts as
    /// delivered and leaves the queue.
    pub fn mark_sent(
        &self,
        id: &MessageId,
        await_ack: bool,
        current_time_ms: u64,
    ) -> Result<(), QueueError> {
        if !await_ack {
            return self.mark_delivered(id, current_time_ms);
        }
        let mut state = self.lock();
        let mut message = self.load(id)?;
        message.transition(QueuedMessageStatus::AwaitingAck)?;
        let deadline = current_time_ms.saturating_add(self.policy.ack_timeout_ms());
        message.retry_after_ms = Some(deadline);
        state.scheduler.schedule(*id, deadline, TimerKind::AckTimeout);
        self.repository.upsert(&message)?;
        state.revision += 1;
        Ok(())
    }

    /// Confirmed delivery: the record leaves the queue and is tombstoned.
    pub fn mark_delivered(&self, id: &MessageId, current_time_ms: u64) -> Result<(), QueueError> {
        let mut state = self.lock();
        let mut message = self.load(id)?;
        message.transition(QueuedMessageStatus::Delivered)?;
        self.forget(&mut state, id, current_time_ms)?;
        debug!(message_id = %id, attempts = message.attempts, "Queued message delivered");
        Ok(())
    }

    /// A failed attempt: schedule a retry with backoff, or give up.
    pub fn mark_failed(
        &self,
        id: &MessageId,
        current_time_ms: u64,
    ) -> Result<RetryDecision, QueueError> {
        let mut state = self.lock();
        self.fail_locked(&mut state, id, current_time_ms)
    }

    fn fail_locked(
        &self,
        state: &mut QueueState,
        id: &MessageId,
        current_time_ms: u64,
    ) -> Result<RetryDecision, QueueError> {
        let mut message = self.load(id)?;
        message.transition(QueuedMessageStatus::Failed)?;
        state.scheduler.cancel(id);
        state.revision += 1;

        if !self.policy.can_retry(message.attempts, message.priority)
            || message.is_expired(current_time_ms)
        {
            message.retry_after_ms = None;
            self.repository.upsert(&message)?;
            info!(
                message_id = %id,
                recipient = %message.recipient.short(),
                attempts = message.attempts,
                "Max delivery attempts exhausted, giving up on message"
            );
            return Ok(RetryDecision::Exhausted);
        }

        message.transition(QueuedMessageStatus::Retrying)?;
        let delay = self.policy.jittered_delay_ms(
            message.attempts,
            message.priority,
            &mut rand::thread_rng(),
        );
        let retry_after_ms = current_time_ms.saturating_add(delay);
        message.retry_after_ms = Some(retry_after_ms);
        state.scheduler.schedule(*id, retry_after_ms, TimerKind::Retry);
        self.repository.upsert(&message)?;
        debug!(
            message_id = %id,
            attempt = message.attempts,
            delay_ms = delay,
            "Scheduling delivery retry"
        );
        Ok(RetryDecision::Scheduled { retry_after_ms })
    }

    /// Push a due retry back when no route exists yet. Does not count as
    /// an attempt.
    pub fn defer(&self, id: &MessageId, current_time_ms: u64) -> Result<(), QueueError> {
        let mut state = self.lock();
        let mut message = self.load(id)?;
        if message.status() != QueuedMessageStatus::Retrying {
            return Ok(());
        }
        let delay = self.policy.jittered_delay_ms(
            message.attempts.max(1),
            message.priority,
            &mut rand::thread_rng(),
        );
        let retry_after_ms = current_time_ms.saturating_add(delay);
        message.retry_after_ms = Some(retry_after_ms);
        state.scheduler.schedule(*id, retry_after_ms, TimerKind::Retry);
        self.repository.upsert(&message)
    }

    /// Fire due timers. Ack timeouts count as failed attempts (and may
    /// schedule a retry); due retries are returned for resending.
    pub fn process_timers(&self, current_time_ms: u64) -> Result<Vec<QueuedMessage>, QueueError> {
        let mut state = self.lock();
        let fired = state.scheduler.due(current_time_ms);
        let mut ready = Vec::new();
        for (id, kind) in fired {
            match kind {
                TimerKind::AckTimeout => {
                    debug!(message_id = %id, "Ack timed out");
                    match self.fail_locked(&mut state, &id, current_time_ms) {
                        Ok(_) | Err(QueueError::UnknownMessage(_)) => {}
                        Err(QueueError::InvalidTransition { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                TimerKind::Retry => {
                    if let Some(m) = self.repository.get(&id)?
                        && m.status() == QueuedMessageStatus::Retrying
                    {
                        ready.push(m);
                    }
                }
            }
        }
        sort_for_sending(&mut ready);
        Ok(ready)
    }

    /// Earliest timer deadline.
    pub fn next_due(&self) -> Option<u64> {
        self.lock().scheduler.next_due()
    }

    /// An acknowledgement arrived: remove the message whatever its status.
    pub fn acknowledge(&self, id: &MessageId, current_time_ms: u64) -> Result<bool, QueueError> {
        let mut state = self.lock();
        let removed = self.forget(&mut state, id, current_time_ms)?;
        if removed {
            debug!(message_id = %id, "Acknowledged message purged from queue");
        }
        Ok(removed)
    }

    /// Intentional removal; the id is tombstoned.
    pub fn remove(
        &self,
        id: &MessageId,
        current_time_ms: u64,
    ) -> Result<Option<QueuedMessage>, QueueError> {
        let mut state = self.lock();
        let removed = self.repository.remove(id)?;
        state.scheduler.cancel(id);
        state.tombstones.record(*id, current_time_ms);
        if removed.is_some() {
            state.revision += 1;
        }
        Ok(removed)
    }

    fn forget(
        &self,
        state: &mut QueueState,
        id: &MessageId,
        current_time_ms: u64,
    ) -> Result<bool, QueueError> {
        let removed = self.repository.remove(id)?.is_some();
        state.scheduler.cancel(id);
        state.tombstones.record(*id, current_time_ms);
        if removed {
            state.revision += 1;
        }
        Ok(removed)
    }

    /// Latest expiry this node grants a message of `priority`.
    fn expiry_cap(&self, priority: MessagePriority, current_time_ms: u64) -> u64 {
        current_time_ms.saturating_add(self.policy.expiry_ms(priority))
    }

    /// Queue a copy handed over by a peer during sync.
    ///
    /// The record is rebuilt from the envelope into the relay partition;
    /// only the peer's expiry is kept, and never beyond the local lifetime
    /// for the envelope's priority.
    pub fn enqueue_transferred(
        &self,
        message: &MeshRelayMessage,
        expires_at_ms: u64,
        current_time_ms: u64,
    ) -> Result<EnqueueOutcome, QueueError> {
        let priority = message.metadata.priority;
        let mut queued = QueuedMessage::from_envelope(
            message,
            QueuePartition::Relay,
            self.policy.expiry_ms(priority),
            current_time_ms,
        )?;
        queued.expires_at_ms = expires_at_ms.min(self.expiry_cap(priority, current_time_ms));
        self.enqueue_message(queued, current_time_ms)
    }

    /// Take a synced copy's later expiry, capped at the local lifetime for
    /// the stored priority. Returns whether anything changed.
    pub fn refresh(
        &self,
        id: &MessageId,
        expires_at_ms: u64,
        current_time_ms: u64,
    ) -> Result<bool, QueueError> {
        let mut state = self.lock();
        let Some(mut message) = self.repository.get(id)? else {
            return Ok(false);
        };
        let expires_at_ms = expires_at_ms.min(self.expiry_cap(message.priority, current_time_ms));
        if expires_at_ms <= message.expires_at_ms {
            return Ok(false);
        }
        message.expires_at_ms = expires_at_ms;
        self.repository.upsert(&message)?;
        state.revision += 1;
        Ok(true)
    }

    pub fn is_deleted(&self, id: &MessageId) -> bool {
        self.lock().tombstones.contains(id)
    }

    /// Recently deleted ids, oldest first.
    pub fn deleted_ids(&self) -> Vec<MessageId> {
        self.lock().tombstones.ids()
    }

    /// Cancel timers for messages to `peer` and discard relay entries whose
    /// only destination was `peer`. Direct messages stay queued as
    /// `Pending` so they go out when the peer returns.
    pub fn cancel_peer(&self, peer: &PeerId) -> Result<PeerCancellation, QueueError> {
        let mut state = self.lock();
        let mut outcome = PeerCancellation::default();
        let mut reset = 0;
        for mut message in self.repository.list()? {
            if message.recipient != *peer {
                continue;
            }
            if state.scheduler.cancel(&message.id) {
                outcome.timers_cancelled += 1;
            }
            match message.partition {
                QueuePartition::Relay => {
                    self.repository.remove(&message.id)?;
                    outcome.relay_discarded.push(message.id);
                }
                QueuePartition::Direct => {
                    let status = message.status();
                    if status.is_pending() && status != QueuedMessageStatus::Pending {
                        message.reset_pending();
                        self.repository.upsert(&message)?;
                        reset += 1;
                    }
                }
            }
        }
        if outcome.timers_cancelled > 0 || !outcome.relay_discarded.is_empty() || reset > 0 {
            state.revision += 1;
            info!(
                peer = %peer.short(),
                timers = outcome.timers_cancelled,
                reset,
                relay_discarded = outcome.relay_discarded.len(),
                "Cancelled queued work for peer"
            );
        }
        Ok(outcome)
    }

    /// Remove every expired record regardless of status or attempts.
    pub fn purge_expired(&self, current_time_ms: u64) -> Result<Vec<MessageId>, QueueError> {
        let mut state = self.lock();
        let mut purged = Vec::new();
        for message in self.repository.list()? {
            if message.is_expired(current_time_ms) {
                self.repository.remove(&message.id)?;
                state.scheduler.cancel(&message.id);
                purged.push(message.id);
            }
        }
        if !purged.is_empty() {
            state.revision += 1;
            info!(count = purged.len(), "Purged expired queued messages");
        }
        purged.sort();
        Ok(purged)
    }

    /// Forget old deletion tombstones.
    pub fn prune_tombstones(&self, current_time_ms: u64) -> usize {
        self.lock().tombstones.prune(current_time_ms)
    }

    pub fn statistics(&self, current_time_ms: u64) -> Result<QueueStatistics, QueueError> {
        let state = self.lock();
        let mut stats = QueueStatistics {
            scheduled_timers: state.scheduler.len(),
            tombstones: state.tombstones.len(),
            revision: state.revision,
            ..Default::default()
        };
        for message in self.repository.list()? {
            stats.total += 1;
            match message.status() {
                QueuedMessageStatus::Pending => stats.pending += 1,
                QueuedMessageStatus::Sending => stats.sending += 1,
                QueuedMessageStatus::AwaitingAck => stats.awaiting_ack += 1,
                QueuedMessageStatus::Retrying => stats.retrying += 1,
                QueuedMessageStatus::Failed => stats.failed += 1,
                QueuedMessageStatus::Delivered => {}
            }
            match message.partition {
                QueuePartition::Direct => stats.direct += 1,
                QueuePartition::Relay => stats.relay += 1,
            }
            if message.status().is_pending() {
                let age = current_time_ms.saturating_sub(message.queued_at_ms);
                stats.oldest_pending_age_ms =
                    Some(stats.oldest_pending_age_ms.map_or(age, |a| a.max(age)));
            }
        }
        Ok(stats)
    }
}

/// Timers for records left mid-delivery by a previous run. An interrupted
/// send is treated like an unanswered one: it times out and counts as a
/// failed attempt.
fn resume_timers(stored: &[QueuedMessage], ack_timeout_ms: u64) -> RetryScheduler {
    let mut scheduler = RetryScheduler::new();
    for message in stored {
        let ack_deadline = || {
            message
                .last_attempt_at_ms
                .map_or(0, |at| at.saturating_add(ack_timeout_ms))
        };
        match message.status() {
            QueuedMessageStatus::AwaitingAck => scheduler.schedule(
                message.id,
                message.retry_after_ms.unwrap_or_else(ack_deadline),
                TimerKind::AckTimeout,
            ),
            QueuedMessageStatus::Sending => {
                scheduler.schedule(message.id, ack_deadline(), TimerKind::AckTimeout)
            }
            QueuedMessageStatus::Retrying => scheduler.schedule(
                message.id,
                message.retry_after_ms.unwrap_or(0),
                TimerKind::Retry,
            ),
            _ => {}
        }
    }
    if !scheduler.is_empty() {
        info!(count = scheduler.len(), "Resumed retry timers for stored messages");
    }
    scheduler
}

fn sort_for_sending(messages: &mut [QueuedMessage]) {
    messages.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.queued_at_ms.cmp(&b.queued_at_ms))
            .then(a.id.cmp(&b.id))
    });
}

impl std::fmt::Debug for OfflineMessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("OfflineMessageQueue")
            .field("revision", &state.revision)
            .field("timers", &state.scheduler.len())
            .finish()
    }
}
