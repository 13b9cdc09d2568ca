//! Initiator and responder sides of queue sync.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{
    MergeCounts, QueueHash, SyncEntry, SyncError, SyncFrame, SyncOutcome, SyncPeer,
    SyncRateLimiter,
};
use crate::config::SyncConfig;
use crate::identity::{MessageId, PeerId};
use crate::queue::{EnqueueOutcome, OfflineMessageQueue, QueueError, QueuedMessage};

struct CachedHash {
    hash: QueueHash,
    revision: u64,
    computed_at_ms: u64,
}

struct SyncState {
    hash: Option<CachedHash>,
    /// Rounds we start.
    initiated: SyncRateLimiter,
    /// Rounds peers start with us.
    accepted: SyncRateLimiter,
    /// Responder rounds open for pushes, by deadline.
    open_rounds: HashMap<PeerId, u64>,
}

/// Reconciles the local offline queue with peers' queues.
pub struct QueueSyncCoordinator {
    config: SyncConfig,
    queue: Arc<OfflineMessageQueue>,
    state: Mutex<SyncState>,
}

fn hash_ids<'a>(ids: impl IntoIterator<Item = &'a MessageId>) -> QueueHash {
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
    }
    hasher.finalize().into()
}

impl QueueSyncCoordinator {
    pub fn new(config: SyncConfig, queue: Arc<OfflineMessageQueue>) -> Self {
        let min_interval_ms = config.min_interval_secs.saturating_mul(1000);
        let state = SyncState {
            hash: None,
            initiated: SyncRateLimiter::new(config.max_attempts_per_hour, min_interval_ms),
            accepted: SyncRateLimiter::new(config.max_attempts_per_hour, min_interval_ms),
            open_rounds: HashMap::new(),
        };
        Self {
            config,
            queue,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn batch_size(&self) -> usize {
        self.config.max_messages_per_frame.max(1)
    }

    fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.config.exchange_timeout_ms)
    }

    /// Hash of the pending view, reused until the queue changes or the
    /// cached value ages out.
    pub fn queue_hash(&self, current_time_ms: u64) -> Result<QueueHash, QueueError> {
        let revision = self.queue.revision();
        if let Some(cached) = &self.lock().hash
            && cached.revision == revision
            && current_time_ms.saturating_sub(cached.computed_at_ms) < self.config.hash_cache_ttl_ms
        {
            return Ok(cached.hash);
        }

        let hash = hash_ids(&self.queue.pending_ids()?);
        self.store_hash(hash, revision, current_time_ms);
        Ok(hash)
    }

    fn store_hash(&self, hash: QueueHash, revision: u64, current_time_ms: u64) {
        self.lock().hash = Some(CachedHash {
            hash,
            revision,
            computed_at_ms: current_time_ms,
        });
    }

    /// Pending view as digest entries sorted by id, with its hash.
    fn digest(&self, current_time_ms: u64) -> Result<(QueueHash, Vec<SyncEntry>), QueueError> {
        let revision = self.queue.revision();
        let ids = self.queue.pending_ids()?;
        let mut entries: Vec<SyncEntry> = self
            .queue
            .messages(&ids)?
            .into_iter()
            .filter(|m| m.status().is_pending())
            .map(|m| SyncEntry {
                id: m.id,
                expires_at_ms: m.expires_at_ms,
            })
            .collect();
        entries.sort_by_key(|e| e.id);
        let hash = hash_ids(entries.iter().map(|e| &e.id));
        self.store_hash(hash, revision, current_time_ms);
        Ok((hash, entries))
    }

    /// Bodies for `ids` still in the pending view.
    fn pending_bodies(&self, ids: &[MessageId]) -> Result<Vec<QueuedMessage>, QueueError> {
        Ok(self
            .queue
            .messages(ids)?
            .into_iter()
            .filter(|m| m.status().is_pending())
            .collect())
    }

    // === Initiator ===

    /// Run one sync round with `peer`. Never fails; every result is a
    /// `SyncOutcome`.
    pub async fn initiate_sync<P: SyncPeer>(&self, peer: &P, current_time_ms: u64) -> SyncOutcome {
        let remote = peer.peer_id().clone();
        if let Err(reason) = self.lock().initiated.try_acquire(&remote, current_time_ms) {
            debug!(peer = %remote.short(), reason = %reason, "Sync attempt rate limited");
            return SyncOutcome::RateLimited(reason);
        }

        let started = Instant::now();
        match self.run_round(peer, current_time_ms, started).await {
            Ok(outcome) => outcome,
            Err(SyncError::Timeout) => {
                warn!(
                    peer = %remote.short(),
                    timeout_ms = self.config.exchange_timeout_ms,
                    "Sync exchange timed out"
                );
                SyncOutcome::Timeout
            }
            Err(SyncError::RateLimited(reason)) => {
                debug!(peer = %remote.short(), reason = %reason, "Peer refused sync");
                SyncOutcome::RateLimited(reason)
            }
            Err(e) => {
                warn!(peer = %remote.short(), error = %e, "Sync failed");
                SyncOutcome::Error(e.to_string())
            }
        }
    }

    async fn exchange<P: SyncPeer>(&self, peer: &P, frame: SyncFrame) -> Result<SyncFrame, SyncError> {
        tokio::time::timeout(self.exchange_timeout(), peer.exchange(frame))
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    async fn run_round<P: SyncPeer>(
        &self,
        peer: &P,
        current_time_ms: u64,
        started: Instant,
    ) -> Result<SyncOutcome, SyncError> {
        let remote = peer.peer_id();
        let (local_hash, entries) = self.digest(current_time_ms)?;
        let request = SyncFrame::Request {
            queue_hash: local_hash,
            entries,
            deleted: self.queue.deleted_ids(),
        };

        let (remote_hash, want, offer) = match self.exchange(peer, request).await? {
            SyncFrame::Response {
                queue_hash,
                want,
                offer,
            } => (queue_hash, want, offer),
            other => return Err(SyncError::UnexpectedFrame(other.name())),
        };
        if remote_hash == local_hash {
            debug!(peer = %remote.short(), "Queues already in sync");
            return Ok(SyncOutcome::AlreadySynced);
        }

        let mut outgoing = self.pending_bodies(&want)?.into_iter();
        let mut fetch = offer
            .into_iter()
            .filter(|id| !self.queue.is_deleted(id))
            .collect::<Vec<_>>()
            .into_iter();

        let batch = self.batch_size();
        let mut totals = MergeCounts::default();
        let mut sent = 0;
        loop {
            let messages: Vec<QueuedMessage> = outgoing.by_ref().take(batch).collect();
            let fetch_batch: Vec<MessageId> = fetch.by_ref().take(batch).collect();
            if messages.is_empty() && fetch_batch.is_empty() {
                break;
            }
            let pushed = messages.len();
            let push = SyncFrame::Push {
                messages,
                fetch: fetch_batch,
            };
            let returned = match self.exchange(peer, push).await? {
                SyncFrame::PushAck { messages, .. } => messages,
                other => return Err(SyncError::UnexpectedFrame(other.name())),
            };
            sent += pushed;

            let merged = self.merge(returned, current_time_ms)?;
            totals.received += merged.received;
            totals.updated += merged.updated;
            totals.skipped += merged.skipped;
        }

        let final_hash = self.queue_hash(current_time_ms)?;
        let duration = started.elapsed();
        info!(
            peer = %remote.short(),
            received = totals.received,
            updated = totals.updated,
            skipped = totals.skipped,
            sent,
            duration_ms = duration.as_millis() as u64,
            "Queue sync complete"
        );
        Ok(SyncOutcome::Success {
            received: totals.received,
            updated: totals.updated,
            skipped: totals.skipped,
            sent,
            final_hash,
            duration,
        })
    }

    // === Responder ===

    /// Answer one frame from `from`.
    pub fn handle_frame(
        &self,
        from: &PeerId,
        frame: SyncFrame,
        current_time_ms: u64,
    ) -> Result<SyncFrame, SyncError> {
        match frame {
            SyncFrame::Request {
                queue_hash,
                entries,
                deleted,
            } => self.handle_request(from, queue_hash, &entries, &deleted, current_time_ms),
            SyncFrame::Push { messages, fetch } => {
                self.handle_push(from, messages, &fetch, current_time_ms)
            }
            other => Err(SyncError::UnexpectedFrame(other.name())),
        }
    }

    fn handle_request(
        &self,
        from: &PeerId,
        remote_hash: QueueHash,
        remote: &[SyncEntry],
        remote_deleted: &[MessageId],
        current_time_ms: u64,
    ) -> Result<SyncFrame, SyncError> {
        self.lock()
            .accepted
            .try_acquire(from, current_time_ms)
            .map_err(SyncError::RateLimited)?;

        let local_hash = self.queue_hash(current_time_ms)?;
        if local_hash == remote_hash {
            return Ok(SyncFrame::Response {
                queue_hash: local_hash,
                want: Vec::new(),
                offer: Vec::new(),
            });
        }

        let (local_hash, local) = self.digest(current_time_ms)?;
        let local_expiry: HashMap<MessageId, u64> =
            local.iter().map(|e| (e.id, e.expires_at_ms)).collect();
        let remote_expiry: HashMap<MessageId, u64> =
            remote.iter().map(|e| (e.id, e.expires_at_ms)).collect();
        let remote_deleted: HashSet<&MessageId> = remote_deleted.iter().collect();

        let want: Vec<MessageId> = remote
            .iter()
            .filter(|e| !self.queue.is_deleted(&e.id))
            .filter(|e| local_expiry.get(&e.id).is_none_or(|&ours| e.expires_at_ms > ours))
            .map(|e| e.id)
            .collect();
        let offer: Vec<MessageId> = local
            .iter()
            .filter(|e| !remote_deleted.contains(&e.id))
            .filter(|e| remote_expiry.get(&e.id).is_none_or(|&theirs| e.expires_at_ms > theirs))
            .map(|e| e.id)
            .collect();

        if !want.is_empty() || !offer.is_empty() {
            let deadline = current_time_ms.saturating_add(self.config.exchange_timeout_ms);
            self.lock().open_rounds.insert(from.clone(), deadline);
        }
        debug!(
            peer = %from.short(),
            want = want.len(),
            offer = offer.len(),
            "Sync request answered"
        );
        Ok(SyncFrame::Response {
            queue_hash: local_hash,
            want,
            offer,
        })
    }

    fn handle_push(
        &self,
        from: &PeerId,
        messages: Vec<QueuedMessage>,
        fetch: &[MessageId],
        current_time_ms: u64,
    ) -> Result<SyncFrame, SyncError> {
        {
            let mut state = self.lock();
            match state.open_rounds.get_mut(from) {
                Some(deadline) if current_time_ms <= *deadline => {
                    *deadline = current_time_ms.saturating_add(self.config.exchange_timeout_ms);
                }
                _ => {
                    state.open_rounds.remove(from);
                    return Err(SyncError::UnexpectedFrame("push without open round"));
                }
            }
        }
        let batch = self.batch_size();
        if messages.len() > batch || fetch.len() > batch {
            return Err(SyncError::UnexpectedFrame("push exceeds frame limit"));
        }

        let merged = self.merge(messages, current_time_ms)?;
        let returned = self.pending_bodies(fetch)?;
        Ok(SyncFrame::PushAck {
            received: merged.received,
            updated: merged.updated,
            skipped: merged.skipped,
            messages: returned,
        })
    }

    // === Merge ===

    /// Take transferred messages into the local queue.
    ///
    /// Deleted ids are skipped and known ids may have their expiry
    /// extended. New ones are rebuilt from their envelope into the relay
    /// partition; of the peer's record only the expiry is used, capped at
    /// the local lifetime.
    pub fn merge(
        &self,
        messages: Vec<QueuedMessage>,
        current_time_ms: u64,
    ) -> Result<MergeCounts, QueueError> {
        let mut counts = MergeCounts::default();
        for message in messages {
            if self.queue.is_deleted(&message.id) {
                debug!(message_id = %message.id, "Synced message was deleted here, skipping");
                counts.skipped += 1;
                continue;
            }
            let envelope = match message.message() {
                Ok(envelope) if envelope.original_message_id == message.id => envelope,
                _ => {
                    warn!(message_id = %message.id, "Synced message does not match its envelope");
                    counts.skipped += 1;
                    continue;
                }
            };
            if self.queue.contains(&message.id)? {
                if self
                    .queue
                    .refresh(&message.id, message.expires_at_ms, current_time_ms)?
                {
                    counts.updated += 1;
                } else {
                    counts.skipped += 1;
                }
                continue;
            }

            match self
                .queue
                .enqueue_transferred(&envelope, message.expires_at_ms, current_time_ms)
            {
                Ok(EnqueueOutcome::Queued { .. }) => counts.received += 1,
                Ok(_) => counts.skipped += 1,
                Err(QueueError::NoRecipient(id)) => {
                    warn!(message_id = %id, "Synced message has no recipient, skipping");
                    counts.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(counts)
    }

    // === Upkeep ===

    /// Drop idle rate-limit records and expired responder rounds.
    pub fn prune(&self, current_time_ms: u64) -> usize {
        let mut state = self.lock();
        let before = state.open_rounds.len();
        state
            .open_rounds
            .retain(|_, deadline| current_time_ms <= *deadline);
        let rounds = before - state.open_rounds.len();
        rounds + state.initiated.prune(current_time_ms) + state.accepted.prune(current_time_ms)
    }

    /// Forget all sync state for a removed peer.
    pub fn forget_peer(&self, peer: &PeerId) {
        let mut state = self.lock();
        state.open_rounds.remove(peer);
        state.initiated.forget(peer);
        state.accepted.forget(peer);
    }
}

impl std::fmt::Debug for QueueSyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("QueueSyncCoordinator")
            .field("open_rounds", &state.open_rounds.len())
            .field("peers", &state.accepted.len())
            .finish()
    }
}
