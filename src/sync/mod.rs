//! Queue Synchronization
//!
//! Two peers reconcile their offline queues so messages held by one can be
//! carried by the other. A round starts with a digest of the pending view
//! and a hash over its sorted ids; equal hashes end the round at once.
//! Otherwise only the difference moves: ids one side lacks, or holds with
//! an earlier expiry, are pushed in bounded batches, and the reply to each
//! batch carries the messages the initiator lacks.
//!
//! Ids in the recently-deleted log are never taken back in, so a peer that
//! still holds a deleted message cannot resurrect it.

mod coordinator;
mod rate_limit;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::identity::{MessageId, PeerId};
use crate::queue::{QueueError, QueuedMessage};

pub use coordinator::QueueSyncCoordinator;
pub use rate_limit::{RateLimitReason, SyncRateLimiter};

/// SHA-256 over the sorted pending ids.
pub type QueueHash = [u8; 32];

/// Errors from one sync exchange.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("rate limited: {0}")]
    RateLimited(RateLimitReason),

    #[error("exchange timed out")]
    Timeout,

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Per-message digest entry: enough to decide whether the body must move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEntry {
    pub id: MessageId,
    pub expires_at_ms: u64,
}

/// Frames exchanged by the initiator and the responder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncFrame {
    /// Initiator's digest of its pending view.
    Request {
        queue_hash: QueueHash,
        entries: Vec<SyncEntry>,
        /// Recently deleted ids; the responder will not offer them.
        deleted: Vec<MessageId>,
    },
    /// Responder's digest comparison.
    Response {
        queue_hash: QueueHash,
        /// Ids the responder lacks or holds with an earlier expiry.
        want: Vec<MessageId>,
        /// Ids the initiator lacks or holds with an earlier expiry.
        offer: Vec<MessageId>,
    },
    /// A batch of bodies for the responder, plus offered ids to fetch back.
    Push {
        messages: Vec<QueuedMessage>,
        fetch: Vec<MessageId>,
    },
    /// Merge result for a `Push`, with the fetched bodies.
    PushAck {
        received: usize,
        updated: usize,
        skipped: usize,
        messages: Vec<QueuedMessage>,
    },
}

impl SyncFrame {
    pub fn name(&self) -> &'static str {
        match self {
            SyncFrame::Request { .. } => "request",
            SyncFrame::Response { .. } => "response",
            SyncFrame::Push { .. } => "push",
            SyncFrame::PushAck { .. } => "push_ack",
        }
    }
}

/// The remote side of a sync round: sends one frame, returns the reply.
pub trait SyncPeer: Send + Sync {
    /// Id of the remote peer.
    fn peer_id(&self) -> &PeerId;

    fn exchange(
        &self,
        frame: SyncFrame,
    ) -> impl Future<Output = Result<SyncFrame, SyncError>> + Send;
}

/// Result of one sync round, always returned as a value.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncOutcome {
    Success {
        /// New messages taken into the local queue.
        received: usize,
        /// Local copies whose expiry was extended.
        updated: usize,
        /// Transferred messages not taken in (deleted, expired, duplicate
        /// or refused by capacity).
        skipped: usize,
        /// Messages handed to the peer.
        sent: usize,
        /// Local queue hash after the merge.
        final_hash: QueueHash,
        duration: Duration,
    },
    AlreadySynced,
    RateLimited(RateLimitReason),
    Timeout,
    Error(String),
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success { .. } | SyncOutcome::AlreadySynced)
    }
}

/// Counts from merging transferred messages into a queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub received: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[cfg(test)]
mod tests;
