//! Offline Message Queue
//!
//! Durable store of messages whose recipient is not currently reachable,
//! with priority-aware retry. Capacity is split between a direct partition
//! (messages this node originated) and a relay partition (messages carried
//! for others) so relay traffic cannot starve direct messages. Each
//! recipient is additionally capped, with a higher cap for favorite
//! contacts. Over-cap admission evicts the lowest-priority, oldest entry;
//! it is never an error.
//!
//! Storage is delegated to a `QueueRepository`. Retry backoff is pure
//! arithmetic in `RetryPolicy`; deadlines live in `RetryScheduler` and are
//! polled by `OfflineMessageQueue::process_timers`.

mod message;
mod offline;
mod repository;
mod retry;
mod tombstones;

use thiserror::Error;

use crate::identity::MessageId;
use crate::protocol::ProtocolError;

pub use message::{QueuePartition, QueuedMessage, QueuedMessageStatus};
pub use offline::{EnqueueOutcome, OfflineMessageQueue, PeerCancellation, RetryDecision};
pub use repository::{InMemoryQueueRepository, QueueRepository};
pub use retry::{RetryPolicy, RetryScheduler, TimerKind};
pub use tombstones::DeletedIdLog;

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("repository error: {0}")]
    Repository(String),

    #[error("unknown message: {0}")]
    UnknownMessage(MessageId),

    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: MessageId,
        from: QueuedMessageStatus,
        to: QueuedMessageStatus,
    },

    #[error("message {0} has no recipient")]
    NoRecipient(MessageId),

    #[error("envelope error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Point-in-time queue counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    pub total: usize,
    pub pending: usize,
    pub sending: usize,
    pub awaiting_ack: usize,
    pub retrying: usize,
    pub failed: usize,
    pub direct: usize,
    pub relay: usize,
    pub scheduled_timers: usize,
    pub tombstones: usize,
    /// Age of the oldest message still in the pending view.
    pub oldest_pending_age_ms: Option<u64>,
    pub revision: u64,
}
