//! Mesh Relay Engine
//!
//! Every inbound envelope runs one ordered pipeline, stopping at the first
//! decisive step:
//!
//! 1. dedup against recently seen message hashes
//! 2. per-sender spam gate
//! 3. probabilistic relay gate (propagation only)
//! 4. recipient resolution against the local identity
//! 5. TTL check (relay eligibility only)
//! 6. local delivery, independent of the relay outcome
//! 7. next-hop selection: routing, then best direct neighbour, then queue
//! 8. relay dispatch with hop count incremented and path extended
//!
//! Failures on network input never leave the pipeline; they become
//! counters and log lines. Frames and deliveries leave the engine over the
//! typed channels made by `relay_channels`.

mod channels;
mod dedup;
mod engine;
mod probability;
mod spam;
mod stats;

use std::fmt;
use thiserror::Error;

use crate::identity::PeerId;
use crate::noise::NoiseError;
use crate::queue::QueueError;
use crate::routing::RoutingTick;

pub use channels::{
    DeliveryRx, DeliveryTx, LocalDelivery, OutboundFrame, OutboundRx, OutboundTx, RelayChannels,
    RelayReceivers, relay_channels,
};
pub use dedup::SeenMessageStore;
pub use engine::{MeshRelayEngine, spawn_maintenance};
pub use probability::RelayProbabilityCurve;
pub use spam::{SpamPrevention, SpamReason, SpamVerdict};
pub use stats::RelayStatistics;

/// Errors returned to local callers originating messages.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("content too large: {size} bytes (max {max})")]
    ContentTooLarge { size: usize, max: usize },

    #[error("encrypted messages need a recipient")]
    EncryptedBroadcast,

    #[error("noise error: {0}")]
    Noise(#[from] NoiseError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Why an inbound envelope was discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Duplicate,
    /// We originated it or already relayed it.
    Loop,
    /// Addressed elsewhere and out of hops.
    TtlExhausted,
    AuthenticationFailed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DropReason::Malformed => "malformed",
            DropReason::Duplicate => "duplicate",
            DropReason::Loop => "loop",
            DropReason::TtlExhausted => "ttl exhausted",
            DropReason::AuthenticationFailed => "authentication failed",
        };
        write!(f, "{}", name)
    }
}

/// What happened to the propagation side of a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Handed to these neighbours.
    Relayed(Vec<PeerId>),
    /// No next hop; stored for later.
    Queued,
    /// Lost the relay coin flip.
    ProbabilisticSkip,
    /// Out of hops.
    TtlExhausted,
    /// Addressed to us alone.
    NotForwarded,
    /// Broadcast with nobody left to send to.
    NoNeighbors,
}

/// Result of running the pipeline on one inbound envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    Dropped(DropReason),
    Blocked(SpamReason),
    Processed {
        delivered: bool,
        forward: ForwardOutcome,
    },
}

impl RelayOutcome {
    pub fn was_delivered(&self) -> bool {
        matches!(self, RelayOutcome::Processed { delivered: true, .. })
    }

    pub fn relayed_to(&self) -> &[PeerId] {
        match self {
            RelayOutcome::Processed {
                forward: ForwardOutcome::Relayed(hops),
                ..
            } => hops,
            _ => &[],
        }
    }
}

/// What one maintenance pass did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaintenanceReport {
    pub expired_messages: usize,
    pub tombstones_pruned: usize,
    pub dedup_pruned: usize,
    pub spam_pruned: usize,
    pub resent: usize,
    pub deferred: usize,
    /// Queued records found to be addressed to this node and consumed.
    pub delivered_from_queue: usize,
    pub routing: RoutingTick,
    /// Sessions past their rekey age.
    pub rekey_due: Vec<PeerId>,
}

#[cfg(test)]
mod tests;
