//! Typed channels carrying frames and deliveries out of the relay engine.

use tokio::sync::mpsc;

use crate::identity::{MessageId, PeerId};
use crate::protocol::{MessageKind, MessagePriority};

/// An encoded envelope for the transport to send to one direct neighbour.
///
/// Fire-and-forget: the engine learns nothing about whether it arrived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Direct neighbour to hand the frame to.
    pub next_hop: PeerId,
    pub message_id: MessageId,
    pub kind: MessageKind,
    pub bytes: Vec<u8>,
}

/// A message addressed to this node, decrypted when it was encrypted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalDelivery {
    pub message_id: MessageId,
    /// Persistent identity of the sender where known.
    pub sender: PeerId,
    pub priority: MessagePriority,
    pub plaintext: Vec<u8>,
    pub was_encrypted: bool,
    pub broadcast: bool,
}

/// Channel sender for outbound frames.
pub type OutboundTx = mpsc::Sender<OutboundFrame>;

/// Channel receiver for outbound frames.
pub type OutboundRx = mpsc::Receiver<OutboundFrame>;

/// Channel sender for local deliveries.
pub type DeliveryTx = mpsc::Sender<LocalDelivery>;

/// Channel receiver for local deliveries.
pub type DeliveryRx = mpsc::Receiver<LocalDelivery>;

/// Engine-side ends.
#[derive(Clone, Debug)]
pub struct RelayChannels {
    pub outbound: OutboundTx,
    pub delivery: DeliveryTx,
}

/// Host-side ends.
#[derive(Debug)]
pub struct RelayReceivers {
    pub outbound: OutboundRx,
    pub delivery: DeliveryRx,
}

/// Create the engine's outbound and delivery channels with the given
/// buffer size each.
pub fn relay_channels(capacity: usize) -> (RelayChannels, RelayReceivers) {
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
    let (delivery_tx, delivery_rx) = mpsc::channel(capacity.max(1));
    (
        RelayChannels {
            outbound: outbound_tx,
            delivery: delivery_tx,
        },
        RelayReceivers {
            outbound: outbound_rx,
            delivery: delivery_rx,
        },
    )
}
