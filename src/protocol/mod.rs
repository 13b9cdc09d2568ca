//! Mesh Relay Protocol
//!
//! Wire format of the relay envelope carried hop by hop across the mesh.
//! Every envelope names its original sender, optional final recipient
//! (absent for broadcast), a TTL and hop count, the path of relaying nodes
//! so far, and a content hash that is stable across hops and used for
//! duplicate suppression.
//!
//! Message bodies are a closed set of kinds (`MessageBody`) matched
//! exhaustively by the relay engine. Chat content may be end-to-end
//! encrypted with the Noise session between sender and recipient;
//! relays never need to read it.
//!
//! The radio link framing beneath these envelopes is not defined here.

mod envelope;
mod error;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use envelope::{
    MAX_CONTENT_SIZE, MAX_ROUTING_PATH, MeshRelayMessage, MessageBody, MessageContent,
    RelayMetadata, TopologyNeighbor,
};
pub use error::ProtocolError;

/// Protocol version for envelope compatibility.
pub const PROTOCOL_VERSION: u8 = 1;

/// Delivery priority of a message.
///
/// Ordered from least to most urgent, so `Urgent > Low`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MessagePriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl MessagePriority {
    /// All priorities, lowest first.
    pub const ALL: [MessagePriority; 4] = [
        MessagePriority::Low,
        MessagePriority::Normal,
        MessagePriority::High,
        MessagePriority::Urgent,
    ];

    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MessagePriority::Low),
            1 => Some(MessagePriority::Normal),
            2 => Some(MessagePriority::High),
            3 => Some(MessagePriority::Urgent),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Urgent => "urgent",
        };
        write!(f, "{}", name)
    }
}

/// Wire tag of a message body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Application chat payload.
    Chat = 0x01,
    /// Delivery acknowledgement for a chat message.
    Ack = 0x02,
    /// A node's direct neighbours and link qualities.
    TopologyAnnounce = 0x03,
}

impl MessageKind {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(MessageKind::Chat),
            0x02 => Some(MessageKind::Ack),
            0x03 => Some(MessageKind::TopologyAnnounce),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Chat => "Chat",
            MessageKind::Ack => "Ack",
            MessageKind::TopologyAnnounce => "TopologyAnnounce",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests;
