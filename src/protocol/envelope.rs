//! Relay envelope and its binary codec.
//!
//! ## Wire Format
//!
//! All integers little-endian. A peer id is `[len:1][utf8 bytes]`; an
//! absent recipient is encoded as a zero length.
//!
//! ```text
//! [version:1][kind:1][priority:1][ttl:1][hop_count:1]
//! [message_id:16][message_hash:32][relayed_at_ms:8]
//! [original_sender:peer][final_recipient:peer?]
//! [path_count:1][path peer ids...]
//! [body...]
//! ```
//!
//! Body by kind:
//!
//! ```text
//! Chat:             [encoding:1][len:4][content]
//! Ack:              [acked_message_id:16]
//! TopologyAnnounce: [count:1]([peer][quality:1])*
//! ```
//!
//! The message hash covers the kind, id, priority, endpoints and body, and
//! nothing that changes per hop, so every copy of a message carries the
//! same hash.

use sha2::{Digest, Sha256};

use super::{MessageKind, MessagePriority, PROTOCOL_VERSION, ProtocolError};
use crate::identity::{MESSAGE_ID_SIZE, MessageId, PeerId};

/// Largest chat content carried in one envelope.
pub const MAX_CONTENT_SIZE: usize = 64 * 1024;

/// Longest routing path recorded in an envelope.
pub const MAX_ROUTING_PATH: usize = 32;

/// Fixed header: version, kind, priority, ttl, hop_count, id, hash, relayed_at.
const FIXED_HEADER_SIZE: usize = 5 + MESSAGE_ID_SIZE + 32 + 8;

/// Chat content, either plaintext or end-to-end encrypted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageContent {
    Plain(Vec<u8>),
    /// Ciphertext under the sender→recipient Noise session.
    Encrypted(Vec<u8>),
}

impl MessageContent {
    fn encoding_byte(&self) -> u8 {
        match self {
            MessageContent::Plain(_) => 0x00,
            MessageContent::Encrypted(_) => 0x01,
        }
    }

    /// Raw bytes regardless of encoding.
    pub fn bytes(&self) -> &[u8] {
        match self {
            MessageContent::Plain(b) | MessageContent::Encrypted(b) => b,
        }
    }

    /// Whether the content is end-to-end encrypted.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, MessageContent::Encrypted(_))
    }
}

/// A neighbour entry in a topology announcement.
#[derive(Clone, Debug, PartialEq)]
pub struct TopologyNeighbor {
    pub peer: PeerId,
    /// Link quality in [0, 1]; carried with 1/255 resolution.
    pub quality: f64,
}

/// Message body: a closed set of kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageBody {
    Chat(MessageContent),
    Ack { acked: MessageId },
    TopologyAnnounce { neighbors: Vec<TopologyNeighbor> },
}

impl MessageBody {
    /// Wire tag for this body.
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Chat(_) => MessageKind::Chat,
            MessageBody::Ack { .. } => MessageKind::Ack,
            MessageBody::TopologyAnnounce { .. } => MessageKind::TopologyAnnounce,
        }
    }

    /// Approximate payload size, used by spam accounting.
    pub fn payload_len(&self) -> usize {
        match self {
            MessageBody::Chat(content) => content.bytes().len(),
            MessageBody::Ack { .. } => MESSAGE_ID_SIZE,
            MessageBody::TopologyAnnounce { neighbors } => neighbors
                .iter()
                .map(|n| n.peer.as_bytes().len() + 2)
                .sum(),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            MessageBody::Chat(content) => {
                buf.push(content.encoding_byte());
                let bytes = content.bytes();
                buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                buf.extend_from_slice(bytes);
            }
            MessageBody::Ack { acked } => {
                buf.extend_from_slice(acked.as_bytes());
            }
            MessageBody::TopologyAnnounce { neighbors } => {
                buf.push(neighbors.len() as u8);
                for neighbor in neighbors {
                    encode_peer(&neighbor.peer, buf);
                    let q = (neighbor.quality.clamp(0.0, 1.0) * 255.0).round() as u8;
                    buf.push(q);
                }
            }
        }
    }

    fn decode(kind: MessageKind, reader: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        match kind {
            MessageKind::Chat => {
                let encoding = reader.u8()?;
                let len = reader.u32()? as usize;
                if len > MAX_CONTENT_SIZE {
                    return Err(ProtocolError::MessageTooLong {
                        max: MAX_CONTENT_SIZE,
                        got: len,
                    });
                }
                let bytes = reader.bytes(len)?.to_vec();
                let content = match encoding {
                    0x00 => MessageContent::Plain(bytes),
                    0x01 => MessageContent::Encrypted(bytes),
                    other => return Err(ProtocolError::InvalidContentEncoding(other)),
                };
                Ok(MessageBody::Chat(content))
            }
            MessageKind::Ack => {
                let acked = MessageId::from_bytes(reader.array::<MESSAGE_ID_SIZE>()?);
                Ok(MessageBody::Ack { acked })
            }
            MessageKind::TopologyAnnounce => {
                let count = reader.u8()? as usize;
                let mut neighbors = Vec::with_capacity(count);
                for _ in 0..count {
                    let peer = reader.peer()?;
                    let quality = reader.u8()? as f64 / 255.0;
                    neighbors.push(TopologyNeighbor { peer, quality });
                }
                Ok(MessageBody::TopologyAnnounce { neighbors })
            }
        }
    }
}

/// Relay metadata carried with every envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct RelayMetadata {
    /// Maximum hops this message may traverse.
    pub ttl: u8,
    /// Hops already traversed.
    pub hop_count: u8,
    /// Nodes that have relayed this message, oldest first.
    pub routing_path: Vec<PeerId>,
    /// Content hash, stable across hops.
    pub message_hash: [u8; 32],
    pub priority: MessagePriority,
    pub original_sender: PeerId,
    /// `None` for broadcast.
    pub final_recipient: Option<PeerId>,
}

impl RelayMetadata {
    /// Whether another relay hop is allowed.
    pub fn can_relay(&self) -> bool {
        self.hop_count < self.ttl
    }

    /// Whether `peer` already appears on the routing path.
    pub fn has_visited(&self, peer: &PeerId) -> bool {
        self.routing_path.iter().any(|p| p == peer)
    }
}

/// In-flight relay envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshRelayMessage {
    pub original_message_id: MessageId,
    pub body: MessageBody,
    pub metadata: RelayMetadata,
    /// When this copy was handed to the transport (Unix ms).
    pub relayed_at_ms: u64,
}

impl MeshRelayMessage {
    /// Create a new message at its origin with a fresh id.
    pub fn originate(
        body: MessageBody,
        sender: PeerId,
        recipient: Option<PeerId>,
        priority: MessagePriority,
        ttl: u8,
        current_time_ms: u64,
    ) -> Self {
        Self::with_id(
            MessageId::generate(),
            body,
            sender,
            recipient,
            priority,
            ttl,
            current_time_ms,
        )
    }

    /// Create a new message at its origin with a given id.
    pub fn with_id(
        id: MessageId,
        body: MessageBody,
        sender: PeerId,
        recipient: Option<PeerId>,
        priority: MessagePriority,
        ttl: u8,
        current_time_ms: u64,
    ) -> Self {
        let message_hash =
            Self::compute_hash(&id, &body, &sender, recipient.as_ref(), priority);
        Self {
            original_message_id: id,
            body,
            metadata: RelayMetadata {
                ttl,
                hop_count: 0,
                routing_path: Vec::new(),
                message_hash,
                priority,
                original_sender: sender,
                final_recipient: recipient,
            },
            relayed_at_ms: current_time_ms,
        }
    }

    /// Snapshot for the next hop: hop count incremented, relayer appended.
    pub fn relayed_by(&self, relayer: &PeerId, current_time_ms: u64) -> Self {
        let mut next = self.clone();
        next.metadata.hop_count = next.metadata.hop_count.saturating_add(1);
        if next.metadata.routing_path.len() < MAX_ROUTING_PATH {
            next.metadata.routing_path.push(relayer.clone());
        }
        next.relayed_at_ms = current_time_ms;
        next
    }

    /// Message kind.
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Whether the message has no specific recipient.
    pub fn is_broadcast(&self) -> bool {
        self.metadata.final_recipient.is_none()
    }

    /// Compute the content hash over the hop-invariant fields.
    pub fn compute_hash(
        id: &MessageId,
        body: &MessageBody,
        sender: &PeerId,
        recipient: Option<&PeerId>,
        priority: MessagePriority,
    ) -> [u8; 32] {
        let mut body_bytes = Vec::new();
        body.encode(&mut body_bytes);

        let mut hasher = Sha256::new();
        hasher.update([body.kind().to_byte(), priority.to_byte()]);
        hasher.update(id.as_bytes());
        hasher.update([sender.as_bytes().len() as u8]);
        hasher.update(sender.as_bytes());
        match recipient {
            Some(r) => {
                hasher.update([r.as_bytes().len() as u8]);
                hasher.update(r.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update(&body_bytes);
        hasher.finalize().into()
    }

    /// Encode to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let meta = &self.metadata;
        let mut buf = Vec::with_capacity(FIXED_HEADER_SIZE + 128 + self.body.payload_len());
        buf.push(PROTOCOL_VERSION);
        buf.push(self.kind().to_byte());
        buf.push(meta.priority.to_byte());
        buf.push(meta.ttl);
        buf.push(meta.hop_count);
        buf.extend_from_slice(self.original_message_id.as_bytes());
        buf.extend_from_slice(&meta.message_hash);
        buf.extend_from_slice(&self.relayed_at_ms.to_le_bytes());
        encode_peer(&meta.original_sender, &mut buf);
        match &meta.final_recipient {
            Some(r) => encode_peer(r, &mut buf),
            None => buf.push(0),
        }
        buf.push(meta.routing_path.len() as u8);
        for hop in &meta.routing_path {
            encode_peer(hop, &mut buf);
        }
        self.body.encode(&mut buf);
        buf
    }

    /// Decode from wire format, verifying the content hash.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < FIXED_HEADER_SIZE {
            return Err(ProtocolError::MessageTooShort {
                expected: FIXED_HEADER_SIZE,
                got: data.len(),
            });
        }
        let mut reader = Reader::new(data);

        let version = reader.u8()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let kind_byte = reader.u8()?;
        let kind =
            MessageKind::from_byte(kind_byte).ok_or(ProtocolError::InvalidMessageKind(kind_byte))?;
        let priority_byte = reader.u8()?;
        let priority = MessagePriority::from_byte(priority_byte)
            .ok_or(ProtocolError::InvalidPriority(priority_byte))?;
        let ttl = reader.u8()?;
        let hop_count = reader.u8()?;
        if hop_count > ttl {
            return Err(ProtocolError::HopCountExceedsTtl { hop_count, ttl });
        }

        let id = MessageId::from_bytes(reader.array::<MESSAGE_ID_SIZE>()?);
        let message_hash = reader.array::<32>()?;
        let relayed_at_ms = reader.u64()?;

        let original_sender = reader.peer()?;
        let final_recipient = reader.optional_peer()?;

        let path_count = reader.u8()? as usize;
        if path_count > MAX_ROUTING_PATH {
            return Err(ProtocolError::Malformed(format!(
                "routing path of {} hops exceeds {}",
                path_count, MAX_ROUTING_PATH
            )));
        }
        let mut routing_path = Vec::with_capacity(path_count);
        for _ in 0..path_count {
            routing_path.push(reader.peer()?);
        }

        let body = MessageBody::decode(kind, &mut reader)?;
        if !reader.is_empty() {
            return Err(ProtocolError::Malformed(format!(
                "{} trailing bytes",
                reader.remaining()
            )));
        }

        let expected =
            Self::compute_hash(&id, &body, &original_sender, final_recipient.as_ref(), priority);
        if expected != message_hash {
            return Err(ProtocolError::HashMismatch);
        }

        Ok(Self {
            original_message_id: id,
            body,
            metadata: RelayMetadata {
                ttl,
                hop_count,
                routing_path,
                message_hash,
                priority,
                original_sender,
                final_recipient,
            },
            relayed_at_ms,
        })
    }
}

fn encode_peer(peer: &PeerId, buf: &mut Vec<u8>) {
    let bytes = peer.as_bytes();
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
}

/// Bounds-checked cursor over an input buffer.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::MessageTooShort {
                expected: self.pos + n,
                got: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.array::<8>()?))
    }

    fn optional_peer(&mut self) -> Result<Option<PeerId>, ProtocolError> {
        let len = self.u8()? as usize;
        if len == 0 {
            return Ok(None);
        }
        self.peer_body(len).map(Some)
    }

    fn peer(&mut self) -> Result<PeerId, ProtocolError> {
        let len = self.u8()? as usize;
        if len == 0 {
            return Err(ProtocolError::Malformed("empty peer id".into()));
        }
        self.peer_body(len)
    }

    fn peer_body(&mut self, len: usize) -> Result<PeerId, ProtocolError> {
        let bytes = self.bytes(len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::Malformed("peer id is not utf-8".into()))?;
        PeerId::new(s).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
