//! Queued message record and its status lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::QueueError;
use crate::identity::{MessageId, PeerId};
use crate::protocol::{MeshRelayMessage, MessagePriority, RelayMetadata};

/// Delivery status of a queued message.
///
/// ```text
/// Pending -> Sending -> AwaitingAck -> Delivered
///                  \          \-----> Failed
///                   \-> Delivered
///                   \-> Failed -> Retrying -> Sending
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedMessageStatus {
    /// Queued, never attempted.
    Pending,
    /// Handed to the transport, outcome unknown.
    Sending,
    /// Sent; waiting for the recipient's acknowledgement.
    AwaitingAck,
    /// Waiting on the retry timer between attempts.
    Retrying,
    /// Acknowledged or otherwise confirmed.
    Delivered,
    /// Last attempt failed.
    Failed,
}

impl QueuedMessageStatus {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: QueuedMessageStatus) -> bool {
        use QueuedMessageStatus::*;
        matches!(
            (self, next),
            (Pending, Sending)
                | (Sending, AwaitingAck)
                | (Sending, Delivered)
                | (Sending, Failed)
                | (AwaitingAck, Delivered)
                | (AwaitingAck, Failed)
                | (Failed, Retrying)
                | (Retrying, Sending)
        )
    }

    /// Whether the message still counts toward the pending view.
    pub fn is_pending(self) -> bool {
        !matches!(
            self,
            QueuedMessageStatus::Delivered | QueuedMessageStatus::Failed
        )
    }

    /// Whether the message can be handed to the transport now.
    pub fn is_sendable(self) -> bool {
        matches!(
            self,
            QueuedMessageStatus::Pending | QueuedMessageStatus::Retrying
        )
    }
}

impl fmt::Display for QueuedMessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueuedMessageStatus::Pending => "pending",
            QueuedMessageStatus::Sending => "sending",
            QueuedMessageStatus::AwaitingAck => "awaiting_ack",
            QueuedMessageStatus::Retrying => "retrying",
            QueuedMessageStatus::Delivered => "delivered",
            QueuedMessageStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Which capacity partition a message is charged to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePartition {
    /// Messages this node originated.
    Direct,
    /// Messages carried on behalf of other nodes.
    Relay,
}

/// A durable pending message.
///
/// The encoded relay envelope is stored as-is so a retry resends exactly
/// the bytes that were queued, and so sync can hand the record to a peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: MessageId,
    /// Conversation the message belongs to; the recipient id when the
    /// application supplies none.
    pub chat_id: String,
    pub recipient: PeerId,
    pub sender: PeerId,
    pub priority: MessagePriority,
    status: QueuedMessageStatus,
    /// Delivery attempts made so far.
    pub attempts: u32,
    pub partition: QueuePartition,
    pub queued_at_ms: u64,
    pub expires_at_ms: u64,
    pub last_attempt_at_ms: Option<u64>,
    /// When the next retry is due, while `Retrying` or `AwaitingAck`.
    pub retry_after_ms: Option<u64>,
    /// Encoded `MeshRelayMessage`.
    pub envelope: Vec<u8>,
}

impl QueuedMessage {
    /// Queue record for a directed envelope.
    pub fn from_envelope(
        message: &MeshRelayMessage,
        partition: QueuePartition,
        expiry_ms: u64,
        current_time_ms: u64,
    ) -> Result<Self, QueueError> {
        let recipient = message
            .metadata
            .final_recipient
            .clone()
            .ok_or(QueueError::NoRecipient(message.original_message_id))?;
        Ok(Self {
            id: message.original_message_id,
            chat_id: recipient.as_str().to_string(),
            recipient,
            sender: message.metadata.original_sender.clone(),
            priority: message.metadata.priority,
            status: QueuedMessageStatus::Pending,
            attempts: 0,
            partition,
            queued_at_ms: current_time_ms,
            expires_at_ms: current_time_ms.saturating_add(expiry_ms),
            last_attempt_at_ms: None,
            retry_after_ms: None,
            envelope: message.encode(),
        })
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = chat_id.into();
        self
    }

    pub fn status(&self) -> QueuedMessageStatus {
        self.status
    }

    /// Move to `next`, rejecting transitions outside the lifecycle.
    pub fn transition(&mut self, next: QueuedMessageStatus) -> Result<(), QueueError> {
        if !self.status.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Back to `Pending` after its retry timer was cancelled.
    pub(super) fn reset_pending(&mut self) {
        self.status = QueuedMessageStatus::Pending;
        self.retry_after_ms = None;
    }

    pub fn is_expired(&self, current_time_ms: u64) -> bool {
        current_time_ms >= self.expires_at_ms
    }

    /// Decode the stored envelope.
    pub fn message(&self) -> Result<MeshRelayMessage, QueueError> {
        Ok(MeshRelayMessage::decode(&self.envelope)?)
    }

    /// Relay metadata of the stored envelope, for relay-partition entries.
    pub fn relay_metadata(&self) -> Option<RelayMetadata> {
        match self.partition {
            QueuePartition::Relay => self.message().ok().map(|m| m.metadata),
            QueuePartition::Direct => None,
        }
    }
}
