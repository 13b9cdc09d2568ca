//! Mesh Identity
//!
//! Peers are named by a `PeerId`: either the hex encoding of their long-term
//! X25519 static key (persistent identity) or an opaque per-session ephemeral
//! identifier used for unlinkable routing. Messages are named by a random
//! 16-byte `MessageId`.
//!
//! Contact and identity directory management lives outside this crate; the
//! relay engine only consumes the narrow `IdentityResolver` contract.

mod keypair;
mod local;
mod message_id;
mod peer_id;

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use keypair::StaticKeypair;
pub use local::{IdentityResolver, LocalIdentity, RecipientMatch};
pub use message_id::{MESSAGE_ID_SIZE, MessageId};
pub use peer_id::{MAX_PEER_ID_LEN, PeerId};

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid message id length: expected {MESSAGE_ID_SIZE}, got {0}")]
    InvalidMessageIdLength(usize),

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
}

/// Current wall-clock time in Unix milliseconds.
///
/// Components that expire state take the time as a parameter; this is the
/// production source for it.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
