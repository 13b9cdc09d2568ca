//! Protocol error types.

use thiserror::Error;

/// Errors decoding or validating relay envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message kind: 0x{0:02x}")]
    InvalidMessageKind(u8),

    #[error("invalid priority: 0x{0:02x}")]
    InvalidPriority(u8),

    #[error("invalid content encoding: 0x{0:02x}")]
    InvalidContentEncoding(u8),

    #[error("message too short: expected at least {expected}, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("message too long: max {max}, got {got}")]
    MessageTooLong { max: usize, got: usize },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("message hash mismatch")]
    HashMismatch,

    #[error("hop count {hop_count} exceeds ttl {ttl}")]
    HopCountExceedsTtl { hop_count: u8, ttl: u8 },

    #[error("malformed message: {0}")]
    Malformed(String),
}
