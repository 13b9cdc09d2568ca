//! Peer identifier used as the key for sessions, queues and topology.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::IdentityError;

/// Longest peer identifier accepted on the wire.
pub const MAX_PEER_ID_LEN: usize = 255;

/// Identifier of a mesh peer.
///
/// Holds either a persistent identity (hex of a 32-byte static key) or an
/// ephemeral session identifier. Ordering is lexicographic on the string
/// form, which routing uses to break score ties deterministically.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id from any non-empty string of at most 255 bytes.
    pub fn new(id: impl Into<String>) -> Result<Self, IdentityError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdentityError::InvalidPeerId("empty".into()));
        }
        if id.len() > MAX_PEER_ID_LEN {
            return Err(IdentityError::InvalidPeerId(format!(
                "length {} exceeds {}",
                id.len(),
                MAX_PEER_ID_LEN
            )));
        }
        Ok(Self(id))
    }

    /// Derive the persistent peer id for a static public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(hex::encode(public_key))
    }

    /// Decode the static public key if this id is a persistent identity.
    pub fn to_public_key(&self) -> Option<[u8; 32]> {
        let bytes = hex::decode(&self.0).ok()?;
        bytes.try_into().ok()
    }

    /// Return the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the id as bytes (its wire form).
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Short prefix for log output.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
