//! Noise XX Protocol for Peer Sessions
//!
//! Implements the Noise Protocol Framework XX pattern over X25519 for
//! mutually authenticated per-peer sessions. Neither side needs the other's
//! static key in advance: both are transmitted encrypted during the
//! handshake and confirmed by the DH operations that follow.
//!
//! ## Handshake Pattern
//!
//! ```text
//!   -> e                 (32 bytes)
//!   <- e, ee, s, es      (32 + 48 = 80 bytes)
//!   -> s, se             (48 bytes)
//! ```
//!
//! Handshake payloads are empty and omitted from the wire, so message sizes
//! are fixed. After message 3 both parties split the chaining key into two
//! transport ciphers; the initiator sends with the first.
//!
//! ## Transport
//!
//! Each direction has its own `CipherState` with a strictly monotonic
//! counter. A cipher operation is first captured as an owned `CipherJob`
//! (key, counter, input, associated data) so that it can run either inline
//! or on a blocking worker thread with identical output; the counter only
//! advances once the job succeeds. A failed decrypt therefore leaves the
//! receive counter untouched and the session usable.

mod handshake;
mod manager;
mod session;

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use std::fmt;
use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::identity::PeerId;

pub use handshake::HandshakeState;
pub use manager::{NoiseSessionManager, RekeyReason, SessionEvent, SessionState};
pub use session::NoiseSession;

/// Protocol name for Noise XX with X25519.
/// Exactly 32 bytes, so it is used directly as the initial hash.
pub(crate) const PROTOCOL_NAME: &[u8; 32] = b"Noise_XX_25519_ChaChaPoly_SHA256";

/// Prologue mixed into every handshake transcript.
pub(crate) const PROLOGUE: &[u8] = b"meshlink/1";

/// Maximum message size for noise transport messages.
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Size of the AEAD tag.
pub const TAG_SIZE: usize = 16;

/// Size of an X25519 public key.
pub const PUBKEY_SIZE: usize = 32;

/// Size of an encrypted static key (key + tag).
pub const ENCRYPTED_STATIC_SIZE: usize = PUBKEY_SIZE + TAG_SIZE;

/// Handshake message 1: ephemeral (32).
pub const HANDSHAKE_MSG1_SIZE: usize = PUBKEY_SIZE;

/// Handshake message 2: ephemeral (32) + encrypted static (48).
pub const HANDSHAKE_MSG2_SIZE: usize = PUBKEY_SIZE + ENCRYPTED_STATIC_SIZE;

/// Handshake message 3: encrypted static (48).
pub const HANDSHAKE_MSG3_SIZE: usize = ENCRYPTED_STATIC_SIZE;

/// Errors from Noise protocol operations.
#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("handshake not complete")]
    HandshakeNotComplete,

    #[error("wrong handshake state: expected {expected}, got {got}")]
    WrongState { expected: String, got: String },

    #[error("invalid handshake message size: expected {expected}, got {got}")]
    InvalidMessageSize { expected: usize, got: usize },

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("remote static key does not match peer id {0}")]
    PeerKeyMismatch(PeerId),

    #[error("handshake collision with {0}: keeping local initiator")]
    HandshakeCollision(PeerId),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("message too short: expected at least {expected}, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("nonce overflow")]
    NonceOverflow,

    #[error("no established session with {0}")]
    SessionNotEstablished(PeerId),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

impl NoiseError {
    /// Whether this is an AEAD authentication failure on received data.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            NoiseError::DecryptionFailed | NoiseError::MessageTooShort { .. }
        )
    }
}

/// Role in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeRole {
    /// We sent message 1.
    Initiator,
    /// They sent message 1.
    Responder,
}

impl fmt::Display for HandshakeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeRole::Initiator => write!(f, "initiator"),
            HandshakeRole::Responder => write!(f, "responder"),
        }
    }
}

/// Handshake state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// Ready to send/receive message 1.
    Initial,
    /// Message 1 sent/received, ready for message 2.
    Message1Done,
    /// Message 2 sent/received, ready for message 3.
    Message2Done,
    /// Handshake complete, ready for transport.
    Complete,
}

impl fmt::Display for HandshakeProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeProgress::Initial => write!(f, "initial"),
            HandshakeProgress::Message1Done => write!(f, "message1_done"),
            HandshakeProgress::Message2Done => write!(f, "message2_done"),
            HandshakeProgress::Complete => write!(f, "complete"),
        }
    }
}

/// Direction of a cipher job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherOp {
    Seal,
    Open,
}

/// A self-contained AEAD operation.
///
/// Owns everything it needs so it can be moved to a worker thread. Running
/// the same job anywhere yields the same bytes.
#[derive(Clone)]
pub struct CipherJob {
    op: CipherOp,
    key: [u8; 32],
    counter: u64,
    input: Vec<u8>,
    aad: Vec<u8>,
}

impl CipherJob {
    /// Build a job from raw parts.
    pub fn new(op: CipherOp, key: [u8; 32], counter: u64, input: Vec<u8>, aad: Vec<u8>) -> Self {
        Self {
            op,
            key,
            counter,
            input,
            aad,
        }
    }

    /// Operation direction.
    pub fn op(&self) -> CipherOp {
        self.op
    }

    /// Counter this job uses as its nonce.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Input length in bytes.
    pub fn len(&self) -> usize {
        self.input.len()
    }

    /// Whether the input is empty.
    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// Execute the operation.
    pub fn run(&self) -> Result<Vec<u8>, NoiseError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| match self.op {
            CipherOp::Seal => NoiseError::EncryptionFailed,
            CipherOp::Open => NoiseError::DecryptionFailed,
        })?;
        let nonce_bytes = counter_to_nonce(self.counter);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let payload = Payload {
            msg: &self.input,
            aad: &self.aad,
        };
        match self.op {
            CipherOp::Seal => cipher
                .encrypt(nonce, payload)
                .map_err(|_| NoiseError::EncryptionFailed),
            CipherOp::Open => cipher
                .decrypt(nonce, payload)
                .map_err(|_| NoiseError::DecryptionFailed),
        }
    }
}

impl fmt::Debug for CipherJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherJob")
            .field("op", &self.op)
            .field("counter", &self.counter)
            .field("len", &self.input.len())
            .field("aad_len", &self.aad.len())
            .field("key", &"[redacted]")
            .finish()
    }
}

/// Encode a counter as a 12-byte ChaCha20-Poly1305 nonce.
///
/// Noise uses an 8-byte little-endian counter with a 4-byte zero prefix.
pub fn counter_to_nonce(counter: u64) -> [u8; 12] {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce_bytes
}

/// Symmetric cipher state for one direction.
#[derive(Clone)]
pub struct CipherState {
    /// Encryption key (32 bytes).
    key: [u8; 32],
    /// Next nonce counter.
    nonce: u64,
    /// Whether this cipher has a valid key.
    has_key: bool,
}

impl CipherState {
    /// Create a new cipher state with the given key.
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key,
            nonce: 0,
            has_key: true,
        }
    }

    /// Create an empty cipher state (no key yet).
    pub(super) fn empty() -> Self {
        Self {
            key: [0u8; 32],
            nonce: 0,
            has_key: false,
        }
    }

    /// Initialize with a key, resetting the counter.
    pub(super) fn initialize_key(&mut self, key: [u8; 32]) {
        self.key = key;
        self.nonce = 0;
        self.has_key = true;
    }

    /// Capture an encryption at the current counter without advancing it.
    pub fn seal_job(&self, plaintext: &[u8], aad: &[u8]) -> Result<CipherJob, NoiseError> {
        if plaintext.len() > MAX_MESSAGE_SIZE - TAG_SIZE {
            return Err(NoiseError::MessageTooLarge {
                size: plaintext.len(),
                max: MAX_MESSAGE_SIZE - TAG_SIZE,
            });
        }
        self.check_counter()?;
        Ok(CipherJob::new(
            CipherOp::Seal,
            self.key,
            self.nonce,
            plaintext.to_vec(),
            aad.to_vec(),
        ))
    }

    /// Capture a decryption at the current counter without advancing it.
    pub fn open_job(&self, ciphertext: &[u8], aad: &[u8]) -> Result<CipherJob, NoiseError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(NoiseError::MessageTooShort {
                expected: TAG_SIZE,
                got: ciphertext.len(),
            });
        }
        self.check_counter()?;
        Ok(CipherJob::new(
            CipherOp::Open,
            self.key,
            self.nonce,
            ciphertext.to_vec(),
            aad.to_vec(),
        ))
    }

    /// Advance the counter after a job at the current counter succeeded.
    pub fn advance(&mut self) {
        self.nonce += 1;
    }

    /// Encrypt plaintext, returning ciphertext with appended tag.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.encrypt_with_aad(plaintext, &[])
    }

    /// Encrypt with Additional Authenticated Data.
    pub fn encrypt_with_aad(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if !self.has_key {
            return Ok(plaintext.to_vec());
        }
        let ciphertext = self.seal_job(plaintext, aad)?.run()?;
        self.advance();
        Ok(ciphertext)
    }

    /// Decrypt ciphertext (with appended tag), returning plaintext.
    ///
    /// The counter advances only on success.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.decrypt_with_aad(ciphertext, &[])
    }

    /// Decrypt with Additional Authenticated Data.
    pub fn decrypt_with_aad(&mut self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if !self.has_key {
            return Ok(ciphertext.to_vec());
        }
        let plaintext = self.open_job(ciphertext, aad)?.run()?;
        self.advance();
        Ok(plaintext)
    }

    fn check_counter(&self) -> Result<(), NoiseError> {
        // u64::MAX is reserved by Noise
        if self.nonce == u64::MAX {
            return Err(NoiseError::NonceOverflow);
        }
        Ok(())
    }

    /// Get the current nonce value.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Check if cipher has a key.
    pub fn has_key(&self) -> bool {
        self.has_key
    }
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherState")
            .field("nonce", &self.nonce)
            .field("has_key", &self.has_key)
            .field("key", &"[redacted]")
            .finish()
    }
}
