use super::{CipherState, HandshakeRole, NoiseError};
use crate::config::NoiseConfig;
use crate::identity::PeerId;
use std::fmt;
use x25519_dalek::PublicKey;

/// Established transport session with one peer.
pub struct NoiseSession {
    role: HandshakeRole,
    send_cipher: CipherState,
    recv_cipher: CipherState,
    handshake_hash: [u8; 32],
    remote_static: PublicKey,
    established_at_ms: u64,
    /// Transport messages in both directions since establishment.
    message_count: u64,
    /// Set once a rekey has been signalled for this session.
    rekey_signalled: bool,
}

impl NoiseSession {
    pub(super) fn from_handshake(
        role: HandshakeRole,
        send_cipher: CipherState,
        recv_cipher: CipherState,
        handshake_hash: [u8; 32],
        remote_static: PublicKey,
        established_at_ms: u64,
    ) -> Self {
        Self {
            role,
            send_cipher,
            recv_cipher,
            handshake_hash,
            remote_static,
            established_at_ms,
            message_count: 0,
            rekey_signalled: false,
        }
    }

    /// Encrypt a transport message.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let ciphertext = self.send_cipher.encrypt(plaintext)?;
        self.message_count += 1;
        Ok(ciphertext)
    }

    /// Decrypt a transport message. A failure leaves the session unchanged.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let plaintext = self.recv_cipher.decrypt(ciphertext)?;
        self.message_count += 1;
        Ok(plaintext)
    }

    pub(super) fn send_cipher_mut(&mut self) -> &mut CipherState {
        &mut self.send_cipher
    }

    pub(super) fn recv_cipher_mut(&mut self) -> &mut CipherState {
        &mut self.recv_cipher
    }

    pub(super) fn record_message(&mut self) {
        self.message_count += 1;
    }

    /// Handshake hash for channel binding.
    pub fn handshake_hash(&self) -> &[u8; 32] {
        &self.handshake_hash
    }

    /// Remote static key authenticated by the handshake.
    pub fn remote_static(&self) -> &PublicKey {
        &self.remote_static
    }

    /// Persistent peer id of the remote static key.
    pub fn remote_peer_id(&self) -> PeerId {
        PeerId::from_public_key(self.remote_static.as_bytes())
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn send_nonce(&self) -> u64 {
        self.send_cipher.nonce()
    }

    pub fn recv_nonce(&self) -> u64 {
        self.recv_cipher.nonce()
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    pub fn established_at_ms(&self) -> u64 {
        self.established_at_ms
    }

    /// Whether the message-count threshold has been reached.
    pub fn message_limit_reached(&self, config: &NoiseConfig) -> bool {
        config.rekey_after_messages > 0 && self.message_count >= config.rekey_after_messages
    }

    /// Whether the session has outlived the rekey interval.
    pub fn age_limit_reached(&self, config: &NoiseConfig, current_time_ms: u64) -> bool {
        config.rekey_after_secs > 0
            && current_time_ms.saturating_sub(self.established_at_ms)
                >= config.rekey_after_secs * 1000
    }

    /// Mark a rekey as signalled; returns false if it already was.
    pub(super) fn signal_rekey(&mut self) -> bool {
        !std::mem::replace(&mut self.rekey_signalled, true)
    }
}

impl fmt::Debug for NoiseSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoiseSession")
            .field("role", &self.role)
            .field("send_nonce", &self.send_cipher.nonce())
            .field("recv_nonce", &self.recv_cipher.nonce())
            .field("message_count", &self.message_count)
            .field("established_at_ms", &self.established_at_ms)
            .finish()
    }
}
