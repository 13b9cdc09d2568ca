use super::{
    CipherState, ENCRYPTED_STATIC_SIZE, HANDSHAKE_MSG1_SIZE, HANDSHAKE_MSG2_SIZE,
    HANDSHAKE_MSG3_SIZE, HandshakeProgress, HandshakeRole, NoiseError, NoiseSession,
    PROTOCOL_NAME, PUBKEY_SIZE,
};
use crate::identity::StaticKeypair;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

/// Symmetric state during handshake.
///
/// Maintains the chaining key (ck), handshake hash (h), and current cipher.
struct SymmetricState {
    /// Chaining key for key derivation.
    ck: [u8; 32],
    /// Handshake hash for transcript binding.
    h: [u8; 32],
    /// Current cipher state for encrypting handshake payloads.
    cipher: CipherState,
}

impl SymmetricState {
    /// Initialize with the protocol name and mix in the prologue.
    fn initialize(prologue: &[u8]) -> Self {
        let h = *PROTOCOL_NAME;
        let mut state = Self {
            ck: h,
            h,
            cipher: CipherState::empty(),
        };
        state.mix_hash(prologue);
        state
    }

    /// Mix data into the handshake hash.
    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    /// Mix key material into the chaining key.
    fn mix_key(&mut self, input_key_material: &[u8]) {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck), input_key_material);
        let mut output = [0u8; 64];
        hk.expand(&[], &mut output)
            .expect("64 bytes is valid output length");

        self.ck.copy_from_slice(&output[..32]);

        let mut key = [0u8; 32];
        key.copy_from_slice(&output[32..64]);
        self.cipher.initialize_key(key);
    }

    /// Encrypt and mix into hash.
    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let ciphertext = self.cipher.encrypt_with_aad(plaintext, &self.h)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// Decrypt and mix ciphertext into hash.
    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let plaintext = self.cipher.decrypt_with_aad(ciphertext, &self.h)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Split into two cipher states for transport.
    fn split(&self) -> (CipherState, CipherState) {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck), &[]);
        let mut output = [0u8; 64];
        hk.expand(&[], &mut output)
            .expect("64 bytes is valid output length");

        let mut k1 = [0u8; 32];
        let mut k2 = [0u8; 32];
        k1.copy_from_slice(&output[..32]);
        k2.copy_from_slice(&output[32..64]);

        (CipherState::new(k1), CipherState::new(k2))
    }
}

/// Handshake state for Noise XX.
pub struct HandshakeState {
    role: HandshakeRole,
    progress: HandshakeProgress,
    symmetric: SymmetricState,
    static_keypair: StaticKeypair,
    /// Our ephemeral secret, generated when we send `e`.
    ephemeral: Option<StaticSecret>,
    /// Remote static key, learned from message 2 (initiator) or 3 (responder).
    remote_static: Option<PublicKey>,
    /// Remote ephemeral key, learned from message 1 or 2.
    remote_ephemeral: Option<PublicKey>,
}

impl HandshakeState {
    /// Create a new handshake as initiator.
    pub fn new_initiator(static_keypair: StaticKeypair, prologue: &[u8]) -> Self {
        Self::new(HandshakeRole::Initiator, static_keypair, prologue)
    }

    /// Create a new handshake as responder.
    pub fn new_responder(static_keypair: StaticKeypair, prologue: &[u8]) -> Self {
        Self::new(HandshakeRole::Responder, static_keypair, prologue)
    }

    fn new(role: HandshakeRole, static_keypair: StaticKeypair, prologue: &[u8]) -> Self {
        Self {
            role,
            progress: HandshakeProgress::Initial,
            symmetric: SymmetricState::initialize(prologue),
            static_keypair,
            ephemeral: None,
            remote_static: None,
            remote_ephemeral: None,
        }
    }

    /// Get our role.
    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Get current progress.
    pub fn progress(&self) -> HandshakeProgress {
        self.progress
    }

    /// Check if handshake is complete.
    pub fn is_complete(&self) -> bool {
        self.progress == HandshakeProgress::Complete
    }

    /// Get the remote static key once it has been received.
    pub fn remote_static(&self) -> Option<&PublicKey> {
        self.remote_static.as_ref()
    }

    /// Get the handshake hash (for channel binding, final after complete).
    pub fn handshake_hash(&self) -> [u8; 32] {
        self.symmetric.h
    }

    fn expect_state(&self, role: HandshakeRole, progress: HandshakeProgress) -> Result<(), NoiseError> {
        if self.role != role {
            return Err(NoiseError::WrongState {
                expected: role.to_string(),
                got: self.role.to_string(),
            });
        }
        if self.progress != progress {
            return Err(NoiseError::WrongState {
                expected: progress.to_string(),
                got: self.progress.to_string(),
            });
        }
        Ok(())
    }

    fn expect_len(message: &[u8], expected: usize) -> Result<(), NoiseError> {
        if message.len() != expected {
            return Err(NoiseError::InvalidMessageSize {
                expected,
                got: message.len(),
            });
        }
        Ok(())
    }

    /// Generate and send our ephemeral key, mixing it into the hash.
    fn write_ephemeral(&mut self, message: &mut Vec<u8>) -> StaticSecret {
        let secret = StaticSecret::random_from_rng(OsRng);
        let e_pub = PublicKey::from(&secret);
        message.extend_from_slice(e_pub.as_bytes());
        self.symmetric.mix_hash(e_pub.as_bytes());
        self.ephemeral = Some(secret.clone());
        secret
    }

    fn read_key(bytes: &[u8]) -> Result<PublicKey, NoiseError> {
        let arr: [u8; PUBKEY_SIZE] = bytes.try_into().map_err(|_| NoiseError::InvalidPublicKey)?;
        Ok(PublicKey::from(arr))
    }

    /// X25519 with rejection of low-order points.
    fn dh(secret: &StaticSecret, public: &PublicKey) -> Result<[u8; 32], NoiseError> {
        let shared = secret.diffie_hellman(public);
        if !shared.was_contributory() {
            return Err(NoiseError::InvalidPublicKey);
        }
        Ok(shared.to_bytes())
    }

    fn local_ephemeral(&self) -> Result<&StaticSecret, NoiseError> {
        self.ephemeral.as_ref().ok_or(NoiseError::WrongState {
            expected: "local ephemeral".to_string(),
            got: "none".to_string(),
        })
    }

    fn peer_ephemeral(&self) -> Result<PublicKey, NoiseError> {
        self.remote_ephemeral.ok_or(NoiseError::WrongState {
            expected: "remote ephemeral".to_string(),
            got: "none".to_string(),
        })
    }

    fn peer_static(&self) -> Result<PublicKey, NoiseError> {
        self.remote_static.ok_or(NoiseError::WrongState {
            expected: "remote static".to_string(),
            got: "none".to_string(),
        })
    }

    /// Write message 1 (initiator only): `e`.
    pub fn write_message_1(&mut self) -> Result<Vec<u8>, NoiseError> {
        self.expect_state(HandshakeRole::Initiator, HandshakeProgress::Initial)?;

        let mut message = Vec::with_capacity(HANDSHAKE_MSG1_SIZE);
        self.write_ephemeral(&mut message);

        self.progress = HandshakeProgress::Message1Done;
        Ok(message)
    }

    /// Read message 1 (responder only).
    pub fn read_message_1(&mut self, message: &[u8]) -> Result<(), NoiseError> {
        self.expect_state(HandshakeRole::Responder, HandshakeProgress::Initial)?;
        Self::expect_len(message, HANDSHAKE_MSG1_SIZE)?;

        // -> e
        let re = Self::read_key(message)?;
        self.symmetric.mix_hash(message);
        self.remote_ephemeral = Some(re);

        self.progress = HandshakeProgress::Message1Done;
        Ok(())
    }

    /// Write message 2 (responder only): `e, ee, s, es`.
    pub fn write_message_2(&mut self) -> Result<Vec<u8>, NoiseError> {
        self.expect_state(HandshakeRole::Responder, HandshakeProgress::Message1Done)?;
        let re = self.peer_ephemeral()?;

        let mut message = Vec::with_capacity(HANDSHAKE_MSG2_SIZE);

        // <- e
        let e = self.write_ephemeral(&mut message);

        // <- ee
        let ee = Self::dh(&e, &re)?;
        self.symmetric.mix_key(&ee);

        // <- s
        let our_static = self.static_keypair.public_bytes();
        let encrypted_static = self.symmetric.encrypt_and_hash(&our_static)?;
        debug_assert_eq!(encrypted_static.len(), ENCRYPTED_STATIC_SIZE);
        message.extend_from_slice(&encrypted_static);

        // <- es: responder's static with initiator's ephemeral
        let es = Self::dh(self.static_keypair.secret(), &re)?;
        self.symmetric.mix_key(&es);

        self.progress = HandshakeProgress::Message2Done;
        Ok(message)
    }

    /// Read message 2 (initiator only), learning the responder's identity.
    pub fn read_message_2(&mut self, message: &[u8]) -> Result<(), NoiseError> {
        self.expect_state(HandshakeRole::Initiator, HandshakeProgress::Message1Done)?;
        Self::expect_len(message, HANDSHAKE_MSG2_SIZE)?;

        // <- e
        let e_pub = &message[..PUBKEY_SIZE];
        let re = Self::read_key(e_pub)?;
        self.symmetric.mix_hash(e_pub);
        self.remote_ephemeral = Some(re);

        // <- ee
        let ee = Self::dh(self.local_ephemeral()?, &re)?;
        self.symmetric.mix_key(&ee);

        // <- s
        let decrypted_static = self.symmetric.decrypt_and_hash(&message[PUBKEY_SIZE..])?;
        let rs = Self::read_key(&decrypted_static)?;
        self.remote_static = Some(rs);

        // <- es: our ephemeral with responder's static
        let es = Self::dh(self.local_ephemeral()?, &rs)?;
        self.symmetric.mix_key(&es);

        self.progress = HandshakeProgress::Message2Done;
        Ok(())
    }

    /// Write message 3 (initiator only): `s, se`.
    pub fn write_message_3(&mut self) -> Result<Vec<u8>, NoiseError> {
        self.expect_state(HandshakeRole::Initiator, HandshakeProgress::Message2Done)?;
        let re = self.peer_ephemeral()?;

        // -> s
        let our_static = self.static_keypair.public_bytes();
        let message = self.symmetric.encrypt_and_hash(&our_static)?;
        debug_assert_eq!(message.len(), HANDSHAKE_MSG3_SIZE);

        // -> se: our static with responder's ephemeral
        let se = Self::dh(self.static_keypair.secret(), &re)?;
        self.symmetric.mix_key(&se);

        self.progress = HandshakeProgress::Complete;
        Ok(message)
    }

    /// Read message 3 (responder only), learning the initiator's identity.
    pub fn read_message_3(&mut self, message: &[u8]) -> Result<(), NoiseError> {
        self.expect_state(HandshakeRole::Responder, HandshakeProgress::Message2Done)?;
        Self::expect_len(message, HANDSHAKE_MSG3_SIZE)?;

        // -> s
        let decrypted_static = self.symmetric.decrypt_and_hash(message)?;
        let rs = Self::read_key(&decrypted_static)?;
        self.remote_static = Some(rs);

        // -> se: our ephemeral with initiator's static
        let se = Self::dh(self.local_ephemeral()?, &rs)?;
        self.symmetric.mix_key(&se);

        self.progress = HandshakeProgress::Complete;
        Ok(())
    }

    /// Complete the handshake and return a NoiseSession.
    pub fn into_session(self, established_at_ms: u64) -> Result<NoiseSession, NoiseError> {
        if !self.is_complete() {
            return Err(NoiseError::HandshakeNotComplete);
        }
        let remote_static = self.peer_static()?;
        let (c1, c2) = self.symmetric.split();

        // Initiator sends with c1, receives with c2
        let (send_cipher, recv_cipher) = match self.role {
            HandshakeRole::Initiator => (c1, c2),
            HandshakeRole::Responder => (c2, c1),
        };

        Ok(NoiseSession::from_handshake(
            self.role,
            send_cipher,
            recv_cipher,
            self.symmetric.h,
            remote_static,
            established_at_ms,
        ))
    }
}

impl fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeState")
            .field("role", &self.role)
            .field("progress", &self.progress)
            .field("has_ephemeral", &self.ephemeral.is_some())
            .field("has_remote_static", &self.remote_static.is_some())
            .field("has_remote_ephemeral", &self.remote_ephemeral.is_some())
            .finish()
    }
}
