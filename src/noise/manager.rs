//! Per-peer handshake and transport session management.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use super::{
    HANDSHAKE_MSG1_SIZE, HandshakeProgress, HandshakeRole, HandshakeState, NoiseError,
    NoiseSession, PROLOGUE,
};
use crate::config::NoiseConfig;
use crate::dispatch::AdaptiveCipherDispatcher;
use crate::identity::{PeerId, StaticKeypair, now_ms};

/// Externally visible state of a peer's session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Established,
    /// Torn down after an error; observed only by operations already in flight.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => write!(f, "uninitialized"),
            SessionState::Handshaking => write!(f, "handshaking"),
            SessionState::Established => write!(f, "established"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Why a rekey became due.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RekeyReason {
    MessageCount,
    Age,
}

/// Session lifecycle notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Established {
        peer: PeerId,
        role: HandshakeRole,
        handshake_hash: [u8; 32],
    },
    /// The host should start a fresh handshake with `rekey`.
    RekeyDue { peer: PeerId, reason: RekeyReason },
    Failed { peer: PeerId, error: String },
    Removed { peer: PeerId },
}

enum SlotState {
    Handshaking(Box<HandshakeState>),
    Established(NoiseSession),
    /// Superseded, removed or failed.
    Closed,
}

impl SlotState {
    fn public_state(&self) -> SessionState {
        match self {
            SlotState::Handshaking(_) => SessionState::Handshaking,
            SlotState::Established(_) => SessionState::Established,
            SlotState::Closed => SessionState::Failed,
        }
    }
}

/// Result of feeding one handshake message to a slot.
enum Step {
    Continue(SlotState, Option<Vec<u8>>),
    /// Simultaneous initiation that we win; the slot is unchanged.
    Collision(SlotState),
}

type Slot = Arc<Mutex<SlotState>>;

/// Owns every peer's Noise session.
///
/// Operations for one peer are serialized by that peer's async mutex, so
/// nonce use is strictly sequential even when a cipher job is awaited
/// off-thread. Different peers proceed independently.
pub struct NoiseSessionManager {
    local: StaticKeypair,
    local_id: PeerId,
    config: NoiseConfig,
    dispatcher: Arc<AdaptiveCipherDispatcher>,
    peers: RwLock<HashMap<PeerId, Slot>>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl NoiseSessionManager {
    pub fn new(
        local: StaticKeypair,
        config: NoiseConfig,
        dispatcher: Arc<AdaptiveCipherDispatcher>,
    ) -> Self {
        let local_id = local.peer_id();
        Self {
            local,
            local_id,
            config,
            dispatcher,
            peers: RwLock::new(HashMap::new()),
            events: None,
        }
    }

    /// Deliver lifecycle events to `sender`.
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Our persistent peer id.
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn dispatcher(&self) -> &Arc<AdaptiveCipherDispatcher> {
        &self.dispatcher
    }

    fn read_peers(&self) -> RwLockReadGuard<'_, HashMap<PeerId, Slot>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_peers(&self) -> RwLockWriteGuard<'_, HashMap<PeerId, Slot>> {
        self.peers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, peer: &PeerId) -> Option<Slot> {
        self.read_peers().get(peer).cloned()
    }

    fn slot_or_insert(&self, peer: &PeerId) -> Slot {
        self.write_peers()
            .entry(peer.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SlotState::Closed)))
            .clone()
    }

    /// Remove `slot` from the table if it is still the current one.
    fn forget(&self, peer: &PeerId, slot: &Slot) {
        let mut peers = self.write_peers();
        if peers.get(peer).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            peers.remove(peer);
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events
            && tx.send(event).is_err()
        {
            debug!("Session event receiver dropped");
        }
    }

    /// Start a handshake with `peer`, returning message 1 (32 bytes).
    ///
    /// Any existing session with the peer is torn down first.
    pub async fn initiate_handshake(&self, peer: &PeerId) -> Result<Vec<u8>, NoiseError> {
        let mut handshake = HandshakeState::new_initiator(self.local.clone(), PROLOGUE);
        let msg1 = handshake.write_message_1()?;

        let slot = Arc::new(Mutex::new(SlotState::Handshaking(Box::new(handshake))));
        let previous = self.write_peers().insert(peer.clone(), slot);
        if let Some(previous) = previous {
            let mut old = previous.lock().await;
            if matches!(*old, SlotState::Established(_)) {
                debug!(peer = %peer.short(), "Superseding established session");
            }
            *old = SlotState::Closed;
        }

        debug!(peer = %peer.short(), bytes = msg1.len(), "Sent handshake message 1");
        Ok(msg1)
    }

    /// Start a fresh handshake to replace the current session.
    pub async fn rekey(&self, peer: &PeerId) -> Result<Vec<u8>, NoiseError> {
        info!(peer = %peer.short(), "Rekeying session");
        self.initiate_handshake(peer).await
    }

    /// Feed a handshake message from `peer`.
    ///
    /// Returns the reply to send while the handshake continues, and `None`
    /// once it completes on this side. Any error other than a collision
    /// tears the session down; it is never retried automatically.
    pub async fn process_handshake_message(
        &self,
        peer: &PeerId,
        message: &[u8],
    ) -> Result<Option<Vec<u8>>, NoiseError> {
        let slot = self.slot_or_insert(peer);
        let mut guard = slot.lock().await;
        let state = std::mem::replace(&mut *guard, SlotState::Closed);

        match self.step(peer, state, message) {
            Ok(Step::Continue(next, reply)) => {
                *guard = next;
                Ok(reply)
            }
            Ok(Step::Collision(unchanged)) => {
                *guard = unchanged;
                debug!(peer = %peer.short(), "Ignoring colliding handshake message 1");
                Err(NoiseError::HandshakeCollision(peer.clone()))
            }
            Err(e) => {
                drop(guard);
                self.forget(peer, &slot);
                warn!(peer = %peer.short(), error = %e, "Handshake failed, session dropped");
                self.emit(SessionEvent::Failed {
                    peer: peer.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn step(&self, peer: &PeerId, state: SlotState, message: &[u8]) -> Result<Step, NoiseError> {
        let mut handshake = match state {
            SlotState::Handshaking(handshake) => handshake,
            SlotState::Established(_) | SlotState::Closed => return self.respond(peer, message),
        };

        match (handshake.role(), handshake.progress()) {
            (HandshakeRole::Initiator, HandshakeProgress::Message1Done)
                if message.len() == HANDSHAKE_MSG1_SIZE =>
            {
                // Both sides initiated; the lower peer id keeps its initiator.
                if self.local_id < *peer {
                    return Ok(Step::Collision(SlotState::Handshaking(handshake)));
                }
                debug!(peer = %peer.short(), "Handshake collision, yielding to remote initiator");
                self.respond(peer, message)
            }
            (HandshakeRole::Initiator, HandshakeProgress::Message1Done) => {
                handshake.read_message_2(message)?;
                let msg3 = handshake.write_message_3()?;
                let session = self.finish(peer, *handshake)?;
                Ok(Step::Continue(SlotState::Established(session), Some(msg3)))
            }
            (HandshakeRole::Responder, HandshakeProgress::Message2Done)
                if message.len() == HANDSHAKE_MSG1_SIZE =>
            {
                debug!(peer = %peer.short(), "Peer restarted handshake");
                self.respond(peer, message)
            }
            (HandshakeRole::Responder, HandshakeProgress::Message2Done) => {
                handshake.read_message_3(message)?;
                let session = self.finish(peer, *handshake)?;
                Ok(Step::Continue(SlotState::Established(session), None))
            }
            (role, progress) => Err(NoiseError::WrongState {
                expected: "awaiting handshake message".to_string(),
                got: format!("{} {}", role, progress),
            }),
        }
    }

    /// Answer message 1 as responder with message 2.
    fn respond(&self, peer: &PeerId, message: &[u8]) -> Result<Step, NoiseError> {
        let mut handshake = HandshakeState::new_responder(self.local.clone(), PROLOGUE);
        handshake.read_message_1(message)?;
        let msg2 = handshake.write_message_2()?;
        debug!(peer = %peer.short(), bytes = msg2.len(), "Sent handshake message 2");
        Ok(Step::Continue(
            SlotState::Handshaking(Box::new(handshake)),
            Some(msg2),
        ))
    }

    fn finish(&self, peer: &PeerId, handshake: HandshakeState) -> Result<NoiseSession, NoiseError> {
        // A peer named by its public key must have presented that key.
        if let Some(expected) = peer.to_public_key()
            && handshake.remote_static().map(|k| k.to_bytes()) != Some(expected)
        {
            return Err(NoiseError::PeerKeyMismatch(peer.clone()));
        }

        let session = handshake.into_session(now_ms())?;
        info!(
            peer = %peer.short(),
            role = %session.role(),
            "Noise session established"
        );
        self.emit(SessionEvent::Established {
            peer: peer.clone(),
            role: session.role(),
            handshake_hash: *session.handshake_hash(),
        });
        Ok(session)
    }

    /// Encrypt a transport message for `peer`.
    pub async fn encrypt(&self, plaintext: &[u8], peer: &PeerId) -> Result<Vec<u8>, NoiseError> {
        let slot = self
            .slot(peer)
            .ok_or_else(|| NoiseError::SessionNotEstablished(peer.clone()))?;
        let mut guard = slot.lock().await;
        let SlotState::Established(session) = &mut *guard else {
            return Err(NoiseError::SessionNotEstablished(peer.clone()));
        };

        let job = session.send_cipher_mut().seal_job(plaintext, &[])?;
        let ciphertext = self.dispatcher.run(job).await?;
        session.send_cipher_mut().advance();
        session.record_message();
        self.check_message_limit(peer, session);
        Ok(ciphertext)
    }

    /// Decrypt a transport message from `peer`.
    ///
    /// An authentication failure leaves the session and its receive counter
    /// untouched.
    pub async fn decrypt(&self, ciphertext: &[u8], peer: &PeerId) -> Result<Vec<u8>, NoiseError> {
        let slot = self
            .slot(peer)
            .ok_or_else(|| NoiseError::SessionNotEstablished(peer.clone()))?;
        let mut guard = slot.lock().await;
        let SlotState::Established(session) = &mut *guard else {
            return Err(NoiseError::SessionNotEstablished(peer.clone()));
        };

        let job = session.recv_cipher_mut().open_job(ciphertext, &[])?;
        let plaintext = match self.dispatcher.run(job).await {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "Transport decrypt failed");
                return Err(e);
            }
        };
        session.recv_cipher_mut().advance();
        session.record_message();
        self.check_message_limit(peer, session);
        Ok(plaintext)
    }

    fn check_message_limit(&self, peer: &PeerId, session: &mut NoiseSession) {
        if session.message_limit_reached(&self.config) && session.signal_rekey() {
            debug!(peer = %peer.short(), messages = session.message_count(), "Rekey due");
            self.emit(SessionEvent::RekeyDue {
                peer: peer.clone(),
                reason: RekeyReason::MessageCount,
            });
        }
    }

    /// Signal rekeys for sessions older than the configured interval.
    pub async fn check_rekey(&self, current_time_ms: u64) -> Vec<PeerId> {
        let slots: Vec<(PeerId, Slot)> = self
            .read_peers()
            .iter()
            .map(|(peer, slot)| (peer.clone(), slot.clone()))
            .collect();

        let mut due = Vec::new();
        for (peer, slot) in slots {
            let mut guard = slot.lock().await;
            if let SlotState::Established(session) = &mut *guard
                && session.age_limit_reached(&self.config, current_time_ms)
                && session.signal_rekey()
            {
                self.emit(SessionEvent::RekeyDue {
                    peer: peer.clone(),
                    reason: RekeyReason::Age,
                });
                due.push(peer);
            }
        }
        due
    }

    /// Drop the session with `peer`. Returns whether one existed.
    pub async fn remove_session(&self, peer: &PeerId) -> bool {
        let removed = self.write_peers().remove(peer);
        match removed {
            Some(slot) => {
                *slot.lock().await = SlotState::Closed;
                info!(peer = %peer.short(), "Noise session removed");
                self.emit(SessionEvent::Removed { peer: peer.clone() });
                true
            }
            None => false,
        }
    }

    pub async fn session_state(&self, peer: &PeerId) -> SessionState {
        match self.slot(peer) {
            Some(slot) => slot.lock().await.public_state(),
            None => SessionState::Uninitialized,
        }
    }

    pub async fn is_established(&self, peer: &PeerId) -> bool {
        self.session_state(peer).await == SessionState::Established
    }

    /// Handshake hash of an established session.
    pub async fn handshake_hash(&self, peer: &PeerId) -> Option<[u8; 32]> {
        let slot = self.slot(peer)?;
        let guard = slot.lock().await;
        match &*guard {
            SlotState::Established(session) => Some(*session.handshake_hash()),
            _ => None,
        }
    }

    /// Persistent id authenticated by the session with `peer`.
    pub async fn remote_peer_id(&self, peer: &PeerId) -> Option<PeerId> {
        let slot = self.slot(peer)?;
        let guard = slot.lock().await;
        match &*guard {
            SlotState::Established(session) => Some(session.remote_peer_id()),
            _ => None,
        }
    }

    /// Peers with an established session.
    pub async fn established_peers(&self) -> Vec<PeerId> {
        let slots: Vec<(PeerId, Slot)> = self
            .read_peers()
            .iter()
            .map(|(peer, slot)| (peer.clone(), slot.clone()))
            .collect();
        let mut peers = Vec::new();
        for (peer, slot) in slots {
            if matches!(*slot.lock().await, SlotState::Established(_)) {
                peers.push(peer);
            }
        }
        peers.sort();
        peers
    }

    /// Number of peers with any session state.
    pub fn session_count(&self) -> usize {
        self.read_peers().len()
    }
}

impl fmt::Debug for NoiseSessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoiseSessionManager")
            .field("local_id", &self.local_id)
            .field("sessions", &self.session_count())
            .finish()
    }
}
