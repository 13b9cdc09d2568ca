//! Local identity resolution for recipient matching.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use super::{PeerId, StaticKeypair};

/// How an envelope's recipient field matched the local node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecipientMatch {
    /// No recipient: addressed to everyone.
    Broadcast,
    /// Matches our persistent identity.
    Persistent,
    /// Matches one of our ephemeral session identities.
    Ephemeral,
    /// Addressed to another node.
    Other,
}

impl RecipientMatch {
    /// Whether the local node should receive a copy.
    pub fn is_local(&self) -> bool {
        !matches!(self, RecipientMatch::Other)
    }
}

/// Contract for the identity collaborator.
///
/// Answers whether a key or ephemeral id names this node, and maps peer
/// ephemeral ids to their persistent identities where known.
pub trait IdentityResolver: Send + Sync {
    /// Our persistent peer id.
    fn local_id(&self) -> PeerId;

    /// Whether `id` is our persistent identity.
    fn is_self(&self, id: &PeerId) -> bool {
        *id == self.local_id()
    }

    /// Whether `id` is one of our current ephemeral identities.
    fn is_own_ephemeral(&self, id: &PeerId) -> bool;

    /// Map a peer's ephemeral id to its persistent id.
    fn persistent_for(&self, ephemeral: &PeerId) -> Option<PeerId>;

    /// Classify an envelope recipient against this node.
    fn match_recipient(&self, recipient: Option<&PeerId>) -> RecipientMatch {
        match recipient {
            None => RecipientMatch::Broadcast,
            Some(id) if self.is_self(id) => RecipientMatch::Persistent,
            Some(id) if self.is_own_ephemeral(id) => RecipientMatch::Ephemeral,
            Some(_) => RecipientMatch::Other,
        }
    }
}

/// In-process identity resolver backed by the node's static keypair.
pub struct LocalIdentity {
    keypair: StaticKeypair,
    local_id: PeerId,
    own_ephemeral: RwLock<HashSet<PeerId>>,
    peer_ephemeral: RwLock<HashMap<PeerId, PeerId>>,
}

impl LocalIdentity {
    /// Create a resolver for the given keypair.
    pub fn new(keypair: StaticKeypair) -> Self {
        let local_id = keypair.peer_id();
        Self {
            keypair,
            local_id,
            own_ephemeral: RwLock::new(HashSet::new()),
            peer_ephemeral: RwLock::new(HashMap::new()),
        }
    }

    /// Create a resolver with a fresh random keypair.
    pub fn generate() -> Self {
        Self::new(StaticKeypair::generate())
    }

    /// Return the static keypair.
    pub fn keypair(&self) -> &StaticKeypair {
        &self.keypair
    }

    /// Register one of our ephemeral ids.
    pub fn add_own_ephemeral(&self, id: PeerId) {
        if let Ok(mut set) = self.own_ephemeral.write() {
            set.insert(id);
        }
    }

    /// Retire one of our ephemeral ids.
    pub fn remove_own_ephemeral(&self, id: &PeerId) {
        if let Ok(mut set) = self.own_ephemeral.write() {
            set.remove(id);
        }
    }

    /// Record that a peer's ephemeral id belongs to a persistent identity.
    pub fn bind_peer_ephemeral(&self, ephemeral: PeerId, persistent: PeerId) {
        if let Ok(mut map) = self.peer_ephemeral.write() {
            map.insert(ephemeral, persistent);
        }
    }
}

impl IdentityResolver for LocalIdentity {
    fn local_id(&self) -> PeerId {
        self.local_id.clone()
    }

    fn is_self(&self, id: &PeerId) -> bool {
        *id == self.local_id
    }

    fn is_own_ephemeral(&self, id: &PeerId) -> bool {
        self.own_ephemeral
            .read()
            .map(|set| set.contains(id))
            .unwrap_or(false)
    }

    fn persistent_for(&self, ephemeral: &PeerId) -> Option<PeerId> {
        self.peer_ephemeral
            .read()
            .ok()
            .and_then(|map| map.get(ephemeral).cloned())
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}
