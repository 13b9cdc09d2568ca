//! meshlink: secure session, relay and offline delivery substrate
//!
//! Carries messages between peers over an intermittent multi-hop link
//! where no peer is always reachable. Peers authenticate with a Noise XX
//! handshake and encrypt end to end; every node deduplicates, filters,
//! routes and relays envelopes for others, queues what it cannot deliver
//! yet, and reconciles its queue with peers it meets.

pub mod config;
pub mod dispatch;
pub mod identity;
pub mod noise;
pub mod protocol;
pub mod queue;
pub mod relay;
pub mod routing;
pub mod sync;
pub mod topology;

// Re-export identity types
pub use identity::{
    IdentityError, IdentityResolver, LocalIdentity, MessageId, PeerId, RecipientMatch,
    StaticKeypair, now_ms,
};

// Re-export config types
pub use config::{Config, ConfigError};

// Re-export session types
pub use noise::{NoiseError, NoiseSession, NoiseSessionManager, SessionEvent, SessionState};

// Re-export dispatch types
pub use dispatch::{AdaptiveCipherDispatcher, DispatchError, DispatchMode, DispatchOverride};

// Re-export protocol types
pub use protocol::{
    MeshRelayMessage, MessageBody, MessageContent, MessageKind, MessagePriority, ProtocolError,
    RelayMetadata,
};

// Re-export routing types
pub use routing::{RouteReason, RoutingDecision, RoutingService};
pub use topology::NetworkTopology;

// Re-export relay types
pub use relay::{
    LocalDelivery, MeshRelayEngine, OutboundFrame, RelayError, RelayOutcome, RelayStatistics,
    relay_channels, spawn_maintenance,
};

// Re-export queue types
pub use queue::{
    InMemoryQueueRepository, OfflineMessageQueue, QueueError, QueueRepository, QueuedMessage,
    QueuedMessageStatus,
};

// Re-export sync types
pub use sync::{QueueSyncCoordinator, SyncFrame, SyncOutcome, SyncPeer};
