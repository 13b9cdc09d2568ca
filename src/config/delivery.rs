//! Offline queue and queue sync configuration (`queue.*`, `sync.*`).

use serde::{Deserialize, Serialize};

use crate::protocol::MessagePriority;

/// Offline message queue (`queue.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Total message capacity across both partitions (`queue.capacity`).
    #[serde(default = "QueueConfig::default_capacity")]
    pub capacity: usize,
    /// Share of capacity reserved for direct messages (`queue.direct_share`).
    #[serde(default = "QueueConfig::default_direct_share")]
    pub direct_share: f64,
    /// Per-contact cap for regular contacts (`queue.contact_cap`).
    #[serde(default = "QueueConfig::default_contact_cap")]
    pub contact_cap: usize,
    /// Per-contact cap for favorite contacts (`queue.favorite_contact_cap`).
    #[serde(default = "QueueConfig::default_favorite_contact_cap")]
    pub favorite_contact_cap: usize,
    /// Recently-deleted ids remembered (`queue.tombstone_capacity`).
    #[serde(default = "QueueConfig::default_tombstone_capacity")]
    pub tombstone_capacity: usize,
    /// Age after which a deletion tombstone is forgotten, in seconds
    /// (`queue.tombstone_max_age_secs`).
    #[serde(default = "QueueConfig::default_tombstone_max_age_secs")]
    pub tombstone_max_age_secs: u64,
    /// Retry/backoff policy (`queue.retry.*`).
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            direct_share: 0.8,
            contact_cap: 100,
            favorite_contact_cap: 500,
            tombstone_capacity: 1000,
            tombstone_max_age_secs: 86_400,
            retry: RetryConfig::default(),
        }
    }
}

impl QueueConfig {
    fn default_capacity() -> usize { 1000 }
    fn default_direct_share() -> f64 { 0.8 }
    fn default_contact_cap() -> usize { 100 }
    fn default_favorite_contact_cap() -> usize { 500 }
    fn default_tombstone_capacity() -> usize { 1000 }
    fn default_tombstone_max_age_secs() -> u64 { 86_400 }

    /// Capacity of the direct partition.
    pub fn direct_capacity(&self) -> usize {
        let share = self.direct_share.clamp(0.0, 1.0);
        ((self.capacity as f64) * share).round() as usize
    }

    /// Capacity of the relay partition.
    pub fn relay_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.direct_capacity())
    }
}

/// Retry limits for one priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityPolicy {
    /// Delivery attempts before a message is permanently failed.
    pub max_attempts: u32,
    /// Lifetime of a queued message in seconds.
    pub expiry_secs: u64,
}

/// Retry/backoff (`queue.retry.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base backoff delay in ms (`queue.retry.base_delay_ms`).
    #[serde(default = "RetryConfig::default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Exponential multiplier (`queue.retry.multiplier`).
    #[serde(default = "RetryConfig::default_multiplier")]
    pub multiplier: f64,
    /// Backoff cap in ms (`queue.retry.max_delay_ms`).
    #[serde(default = "RetryConfig::default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the delay, applied symmetrically
    /// (`queue.retry.jitter`).
    #[serde(default = "RetryConfig::default_jitter")]
    pub jitter: f64,
    /// How long a sent message may await an ack before it counts as a failed
    /// attempt, in ms (`queue.retry.ack_timeout_ms`).
    #[serde(default = "RetryConfig::default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "RetryConfig::default_urgent")]
    pub urgent: PriorityPolicy,
    #[serde(default = "RetryConfig::default_high")]
    pub high: PriorityPolicy,
    #[serde(default = "RetryConfig::default_normal")]
    pub normal: PriorityPolicy,
    #[serde(default = "RetryConfig::default_low")]
    pub low: PriorityPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
            jitter: 0.2,
            ack_timeout_ms: 30_000,
            urgent: Self::default_urgent(),
            high: Self::default_high(),
            normal: Self::default_normal(),
            low: Self::default_low(),
        }
    }
}

impl RetryConfig {
    fn default_base_delay_ms() -> u64 { 2_000 }
    fn default_multiplier() -> f64 { 2.0 }
    fn default_max_delay_ms() -> u64 { 300_000 }
    fn default_jitter() -> f64 { 0.2 }
    fn default_ack_timeout_ms() -> u64 { 30_000 }
    fn default_urgent() -> PriorityPolicy { PriorityPolicy { max_attempts: 10, expiry_secs: 48 * 3600 } }
    fn default_high() -> PriorityPolicy { PriorityPolicy { max_attempts: 7, expiry_secs: 24 * 3600 } }
    fn default_normal() -> PriorityPolicy { PriorityPolicy { max_attempts: 5, expiry_secs: 12 * 3600 } }
    fn default_low() -> PriorityPolicy { PriorityPolicy { max_attempts: 3, expiry_secs: 6 * 3600 } }

    /// Limits for a priority.
    pub fn policy(&self, priority: MessagePriority) -> PriorityPolicy {
        match priority {
            MessagePriority::Urgent => self.urgent,
            MessagePriority::High => self.high,
            MessagePriority::Normal => self.normal,
            MessagePriority::Low => self.low,
        }
    }
}

/// Queue synchronization (`sync.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Queue hash cache lifetime in ms (`sync.hash_cache_ttl_ms`).
    #[serde(default = "SyncConfig::default_hash_cache_ttl_ms")]
    pub hash_cache_ttl_ms: u64,
    /// Sync attempts allowed per peer per hour (`sync.max_attempts_per_hour`).
    #[serde(default = "SyncConfig::default_max_attempts_per_hour")]
    pub max_attempts_per_hour: usize,
    /// Minimum seconds between attempts with one peer (`sync.min_interval_secs`).
    #[serde(default = "SyncConfig::default_min_interval_secs")]
    pub min_interval_secs: u64,
    /// Timeout for one request/response exchange in ms (`sync.exchange_timeout_ms`).
    #[serde(default = "SyncConfig::default_exchange_timeout_ms")]
    pub exchange_timeout_ms: u64,
    /// Message bodies sent in one sync frame (`sync.max_messages_per_frame`).
    #[serde(default = "SyncConfig::default_max_messages_per_frame")]
    pub max_messages_per_frame: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            hash_cache_ttl_ms: 30_000,
            max_attempts_per_hour: 10,
            min_interval_secs: 30,
            exchange_timeout_ms: 10_000,
            max_messages_per_frame: 100,
        }
    }
}

impl SyncConfig {
    fn default_hash_cache_ttl_ms() -> u64 { 30_000 }
    fn default_max_attempts_per_hour() -> usize { 10 }
    fn default_min_interval_secs() -> u64 { 30 }
    fn default_exchange_timeout_ms() -> u64 { 10_000 }
    fn default_max_messages_per_frame() -> usize { 100 }
}
