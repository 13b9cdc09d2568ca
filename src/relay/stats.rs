//! Relay counters and their snapshot.

/// Running counters, kept under the engine's lock.
#[derive(Clone, Debug, Default)]
pub(super) struct RelayCounters {
    pub processed: u64,
    pub relayed: u64,
    pub dropped: u64,
    pub delivered_to_self: u64,
    pub blocked: u64,
    pub probabilistic_skip: u64,
    pub queued: u64,
    pub malformed: u64,
    pub authentication_failures: u64,
    pub acks_processed: u64,
    pub acks_resent: u64,
}

/// Point-in-time engine telemetry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RelayStatistics {
    pub total_processed: u64,
    pub total_relayed: u64,
    pub total_dropped: u64,
    pub total_delivered_to_self: u64,
    pub total_blocked: u64,
    pub total_probabilistic_skip: u64,
    pub total_queued: u64,
    pub malformed: u64,
    pub authentication_failures: u64,
    pub acks_processed: u64,
    /// Acks sent again for retransmissions of already delivered messages.
    pub acks_resent: u64,
    /// Mean per-sender suspicion score.
    pub spam_score: f64,
    /// `(relayed + delivered) / processed`, 0 before anything was processed.
    pub relay_efficiency: f64,
    /// Relay-partition messages still waiting for a next hop or ack.
    pub active_relay_count: usize,
    pub network_size: usize,
    pub current_relay_probability: f64,
}

impl RelayCounters {
    pub(super) fn snapshot(
        &self,
        spam_score: f64,
        active_relay_count: usize,
        network_size: usize,
        current_relay_probability: f64,
    ) -> RelayStatistics {
        let relay_efficiency = if self.processed == 0 {
            0.0
        } else {
            (self.relayed + self.delivered_to_self) as f64 / self.processed as f64
        };
        RelayStatistics {
            total_processed: self.processed,
            total_relayed: self.relayed,
            total_dropped: self.dropped,
            total_delivered_to_self: self.delivered_to_self,
            total_blocked: self.blocked,
            total_probabilistic_skip: self.probabilistic_skip,
            total_queued: self.queued,
            malformed: self.malformed,
            authentication_failures: self.authentication_failures,
            acks_processed: self.acks_processed,
            acks_resent: self.acks_resent,
            spam_score,
            relay_efficiency,
            active_relay_count,
            network_size,
            current_relay_probability,
        }
    }
}
