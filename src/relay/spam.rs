//! Per-sender flood and abuse scoring.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::config::SpamConfig;
use crate::identity::PeerId;

/// Weight of one oversize message in the suspicion score, in units of
/// ordinary messages.
const OVERSIZE_WEIGHT: f64 = 10.0;

/// Why a message was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpamReason {
    /// Sender is serving a block.
    Blocked,
    /// This message pushed the sender over the threshold.
    Flooding,
    /// Envelope larger than allowed.
    Oversize,
}

impl fmt::Display for SpamReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpamReason::Blocked => write!(f, "blocked"),
            SpamReason::Flooding => write!(f, "flooding"),
            SpamReason::Oversize => write!(f, "oversize"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpamVerdict {
    Allow,
    Block(SpamReason),
}

#[derive(Default)]
struct SenderRecord {
    messages: VecDeque<u64>,
    oversize: VecDeque<u64>,
    blocked_until: Option<u64>,
}

impl SenderRecord {
    fn expire(&mut self, window_ms: u64, current_time_ms: u64) {
        for times in [&mut self.messages, &mut self.oversize] {
            while times
                .front()
                .is_some_and(|at| current_time_ms.saturating_sub(*at) >= window_ms)
            {
                times.pop_front();
            }
        }
        if self.blocked_until.is_some_and(|until| current_time_ms >= until) {
            self.blocked_until = None;
        }
    }

    fn score(&self, max_per_window: u32) -> f64 {
        let weighted = self.messages.len() as f64 + self.oversize.len() as f64 * OVERSIZE_WEIGHT;
        weighted / f64::from(max_per_window.max(1))
    }

    fn is_idle(&self) -> bool {
        self.messages.is_empty() && self.oversize.is_empty() && self.blocked_until.is_none()
    }
}

/// Suspicion scores per original sender.
///
/// The score is the sender's message count over the sliding window divided
/// by the allowed rate, with oversize messages weighted heavily. A score
/// above the block threshold blocks the sender for a fixed period.
pub struct SpamPrevention {
    config: SpamConfig,
    senders: Mutex<HashMap<PeerId, SenderRecord>>,
}

impl SpamPrevention {
    pub fn new(config: SpamConfig) -> Self {
        Self {
            config,
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, SenderRecord>> {
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn window_ms(&self) -> u64 {
        self.config.window_secs.saturating_mul(1000)
    }

    /// Score a message of `size` bytes from `sender` and record it.
    pub fn assess(&self, sender: &PeerId, size: usize, current_time_ms: u64) -> SpamVerdict {
        let window_ms = self.window_ms();
        let mut senders = self.lock();
        let record = senders.entry(sender.clone()).or_default();
        record.expire(window_ms, current_time_ms);

        if record.blocked_until.is_some() {
            return SpamVerdict::Block(SpamReason::Blocked);
        }

        let oversize = size > self.config.max_message_size;
        if oversize {
            record.oversize.push_back(current_time_ms);
        } else {
            record.messages.push_back(current_time_ms);
        }

        if record.score(self.config.max_messages_per_window) > self.config.block_threshold {
            let until = current_time_ms.saturating_add(self.config.block_secs.saturating_mul(1000));
            record.blocked_until = Some(until);
            warn!(
                sender = %sender.short(),
                block_secs = self.config.block_secs,
                "Sender exceeded spam threshold, blocking"
            );
            return SpamVerdict::Block(SpamReason::Flooding);
        }
        if oversize {
            return SpamVerdict::Block(SpamReason::Oversize);
        }
        SpamVerdict::Allow
    }

    /// Current score of one sender.
    pub fn score(&self, sender: &PeerId, current_time_ms: u64) -> f64 {
        let window_ms = self.window_ms();
        let mut senders = self.lock();
        match senders.get_mut(sender) {
            Some(record) => {
                record.expire(window_ms, current_time_ms);
                record.score(self.config.max_messages_per_window)
            }
            None => 0.0,
        }
    }

    /// Mean score across tracked senders.
    pub fn average_score(&self, current_time_ms: u64) -> f64 {
        let window_ms = self.window_ms();
        let mut senders = self.lock();
        if senders.is_empty() {
            return 0.0;
        }
        let total: f64 = senders
            .values_mut()
            .map(|r| {
                r.expire(window_ms, current_time_ms);
                r.score(self.config.max_messages_per_window)
            })
            .sum();
        total / senders.len() as f64
    }

    pub fn is_blocked(&self, sender: &PeerId, current_time_ms: u64) -> bool {
        self.lock()
            .get(sender)
            .and_then(|r| r.blocked_until)
            .is_some_and(|until| current_time_ms < until)
    }

    pub fn blocked_count(&self, current_time_ms: u64) -> usize {
        self.lock()
            .values()
            .filter(|r| r.blocked_until.is_some_and(|until| current_time_ms < until))
            .count()
    }

    /// Forget a sender.
    pub fn remove(&self, sender: &PeerId) {
        self.lock().remove(sender);
    }

    /// Drop idle sender records. Returns how many.
    pub fn prune(&self, current_time_ms: u64) -> usize {
        let window_ms = self.window_ms();
        let mut senders = self.lock();
        let before = senders.len();
        senders.retain(|_, r| {
            r.expire(window_ms, current_time_ms);
            !r.is_idle()
        });
        before - senders.len()
    }
}

impl fmt::Debug for SpamPrevention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpamPrevention")
            .field("tracked", &self.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    fn spam() -> SpamPrevention {
        SpamPrevention::new(SpamConfig {
            window_secs: 10,
            max_messages_per_window: 5,
            max_message_size: 100,
            block_threshold: 1.0,
            block_secs: 60,
        })
    }

    #[test]
    fn test_flood_blocks_sender() {
        let s = spam();
        for i in 0..5 {
            assert_eq!(s.assess(&p("a"), 10, i), SpamVerdict::Allow);
        }
        assert_eq!(
            s.assess(&p("a"), 10, 5),
            SpamVerdict::Block(SpamReason::Flooding)
        );
        assert!(s.is_blocked(&p("a"), 6));
        assert_eq!(
            s.assess(&p("a"), 10, 30_000),
            SpamVerdict::Block(SpamReason::Blocked)
        );
        // other senders unaffected
        assert_eq!(s.assess(&p("b"), 10, 6), SpamVerdict::Allow);
        assert_eq!(s.blocked_count(6), 1);

        // block expires
        assert_eq!(s.assess(&p("a"), 10, 61_000), SpamVerdict::Allow);
    }

    #[test]
    fn test_window_slides() {
        let s = spam();
        for i in 0..5 {
            s.assess(&p("a"), 10, i * 1_000);
        }
        assert_eq!(s.assess(&p("a"), 10, 10_500), SpamVerdict::Allow);
        assert!((s.score(&p("a"), 10_500) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_oversize_rejected_and_weighted() {
        let s = spam();
        assert_eq!(
            s.assess(&p("a"), 101, 0),
            SpamVerdict::Block(SpamReason::Flooding)
        );
        assert!(s.is_blocked(&p("a"), 1));

        let lenient = SpamPrevention::new(SpamConfig {
            max_messages_per_window: 100,
            max_message_size: 100,
            ..SpamConfig::default()
        });
        assert_eq!(
            lenient.assess(&p("b"), 101, 0),
            SpamVerdict::Block(SpamReason::Oversize)
        );
        assert!((lenient.score(&p("b"), 0) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_prune_and_average() {
        let s = spam();
        assert_eq!(s.average_score(0), 0.0);
        s.assess(&p("a"), 10, 0);
        s.assess(&p("b"), 10, 0);
        s.assess(&p("b"), 10, 0);
        assert!((s.average_score(0) - 0.3).abs() < 1e-9);
        assert_eq!(s.prune(20_000), 2);
        s.assess(&p("c"), 10, 0);
        s.remove(&p("c"));
        assert_eq!(s.score(&p("c"), 0), 0.0);
    }
}
