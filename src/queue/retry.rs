//! Retry backoff and timers for queued messages.
//!
//! `RetryPolicy` is pure arithmetic over the attempt count and priority;
//! `RetryScheduler` holds the per-message deadlines (`retry_after_ms`) that
//! periodic maintenance polls.

use rand::Rng;
use std::collections::HashMap;

use crate::config::RetryConfig;
use crate::identity::MessageId;
use crate::protocol::MessagePriority;

/// Backoff scale per priority: urgent traffic retries sooner.
fn priority_scale(priority: MessagePriority) -> f64 {
    match priority {
        MessagePriority::Urgent => 0.5,
        MessagePriority::High => 0.75,
        MessagePriority::Normal => 1.0,
        MessagePriority::Low => 1.5,
    }
}

/// Exponential backoff with jitter and per-priority limits.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self, priority: MessagePriority) -> u32 {
        self.config.policy(priority).max_attempts
    }

    /// Lifetime of a queued message in ms.
    pub fn expiry_ms(&self, priority: MessagePriority) -> u64 {
        self.config.policy(priority).expiry_secs.saturating_mul(1000)
    }

    pub fn ack_timeout_ms(&self) -> u64 {
        self.config.ack_timeout_ms
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    pub fn can_retry(&self, attempts: u32, priority: MessagePriority) -> bool {
        attempts < self.max_attempts(priority)
    }

    /// Delay after `attempts` failed attempts, before jitter.
    ///
    /// `base * multiplier^(attempts - 1) * scale(priority)`, capped at
    /// `max_delay_ms`.
    pub fn base_delay_ms(&self, attempts: u32, priority: MessagePriority) -> u64 {
        let max = self.config.max_delay_ms;
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.config.multiplier.max(1.0).powi(exponent);
        let raw = self.config.base_delay_ms as f64 * factor * priority_scale(priority);
        if !raw.is_finite() || raw >= max as f64 {
            max
        } else {
            raw as u64
        }
    }

    /// Delay with jitter; `unit` in `[-1, 1]` picks a point in the band.
    pub fn delay_ms(&self, attempts: u32, priority: MessagePriority, unit: f64) -> u64 {
        let base = self.base_delay_ms(attempts, priority) as f64;
        let spread = self.config.jitter.clamp(0.0, 1.0) * unit.clamp(-1.0, 1.0);
        let delay = (base * (1.0 + spread)).round().max(0.0) as u64;
        delay.min(self.config.max_delay_ms)
    }

    /// Delay with jitter drawn from `rng`.
    pub fn jittered_delay_ms<R: Rng + ?Sized>(
        &self,
        attempts: u32,
        priority: MessagePriority,
        rng: &mut R,
    ) -> u64 {
        let unit = rng.gen_range(-1.0..=1.0);
        self.delay_ms(attempts, priority, unit)
    }
}

/// What a fired timer means for its message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// Backoff elapsed; resend.
    Retry,
    /// No ack arrived in time; the attempt failed.
    AckTimeout,
}

/// Per-message deadlines.
#[derive(Clone, Debug, Default)]
pub struct RetryScheduler {
    timers: HashMap<MessageId, (u64, TimerKind)>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the timer for a message.
    pub fn schedule(&mut self, id: MessageId, retry_after_ms: u64, kind: TimerKind) {
        self.timers.insert(id, (retry_after_ms, kind));
    }

    pub fn cancel(&mut self, id: &MessageId) -> bool {
        self.timers.remove(id).is_some()
    }

    /// Pop every timer due at `current_time_ms`, earliest first.
    pub fn due(&mut self, current_time_ms: u64) -> Vec<(MessageId, TimerKind)> {
        let mut fired: Vec<(u64, MessageId, TimerKind)> = self
            .timers
            .iter()
            .filter(|(_, (at, _))| *at <= current_time_ms)
            .map(|(id, (at, kind))| (*at, *id, *kind))
            .collect();
        fired.sort_by_key(|(at, id, _)| (*at, *id));
        for (_, id, _) in &fired {
            self.timers.remove(id);
        }
        fired.into_iter().map(|(_, id, kind)| (id, kind)).collect()
    }

    pub fn deadline(&self, id: &MessageId) -> Option<(u64, TimerKind)> {
        self.timers.get(id).copied()
    }

    /// Earliest pending deadline.
    pub fn next_due(&self) -> Option<u64> {
        self.timers.values().map(|(at, _)| *at).min()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
