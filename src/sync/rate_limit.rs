//! Per-peer sync attempt rate limiting.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::identity::PeerId;

const HOUR_MS: u64 = 3_600_000;

/// Why a sync attempt was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitReason {
    /// The previous attempt with this peer was too recent.
    TooSoon { retry_in_ms: u64 },
    /// The hourly attempt budget for this peer is spent.
    HourlyLimit { attempts: usize },
}

impl fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitReason::TooSoon { retry_in_ms } => {
                write!(f, "too soon, retry in {} ms", retry_in_ms)
            }
            RateLimitReason::HourlyLimit { attempts } => {
                write!(f, "{} attempts in the last hour", attempts)
            }
        }
    }
}

/// Sliding one-hour window of attempt times per peer, plus a minimum gap
/// between consecutive attempts.
///
/// Refused attempts are not recorded, so a peer that keeps retrying too
/// early does not push its own window forward.
#[derive(Debug)]
pub struct SyncRateLimiter {
    max_per_hour: usize,
    min_interval_ms: u64,
    attempts: HashMap<PeerId, VecDeque<u64>>,
}

impl SyncRateLimiter {
    pub fn new(max_per_hour: usize, min_interval_ms: u64) -> Self {
        Self {
            max_per_hour,
            min_interval_ms,
            attempts: HashMap::new(),
        }
    }

    /// Record an attempt with `peer` if the limits allow it.
    pub fn try_acquire(&mut self, peer: &PeerId, current_time_ms: u64) -> Result<(), RateLimitReason> {
        let history = self.attempts.entry(peer.clone()).or_default();
        while history
            .front()
            .is_some_and(|&t| current_time_ms.saturating_sub(t) >= HOUR_MS)
        {
            history.pop_front();
        }

        if let Some(&last) = history.back() {
            let since = current_time_ms.saturating_sub(last);
            if since < self.min_interval_ms {
                return Err(RateLimitReason::TooSoon {
                    retry_in_ms: self.min_interval_ms - since,
                });
            }
        }
        if history.len() >= self.max_per_hour {
            return Err(RateLimitReason::HourlyLimit {
                attempts: history.len(),
            });
        }

        history.push_back(current_time_ms);
        Ok(())
    }

    /// Drop peers with no attempt in the last hour.
    pub fn prune(&mut self, current_time_ms: u64) -> usize {
        let before = self.attempts.len();
        self.attempts.retain(|_, history| {
            history
                .back()
                .is_some_and(|&t| current_time_ms.saturating_sub(t) < HOUR_MS)
        });
        before - self.attempts.len()
    }

    pub fn forget(&mut self, peer: &PeerId) {
        self.attempts.remove(peer);
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}
