//! Recently seen message hashes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct SeenInner {
    /// First-seen time per hash.
    seen: HashMap<[u8; 32], u64>,
    /// Insertion order, oldest first.
    order: VecDeque<([u8; 32], u64)>,
}

/// Bounded, time-windowed set of message hashes for duplicate suppression.
///
/// Shared by every path into the relay engine; internally synchronized.
pub struct SeenMessageStore {
    window_ms: u64,
    capacity: usize,
    inner: Mutex<SeenInner>,
}

impl SeenMessageStore {
    pub fn new(window_ms: u64, capacity: usize) -> Self {
        Self {
            window_ms,
            capacity: capacity.max(1),
            inner: Mutex::new(SeenInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SeenInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `hash`. Returns `true` the first time it is seen within the
    /// window, `false` for a duplicate.
    pub fn insert(&self, hash: &[u8; 32], current_time_ms: u64) -> bool {
        let mut inner = self.lock();
        Self::expire(&mut inner, self.window_ms, current_time_ms);

        if inner.seen.contains_key(hash) {
            return false;
        }
        inner.seen.insert(*hash, current_time_ms);
        inner.order.push_back((*hash, current_time_ms));
        while inner.order.len() > self.capacity {
            if let Some((old, _)) = inner.order.pop_front() {
                inner.seen.remove(&old);
            }
        }
        true
    }

    /// Whether `hash` is remembered, without recording it.
    pub fn contains(&self, hash: &[u8; 32], current_time_ms: u64) -> bool {
        self.lock()
            .seen
            .get(hash)
            .is_some_and(|at| current_time_ms.saturating_sub(*at) < self.window_ms)
    }

    /// Drop hashes older than the window. Returns how many.
    pub fn prune(&self, current_time_ms: u64) -> usize {
        let mut inner = self.lock();
        Self::expire(&mut inner, self.window_ms, current_time_ms)
    }

    fn expire(inner: &mut SeenInner, window_ms: u64, current_time_ms: u64) -> usize {
        let mut removed = 0;
        while let Some((hash, at)) = inner.order.front().copied() {
            if current_time_ms.saturating_sub(at) < window_ms {
                break;
            }
            inner.order.pop_front();
            inner.seen.remove(&hash);
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SeenMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeenMessageStore")
            .field("window_ms", &self.window_ms)
            .field("len", &self.len())
            .finish()
    }
}
