//! Cipher latency telemetry.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Jank counts over the current telemetry window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JankSample {
    /// Operations whose latency exceeded the threshold.
    pub jank: u64,
    /// Operations observed.
    pub total: u64,
}

impl JankSample {
    /// Fraction of operations that were jank, 0.0 when empty.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.jank as f64 / self.total as f64
        }
    }
}

/// Telemetry collaborator consumed by the dispatcher.
pub trait CipherTelemetry: Send + Sync {
    /// Record one completed operation.
    fn record_operation(&self, duration: Duration, size: usize);

    /// Jank counts over the current window.
    fn query_jank(&self) -> JankSample;
}

/// Fixed-length rolling window of jank flags.
#[derive(Debug)]
pub struct RollingTelemetry {
    threshold: Duration,
    window: usize,
    samples: Mutex<VecDeque<bool>>,
}

impl RollingTelemetry {
    /// Create a window of `window` operations, flagging those slower than
    /// `threshold`.
    pub fn new(threshold: Duration, window: usize) -> Self {
        Self {
            threshold,
            window: window.max(1),
            samples: Mutex::new(VecDeque::with_capacity(window.max(1))),
        }
    }

    /// Latency above which an operation counts as jank.
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Forget all samples.
    pub fn clear(&self) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.clear();
        }
    }
}

impl CipherTelemetry for RollingTelemetry {
    fn record_operation(&self, duration: Duration, _size: usize) {
        let Ok(mut samples) = self.samples.lock() else {
            return;
        };
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(duration > self.threshold);
    }

    fn query_jank(&self) -> JankSample {
        self.samples
            .lock()
            .map(|samples| JankSample {
                jank: samples.iter().filter(|j| **j).count() as u64,
                total: samples.len() as u64,
            })
            .unwrap_or_default()
    }
}
