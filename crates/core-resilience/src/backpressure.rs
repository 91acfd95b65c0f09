//! Backpressure: two-watermark flow control between fetch and write
//!
//! A transfer's writer accepts decrypted chunks faster than storage can
//! persist them when the network is quick. The guard counts queued writes
//! (and their bytes) and reports a transition:
//! - **Pause** once the queue reaches the high watermark
//! - **Resume** once it has drained to the low watermark
//!
//! Between the two watermarks the previous state is kept, so the fetch side
//! does not flap on every single write.
//!
//! # Example
//!
//! ```
//! use cumulus_core_resilience::backpressure::{
//!     BackpressureConfig, BackpressureGuard, ThrottleSignal,
//! };
//!
//! let guard = BackpressureGuard::new("transfer-1", BackpressureConfig {
//!     pause_at_count: 2,
//!     resume_at_count: 0,
//!     pause_at_bytes: u64::MAX,
//! });
//!
//! assert_eq!(guard.record_enqueue(1, 4096), None);
//! assert_eq!(guard.record_enqueue(1, 4096), Some(ThrottleSignal::Pause));
//! assert_eq!(guard.record_dequeue(1, 4096), None);
//! assert_eq!(guard.record_dequeue(1, 4096), Some(ThrottleSignal::Resume));
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::debug;

/// Watermarks for one writer queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackpressureConfig {
    /// Queued writes at which the fetch side is paused
    pub pause_at_count: u64,

    /// Queued writes at (or below) which a paused fetch side is resumed
    pub resume_at_count: u64,

    /// Queued bytes at which the fetch side is paused regardless of count
    pub pause_at_bytes: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            pause_at_count: 6,
            resume_at_count: 2,
            pause_at_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Transition the caller must apply to the fetch side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleSignal {
    /// Stop admitting new fetches
    Pause,
    /// Admit fetches again
    Resume,
}

/// Snapshot of a guarded queue
#[derive(Debug, Clone, PartialEq)]
pub struct BackpressureState {
    /// Writes currently queued
    pub queued_count: u64,

    /// Bytes currently queued
    pub queued_bytes: u64,

    /// Whether the guard is holding the fetch side paused
    pub is_throttling: bool,
}

/// Tracks one writer queue and signals throttle transitions.
///
/// Counters are atomics so the guard can be shared between the writer task
/// and the chunk tasks that feed it.
#[derive(Debug)]
pub struct BackpressureGuard {
    name: String,
    config: BackpressureConfig,
    queued_count: AtomicU64,
    queued_bytes: AtomicU64,
    throttling: AtomicBool,
}

impl BackpressureGuard {
    /// Create a guard for a named queue
    pub fn new(name: impl Into<String>, config: BackpressureConfig) -> Self {
        Self {
            name: name.into(),
            config,
            queued_count: AtomicU64::new(0),
            queued_bytes: AtomicU64::new(0),
            throttling: AtomicBool::new(false),
        }
    }

    /// Record writes entering the queue; returns `Pause` on the transition
    pub fn record_enqueue(&self, count: u64, bytes: u64) -> Option<ThrottleSignal> {
        let queued = self.queued_count.fetch_add(count, Ordering::AcqRel) + count;
        let queued_bytes = self.queued_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;

        let over = queued >= self.config.pause_at_count || queued_bytes >= self.config.pause_at_bytes;
        if over
            && self
                .throttling
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            debug!(queue = %self.name, queued, queued_bytes, "write queue over watermark");
            return Some(ThrottleSignal::Pause);
        }
        None
    }

    /// Record writes leaving the queue; returns `Resume` on the transition
    pub fn record_dequeue(&self, count: u64, bytes: u64) -> Option<ThrottleSignal> {
        let queued = saturating_sub(&self.queued_count, count);
        let queued_bytes = saturating_sub(&self.queued_bytes, bytes);

        let drained =
            queued <= self.config.resume_at_count && queued_bytes < self.config.pause_at_bytes;
        if drained
            && self
                .throttling
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            debug!(queue = %self.name, queued, queued_bytes, "write queue drained");
            return Some(ThrottleSignal::Resume);
        }
        None
    }

    /// Drop all accounting; returns `Resume` if the guard was throttling
    pub fn reset(&self) -> Option<ThrottleSignal> {
        self.queued_count.store(0, Ordering::Release);
        self.queued_bytes.store(0, Ordering::Release);
        if self.throttling.swap(false, Ordering::AcqRel) {
            Some(ThrottleSignal::Resume)
        } else {
            None
        }
    }

    /// Current queue state
    pub fn state(&self) -> BackpressureState {
        BackpressureState {
            queued_count: self.queued_count.load(Ordering::Acquire),
            queued_bytes: self.queued_bytes.load(Ordering::Acquire),
            is_throttling: self.throttling.load(Ordering::Acquire),
        }
    }

    /// Whether the guard currently holds the fetch side paused
    pub fn is_throttling(&self) -> bool {
        self.throttling.load(Ordering::Acquire)
    }

    /// Name of the guarded queue
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Watermarks in use
    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }
}

fn saturating_sub(counter: &AtomicU64, amount: u64) -> u64 {
    let previous = counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            Some(v.saturating_sub(amount))
        })
        .unwrap_or(0);
    previous.saturating_sub(amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(pause: u64, resume: u64) -> BackpressureGuard {
        BackpressureGuard::new(
            "test",
            BackpressureConfig {
                pause_at_count: pause,
                resume_at_count: resume,
                pause_at_bytes: 1024,
            },
        )
    }

    #[test]
    fn test_default_config() {
        let config = BackpressureConfig::default();
        assert_eq!(config.pause_at_count, 6);
        assert_eq!(config.resume_at_count, 2);
    }

    #[test]
    fn test_hysteresis_between_watermarks() {
        let guard = guard(4, 1);

        for _ in 0..3 {
            assert_eq!(guard.record_enqueue(1, 10), None);
        }
        assert_eq!(guard.record_enqueue(1, 10), Some(ThrottleSignal::Pause));
        // Already paused: further writes do not signal again
        assert_eq!(guard.record_enqueue(1, 10), None);

        // Draining to 2 stays paused, only 1 resumes
        assert_eq!(guard.record_dequeue(3, 30), None);
        assert!(guard.is_throttling());
        assert_eq!(guard.record_dequeue(1, 10), Some(ThrottleSignal::Resume));
        assert!(!guard.is_throttling());
    }

    #[test]
    fn test_byte_watermark_pauses() {
        let guard = guard(100, 0);
        assert_eq!(guard.record_enqueue(1, 2048), Some(ThrottleSignal::Pause));
        assert_eq!(guard.record_dequeue(1, 2048), Some(ThrottleSignal::Resume));
    }

    #[test]
    fn test_dequeue_no_underflow() {
        let guard = guard(4, 1);
        guard.record_enqueue(1, 100);
        guard.record_dequeue(5, 500);

        let state = guard.state();
        assert_eq!(state.queued_count, 0);
        assert_eq!(state.queued_bytes, 0);
    }

    #[test]
    fn test_reset_releases_throttle() {
        let guard = guard(1, 0);
        assert_eq!(guard.record_enqueue(1, 1), Some(ThrottleSignal::Pause));
        assert_eq!(guard.reset(), Some(ThrottleSignal::Resume));
        assert_eq!(guard.reset(), None);
        assert_eq!(guard.state().queued_count, 0);
    }
}
