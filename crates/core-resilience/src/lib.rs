//! Cumulus Core Resilience: pure-logic flow control primitives
//!
//! # Overview
//!
//! Two building blocks shared by every transfer direction:
//!
//! - **Backoff**: capped linear or exponential retry delays, tracked per
//!   retrying unit (a chunk, a URL request, a sink write)
//! - **Backpressure**: a two-watermark guard that tells the fetch side to
//!   stop admitting work while a writer queue is too deep, and to start again
//!   once it has drained
//!
//! # Key Principles
//!
//! This crate has no knowledge of HTTP, storage targets or the scheduler. It
//! only computes delays and throttle transitions; callers decide what to do
//! with them.
//!
//! ```text
//!  chunk fails ──► Backoff::next_delay() ──► re-queue after delay
//!
//!  writer enqueue ──► BackpressureGuard ──► Some(Pause)  ──► stop admitting
//!  writer dequeue ──► BackpressureGuard ──► Some(Resume) ──► admit again
//! ```
//!
//! # Example
//!
//! ```
//! use cumulus_core_resilience::{Backoff, BackoffPolicy};
//! use std::time::Duration;
//!
//! let mut backoff = Backoff::new(BackoffPolicy::linear(
//!     Duration::from_secs(1),
//!     Duration::from_secs(3),
//! ));
//!
//! assert_eq!(backoff.next_delay(), Duration::from_secs(1));
//! assert_eq!(backoff.next_delay(), Duration::from_secs(2));
//! assert_eq!(backoff.next_delay(), Duration::from_secs(3));
//! assert_eq!(backoff.next_delay(), Duration::from_secs(3)); // capped
//! ```

pub mod backoff;
pub mod backpressure;

pub use backoff::{Backoff, BackoffPolicy, BackoffStrategy};
pub use backpressure::{BackpressureConfig, BackpressureGuard, BackpressureState, ThrottleSignal};

/// Prelude module for convenient imports
pub mod prelude {
    pub use super::backoff::{Backoff, BackoffPolicy, BackoffStrategy};
    pub use super::backpressure::{
        BackpressureConfig, BackpressureGuard, BackpressureState, ThrottleSignal,
    };
}
