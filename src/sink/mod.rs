//! Ordered output for downloads
//!
//! Chunks finish out of order; the [`SinkWriter`] holds them until the one
//! at the current write position arrives, so the target only ever sees
//! sequential writes and the durable offset is always a contiguous prefix.

pub mod target;
pub mod writer;

use std::fmt::Debug;
use std::io::{self, ErrorKind};

use async_trait::async_trait;

use crate::transfer::Artifact;

pub use target::{FileTarget, MemoryTarget};
pub use writer::{SinkContext, SinkWriter, WriteRequest};

/// Where a download's plaintext ends up
#[async_trait]
pub trait SinkTarget: Send + Sync + Debug {
    /// Bytes already present from offset zero
    async fn durable_len(&mut self) -> io::Result<u64>;

    async fn truncate(&mut self, len: u64) -> io::Result<()>;

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Free what a failed write may have left beyond `keep` bytes
    async fn reclaim_space(&mut self, _keep: u64) -> io::Result<()> {
        Ok(())
    }

    /// Whether the writer may move this target's bytes into memory after
    /// repeated write failures
    fn supports_fallback(&self) -> bool {
        false
    }

    async fn read_prefix(&mut self, _len: u64) -> io::Result<Vec<u8>> {
        Err(io::Error::new(ErrorKind::Unsupported, "target cannot be read back"))
    }

    /// Commit the verified bytes
    async fn finalize(self: Box<Self>) -> io::Result<Artifact>;

    /// Throw the bytes away
    async fn discard(self: Box<Self>) -> io::Result<()>;

    fn describe(&self) -> String;
}
