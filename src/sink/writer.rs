/*!
 * Single-writer ordered persistence
 *
 * Chunk tasks `submit` decrypted buffers keyed by offset; the writer task
 * only ever writes the buffer whose offset equals its current position.
 * Out-of-order buffers wait in `pending`, and a [`BackpressureGuard`]
 * throttles the fetch side while too many of them pile up.
 *
 * After every durable write the transfer's offset advances and, for files
 * above the resumability threshold, a resume record is saved.
 */

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cumulus_core_resilience::{Backoff, BackoffPolicy, BackpressureGuard, ThrottleSignal};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{MemoryTarget, SinkTarget};
use crate::config::SinkConfig;
use crate::crypto::MacList;
use crate::error::{Result, TransferError};
use crate::transfer::progress::ProgressTable;
use crate::transfer::resume::{ResumeRecord, ResumeStore};
use crate::transfer::{Transfer, TransferPhase};

/// One decrypted chunk waiting for its turn
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub offset: u64,
    pub data: Bytes,
    pub macs: MacList,
}

type ThrottleFn = dyn Fn(bool) + Send + Sync;

/// Everything the writer task needs besides its target
pub struct SinkContext {
    pub transfer: Arc<Transfer>,
    pub progress: Arc<ProgressTable>,
    /// Store and tag for resume records; `None` disables persistence
    pub resume: Option<(Arc<dyn ResumeStore>, String)>,
    pub config: SinkConfig,
    /// Called with `true` to hold the fetch side, `false` to release it
    pub throttle: Arc<ThrottleFn>,
}

impl fmt::Debug for SinkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkContext")
            .field("transfer", &self.transfer.id())
            .field("resume", &self.resume.as_ref().map(|(_, tag)| tag))
            .finish()
    }
}

/// What the writer task hands back: the target (for finalize or discard)
/// and whether every byte made it
pub type WriterOutput = (Box<dyn SinkTarget>, Result<()>);

struct WriterShared {
    pending: Mutex<BTreeMap<u64, WriteRequest>>,
    notify: Notify,
    guard: BackpressureGuard,
    position: AtomicU64,
    closed: AtomicBool,
    throttle: Arc<ThrottleFn>,
}

impl WriterShared {
    fn apply(&self, signal: Option<ThrottleSignal>) {
        match signal {
            Some(ThrottleSignal::Pause) => (self.throttle)(true),
            Some(ThrottleSignal::Resume) => (self.throttle)(false),
            None => {}
        }
    }

    /// Refuse further chunks and lift any hold this writer placed
    fn shut(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.lock().clear();
        let signal = self.guard.reset();
        self.apply(signal);
    }
}

/// Shuts the writer however its task ends, so a failed or cancelled
/// transfer never leaves the fetch side held
struct ShutOnExit(Arc<WriterShared>);

impl Drop for ShutOnExit {
    fn drop(&mut self) {
        self.0.shut();
    }
}

/// Submission handle to a transfer's writer task
#[derive(Clone)]
pub struct SinkWriter {
    shared: Arc<WriterShared>,
}

impl fmt::Debug for SinkWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkWriter")
            .field("position", &self.position())
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl SinkWriter {
    /// Start the writer task at `start`, which must be a chunk boundary the
    /// target already holds durably.
    pub fn spawn(
        target: Box<dyn SinkTarget>,
        start: u64,
        ctx: SinkContext,
    ) -> (Self, JoinHandle<WriterOutput>) {
        let shared = Arc::new(WriterShared {
            pending: Mutex::new(BTreeMap::new()),
            notify: Notify::new(),
            guard: BackpressureGuard::new(
                format!("sink-{}", ctx.transfer.id()),
                ctx.config.backpressure(),
            ),
            position: AtomicU64::new(start),
            closed: AtomicBool::new(false),
            throttle: ctx.throttle.clone(),
        });
        let handle = tokio::spawn(write_loop(shared.clone(), target, ctx));
        (Self { shared }, handle)
    }

    /// Hand a decrypted chunk to the writer
    pub fn submit(&self, request: WriteRequest) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransferError::Cancelled);
        }
        if request.offset < self.position() {
            // a retried chunk raced one that already landed
            trace!(offset = request.offset, "dropping already written chunk");
            return Ok(());
        }

        let bytes = request.data.len() as u64;
        let replaced = self.shared.pending.lock().insert(request.offset, request);
        if replaced.is_none() {
            let signal = self.shared.guard.record_enqueue(1, bytes);
            self.shared.apply(signal);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Next offset the writer will accept for writing
    pub fn position(&self) -> u64 {
        self.shared.position.load(Ordering::Acquire)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn is_throttling(&self) -> bool {
        self.shared.guard.is_throttling()
    }

    /// Stop accepting chunks and wake the writer so it can exit
    pub fn close(&self) {
        self.shared.shut();
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

async fn write_loop(
    shared: Arc<WriterShared>,
    mut target: Box<dyn SinkTarget>,
    mut ctx: SinkContext,
) -> WriterOutput {
    let _shut = ShutOnExit(shared.clone());
    let transfer = ctx.transfer.clone();
    let id = transfer.id();
    let mut fell_back = false;

    loop {
        let size = transfer.size();
        let position = shared.position.load(Ordering::Acquire);
        if position >= size {
            break;
        }
        if shared.closed.load(Ordering::Acquire) || transfer.phase().is_terminal() {
            return (target, Err(TransferError::Cancelled));
        }

        let next = shared.pending.lock().remove(&position);
        let Some(request) = next else {
            tokio::select! {
                _ = shared.notify.notified() => {}
                _ = transfer.reached(TransferPhase::Done) => {}
            }
            continue;
        };

        let len = request.data.len() as u64;
        if let Err(err) = write_with_retry(&mut target, position, &request.data, &ctx.config).await
        {
            if fell_back || !target.supports_fallback() {
                return (target, Err(err));
            }
            match fall_back_to_memory(target, position).await {
                Ok(memory) => {
                    warn!(transfer = %id, position, error = %err, "writes failing, continuing in memory");
                    target = memory;
                    fell_back = true;
                    if let Some((store, tag)) = ctx.resume.take() {
                        if let Err(e) = store.remove(&tag).await {
                            debug!(transfer = %id, error = %e, "could not drop resume record");
                        }
                    }
                    if let Err(err) = target.write_at(position, &request.data).await {
                        return (target, Err(err.into()));
                    }
                }
                Err((original, e)) => return (original, Err(e)),
            }
        }

        let end = position + len;
        shared.position.store(end, Ordering::Release);
        let signal = shared.guard.record_dequeue(1, len);
        shared.apply(signal);

        transfer.record_macs(&request.macs);
        if let Err(err) = transfer.advance_offset(end) {
            return (target, Err(err));
        }
        ctx.progress.set_position(id, end);
        trace!(transfer = %id, offset = position, len, "chunk written");

        if size >= ctx.config.resumable_threshold {
            if let Some((store, tag)) = &ctx.resume {
                let record = ResumeRecord::new(end, size, transfer.macs());
                if let Err(err) = store.save(tag, &record).await {
                    warn!(transfer = %id, error = %err, "failed to save resume record");
                }
            }
        }
    }

    shared.shut();
    transfer.advance_phase(TransferPhase::Verifying);
    debug!(transfer = %id, size = transfer.size(), "all chunks written");
    (target, Ok(()))
}

async fn write_with_retry(
    target: &mut Box<dyn SinkTarget>,
    offset: u64,
    data: &[u8],
    config: &SinkConfig,
) -> Result<()> {
    let delay = Duration::from_millis(config.io_backoff_ms);
    let mut backoff = Backoff::new(BackoffPolicy::linear(delay, delay * 4));
    loop {
        match target.write_at(offset, data).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                let attempt = backoff.attempts() + 1;
                if attempt >= config.io_retry_limit.max(1) {
                    return Err(err.into());
                }
                warn!(target = %target.describe(), offset, attempt, error = %err, "write failed, retrying");
                if let Err(e) = target.reclaim_space(offset).await {
                    debug!(error = %e, "reclaim failed");
                }
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }
}

/// Copy the durable prefix into memory and drop the failing target
async fn fall_back_to_memory(
    mut target: Box<dyn SinkTarget>,
    durable: u64,
) -> std::result::Result<Box<dyn SinkTarget>, (Box<dyn SinkTarget>, TransferError)> {
    let prefix = match target.read_prefix(durable).await {
        Ok(prefix) => prefix,
        Err(e) => return Err((target, e.into())),
    };
    let description = target.describe();
    if let Err(e) = target.discard().await {
        debug!(target = %description, error = %e, "could not remove failed target");
    }
    info!(target = %description, durable, "moved partial download into memory");
    Ok(Box::new(MemoryTarget::with_prefix(prefix)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::resume::MemoryResumeStore;
    use crate::transfer::{Artifact, Direction, TransferId};
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct RecordingTarget {
        buf: Vec<u8>,
        writes: Arc<Mutex<Vec<u64>>>,
        failures_left: Arc<AtomicUsize>,
        fallback: bool,
    }

    #[async_trait]
    impl SinkTarget for RecordingTarget {
        async fn durable_len(&mut self) -> io::Result<u64> {
            Ok(self.buf.len() as u64)
        }

        async fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.buf.truncate(len as usize);
            Ok(())
        }

        async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(io::Error::other("disk full"));
            }
            assert_eq!(offset as usize, self.buf.len());
            self.writes.lock().push(offset);
            self.buf.extend_from_slice(data);
            Ok(())
        }

        fn supports_fallback(&self) -> bool {
            self.fallback
        }

        async fn read_prefix(&mut self, len: u64) -> io::Result<Vec<u8>> {
            Ok(self.buf[..len as usize].to_vec())
        }

        async fn finalize(self: Box<Self>) -> io::Result<Artifact> {
            Ok(Artifact::Memory(Bytes::from(self.buf)))
        }

        async fn discard(self: Box<Self>) -> io::Result<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            "recording".into()
        }
    }

    struct Fixture {
        transfer: Arc<Transfer>,
        throttles: Arc<Mutex<Vec<bool>>>,
        store: Arc<MemoryResumeStore>,
    }

    fn context(size: u64, config: SinkConfig) -> (Fixture, SinkContext) {
        let transfer = Transfer::new(TransferId(1), Direction::Download, "f");
        transfer.set_size(size);
        let throttles = Arc::new(Mutex::new(Vec::new()));
        let recorded = throttles.clone();
        let store = Arc::new(MemoryResumeStore::new());
        let progress = Arc::new(ProgressTable::new(Duration::ZERO));
        progress.register(transfer.id(), size, 0);
        let ctx = SinkContext {
            transfer: transfer.clone(),
            progress,
            resume: Some((store.clone() as Arc<dyn ResumeStore>, "dl:f".to_string())),
            config,
            throttle: Arc::new(move |on| recorded.lock().push(on)),
        };
        (
            Fixture {
                transfer,
                throttles,
                store,
            },
            ctx,
        )
    }

    fn request(offset: u64, len: usize) -> WriteRequest {
        WriteRequest {
            offset,
            data: Bytes::from(vec![(offset / 10) as u8; len]),
            macs: vec![(offset, [offset as u32; 4])],
        }
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_written_in_order() {
        let (fixture, ctx) = context(40, SinkConfig::default());
        let writes = Arc::new(Mutex::new(Vec::new()));
        let target = RecordingTarget {
            writes: writes.clone(),
            ..Default::default()
        };
        let (writer, handle) = SinkWriter::spawn(Box::new(target), 0, ctx);

        for offset in [30, 10, 20, 0] {
            writer.submit(request(offset, 10)).unwrap();
        }
        let (target, result) = handle.await.unwrap();
        result.unwrap();

        assert_eq!(*writes.lock(), vec![0, 10, 20, 30]);
        assert_eq!(fixture.transfer.byte_offset(), 40);
        assert_eq!(fixture.transfer.macs().len(), 4);
        assert_eq!(fixture.transfer.phase(), TransferPhase::Verifying);
        let artifact = target.finalize().await.unwrap();
        let Artifact::Memory(bytes) = artifact else {
            panic!("expected memory artifact");
        };
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[..10], &[0u8; 10]);
        assert_eq!(&bytes[30..], &[3u8; 10]);
    }

    #[tokio::test]
    async fn test_backlog_throttles_then_releases() {
        let config = SinkConfig {
            throttle_pause_at: 2,
            throttle_resume_at: 0,
            ..SinkConfig::default()
        };
        let (fixture, ctx) = context(30, config);
        let (writer, handle) = SinkWriter::spawn(Box::new(RecordingTarget::default()), 0, ctx);

        writer.submit(request(10, 10)).unwrap();
        writer.submit(request(20, 10)).unwrap();
        assert!(writer.is_throttling());
        assert_eq!(*fixture.throttles.lock(), vec![true]);

        writer.submit(request(0, 10)).unwrap();
        let (_, result) = handle.await.unwrap();
        result.unwrap();
        assert_eq!(*fixture.throttles.lock(), vec![true, false]);
        assert_eq!(writer.pending_len(), 0);
    }

    fn throttling_config() -> SinkConfig {
        SinkConfig {
            throttle_pause_at: 2,
            throttle_resume_at: 0,
            io_retry_limit: 1,
            ..SinkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_cancel_while_throttled_releases_hold() {
        let (fixture, ctx) = context(30, throttling_config());
        let (writer, handle) = SinkWriter::spawn(Box::new(RecordingTarget::default()), 0, ctx);
        writer.submit(request(10, 10)).unwrap();
        writer.submit(request(20, 10)).unwrap();
        assert!(writer.is_throttling());

        fixture.transfer.cancel();
        let (_, result) = handle.await.unwrap();
        assert_eq!(result, Err(TransferError::Cancelled));
        assert_eq!(*fixture.throttles.lock(), vec![true, false]);
        assert!(!writer.is_throttling());
        assert!(writer.is_closed());
        assert!(writer.submit(request(0, 10)).is_err());
        assert_eq!(fixture.throttles.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_write_error_while_throttled_releases_hold() {
        let (fixture, ctx) = context(30, throttling_config());
        let target = RecordingTarget {
            failures_left: Arc::new(AtomicUsize::new(usize::MAX)),
            ..Default::default()
        };
        let (writer, handle) = SinkWriter::spawn(Box::new(target), 0, ctx);
        writer.submit(request(10, 10)).unwrap();
        writer.submit(request(20, 10)).unwrap();
        writer.submit(request(0, 10)).unwrap();

        let (_, result) = handle.await.unwrap();
        assert!(matches!(result, Err(TransferError::LocalIo(_))));
        assert_eq!(fixture.throttles.lock().last(), Some(&false));
        assert!(!writer.is_throttling());
        assert_eq!(writer.pending_len(), 0);
        assert_eq!(fixture.transfer.byte_offset(), 0);
    }

    #[tokio::test]
    async fn test_resume_record_saved_after_each_write() {
        let config = SinkConfig {
            resumable_threshold: 0,
            ..SinkConfig::default()
        };
        let (fixture, ctx) = context(20, config);
        let (writer, handle) = SinkWriter::spawn(Box::new(RecordingTarget::default()), 0, ctx);
        writer.submit(request(0, 10)).unwrap();
        writer.submit(request(10, 10)).unwrap();
        handle.await.unwrap().1.unwrap();

        let record = fixture.store.get("dl:f").unwrap();
        assert_eq!(record.byte_offset, 20);
        assert_eq!(record.size, 20);
        assert_eq!(record.macs.len(), 2);
    }

    #[tokio::test]
    async fn test_small_files_skip_resume_records() {
        let (fixture, ctx) = context(10, SinkConfig::default());
        let (writer, handle) = SinkWriter::spawn(Box::new(RecordingTarget::default()), 0, ctx);
        writer.submit(request(0, 10)).unwrap();
        handle.await.unwrap().1.unwrap();
        assert!(fixture.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_target_falls_back_to_memory() {
        let config = SinkConfig {
            io_retry_limit: 2,
            io_backoff_ms: 10,
            ..SinkConfig::default()
        };
        let (fixture, ctx) = context(20, config);
        let failures = Arc::new(AtomicUsize::new(0));
        let target = RecordingTarget {
            failures_left: failures.clone(),
            fallback: true,
            ..Default::default()
        };
        let (writer, handle) = SinkWriter::spawn(Box::new(target), 0, ctx);
        writer.submit(request(0, 10)).unwrap();
        tokio::task::yield_now().await;
        failures.store(5, Ordering::SeqCst);
        writer.submit(request(10, 10)).unwrap();

        let (target, result) = handle.await.unwrap();
        result.unwrap();
        assert_eq!(fixture.transfer.byte_offset(), 20);
        let Artifact::Memory(bytes) = target.finalize().await.unwrap() else {
            panic!("expected memory artifact");
        };
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[10..], &[1u8; 10]);
    }

    #[tokio::test]
    async fn test_close_stops_writer() {
        let (fixture, ctx) = context(20, SinkConfig::default());
        let (writer, handle) = SinkWriter::spawn(Box::new(RecordingTarget::default()), 0, ctx);
        writer.submit(request(10, 10)).unwrap();
        writer.close();
        let (_, result) = handle.await.unwrap();
        assert_eq!(result, Err(TransferError::Cancelled));
        assert!(writer.submit(request(0, 10)).is_err());
        assert_eq!(fixture.transfer.byte_offset(), 0);
    }

    #[tokio::test]
    async fn test_failed_transfer_wakes_writer() {
        let (fixture, ctx) = context(20, SinkConfig::default());
        let (_writer, handle) = SinkWriter::spawn(Box::new(RecordingTarget::default()), 0, ctx);
        tokio::task::yield_now().await;
        fixture.transfer.fail(TransferError::Network("reset".into()));
        let (_, result) = handle.await.unwrap();
        assert_eq!(result, Err(TransferError::Cancelled));
    }

    #[tokio::test]
    async fn test_stale_submission_ignored() {
        let (_fixture, ctx) = context(20, SinkConfig::default());
        let target = RecordingTarget {
            buf: vec![0u8; 10],
            ..Default::default()
        };
        let (writer, handle) = SinkWriter::spawn(Box::new(target), 10, ctx);
        writer.submit(request(0, 10)).unwrap();
        assert_eq!(writer.pending_len(), 0);
        writer.submit(request(10, 10)).unwrap();
        handle.await.unwrap().1.unwrap();
    }
}
