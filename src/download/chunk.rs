//! One planned range of a download

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, trace};

use super::file::DownloadFile;
use crate::error::{ErrorCategory, Result, TransferError};
use crate::net::http::collect_body;
use crate::net::TicketUrls;
use crate::queue::{GroupId, TaskContext, TaskOutcome};
use crate::raid::CloudRaidFetcher;
use crate::scheduler::TaskBody;
use crate::sink::WriteRequest;
use crate::transfer::{Direction, InFlightChunk, PlannedChunk, TransferEvent};

pub struct DownloadChunk {
    file: Arc<DownloadFile>,
    chunk: PlannedChunk,
    /// Set once the writer holds the bytes; a pause racing completion may
    /// requeue the task after that
    done: AtomicBool,
}

impl DownloadChunk {
    pub(crate) fn new(file: Arc<DownloadFile>, chunk: PlannedChunk) -> Arc<Self> {
        Arc::new(Self {
            file,
            chunk,
            done: AtomicBool::new(false),
        })
    }

    pub fn chunk(&self) -> &PlannedChunk {
        &self.chunk
    }

    fn is_gone(&self) -> bool {
        let transfer = self.file.transfer();
        transfer.is_cancelled() || transfer.phase().is_terminal()
    }

    async fn fetch(self: Arc<Self>, ctx: TaskContext) -> TaskOutcome {
        if self.done.load(Ordering::Acquire) {
            return TaskOutcome::Completed;
        }
        if self.is_gone() {
            return TaskOutcome::Aborted;
        }
        let _in_flight = InFlightChunk::enter(self.file.transfer());
        let Some((generation, urls)) = self.file.urls() else {
            debug!(chunk = %self.describe(), "no URLs resolved yet");
            return TaskOutcome::Aborted;
        };

        let timeout = self.file.state().config.timeouts.chunk_request();
        let received = match tokio::time::timeout(timeout, self.receive(&ctx, urls)).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout(timeout)),
        };
        match received {
            Ok(data) => self.deliver(data, generation).await,
            Err(err) => self.recover(err, generation).await,
        }
    }

    /// Pull the ciphertext of this range, from one host or six
    async fn receive(&self, ctx: &TaskContext, urls: TicketUrls) -> Result<Vec<u8>> {
        let state = self.file.state();
        let transfer = self.file.transfer();
        let id = transfer.id();
        let offset = self.chunk.offset;
        let size = self.chunk.size;
        let threshold = Duration::from_millis(state.config.queue.early_release_threshold_ms);
        let started = Instant::now();
        let mut offered = false;

        let report = move |loaded: u64| {
            if let Some(update) = state.progress.chunk_progress(id, offset, loaded) {
                state.events.publish(TransferEvent::Progress(update));
            }
            if offered || loaded == 0 || loaded >= size {
                return;
            }
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed <= 0.0 {
                return;
            }
            let speed = loaded as f64 / elapsed;
            if (size - loaded) as f64 / speed < threshold.as_secs_f64() {
                offered = true;
                if ctx.release_early() {
                    trace!(transfer = %id, offset, "slot released early");
                }
            }
        };

        match urls {
            TicketUrls::Single(base) => {
                let base = self.file.ports().apply(&base)?;
                let url = format!(
                    "{}/{}-{}",
                    base.trim_end_matches('/'),
                    offset,
                    self.chunk.end() - 1
                );
                let body = state.http.get(&url).await?;
                let data = collect_body(body, size, report).await?;
                Ok(data.to_vec())
            }
            TicketUrls::Raid(bases) => {
                let mut parts: [String; 6] = Default::default();
                for (slot, base) in parts.iter_mut().zip(bases.iter()) {
                    *slot = self.file.ports().apply(base)?.trim_end_matches('/').to_string();
                }
                let fetcher = CloudRaidFetcher::new(
                    state.http.clone(),
                    parts,
                    transfer.size(),
                    state.config.raid.clone(),
                    state.config.timeouts.raid_part_stall(),
                );
                fetcher.fetch(self.chunk.range(), report).await
            }
        }
    }

    async fn deliver(&self, data: Vec<u8>, generation: u64) -> TaskOutcome {
        let state = self.file.state();
        let transfer = self.file.transfer();
        let id = transfer.id();
        let offset = self.chunk.offset;
        let size = self.chunk.size;

        if data.len() as u64 != size {
            let err = TransferError::Malformed(format!(
                "chunk at {} returned {} of {} bytes",
                offset,
                data.len(),
                size
            ));
            return self.recover(err, generation).await;
        }
        if self.is_gone() {
            return TaskOutcome::Aborted;
        }

        let cipher = self.file.cipher().clone();
        let (plain, macs) =
            match tokio::task::spawn_blocking(move || cipher.decrypt_chunk(offset, data)).await {
                Ok(decrypted) => decrypted,
                Err(err) => {
                    let err = TransferError::LocalIo(format!("decrypt task: {}", err));
                    return self.recover(err, generation).await;
                }
            };

        let Some(writer) = self.file.writer() else {
            return TaskOutcome::Aborted;
        };
        let request = WriteRequest {
            offset,
            data: Bytes::from(plain),
            macs,
        };
        if writer.submit(request).is_err() {
            return TaskOutcome::Aborted;
        }
        self.done.store(true, Ordering::Release);

        transfer.reset_failures();
        if let Some(update) = state.progress.chunk_done(id, offset, size) {
            state.events.publish(TransferEvent::Progress(update));
        }
        trace!(transfer = %id, offset, size, "chunk fetched");
        TaskOutcome::Completed
    }

    async fn recover(&self, err: TransferError, generation: u64) -> TaskOutcome {
        let state = self.file.state();
        let transfer = self.file.transfer();
        let id = transfer.id();
        let offset = self.chunk.offset;
        let retry = &state.config.retry;

        if self.is_gone() {
            return TaskOutcome::Aborted;
        }
        state.progress.chunk_reset(id, offset);

        if err.is_stale_url() {
            let failures = transfer.note_failure();
            if failures > retry.chunk_retry_limit {
                return self.give_up(err, failures);
            }
            debug!(transfer = %id, offset, error = %err, "chunk URLs stale, refreshing");
            return match self.file.refresh_urls(generation).await {
                Ok(()) => TaskOutcome::Retry {
                    after: Duration::ZERO,
                },
                Err(refresh) => self.escalate(refresh, failures),
            };
        }

        match err.category() {
            ErrorCategory::Cancelled => TaskOutcome::Aborted,
            ErrorCategory::TransientNetwork | ErrorCategory::LocalIo => {
                let failures = transfer.note_failure();
                if failures > retry.chunk_retry_limit {
                    return self.give_up(err, failures);
                }
                if !matches!(err, TransferError::Http { .. })
                    && failures % retry.port_switch_after.max(1) == 0
                {
                    let alternate = self.file.ports().toggle();
                    debug!(transfer = %id, alternate, "switching storage port");
                }
                let after = retry.chunk_backoff().delay_for(failures);
                debug!(transfer = %id, offset, failures, ?after, error = %err, "chunk failed, retrying");
                TaskOutcome::Retry { after }
            }
            _ => self.escalate(err, 0),
        }
    }

    /// Handle errors that are not plain transient failures
    fn escalate(&self, err: TransferError, failures: u32) -> TaskOutcome {
        match err.category() {
            ErrorCategory::Overquota => {
                self.file
                    .state()
                    .enter_overquota(Direction::Download, err.retry_after());
                TaskOutcome::Retry {
                    after: Duration::ZERO,
                }
            }
            ErrorCategory::Cancelled => TaskOutcome::Aborted,
            ErrorCategory::TransientNetwork | ErrorCategory::LocalIo => TaskOutcome::Retry {
                after: self
                    .file
                    .state()
                    .config
                    .retry
                    .chunk_backoff()
                    .delay_for(failures.max(1)),
            },
            ErrorCategory::Fatal | ErrorCategory::Integrity => {
                self.file.fail(err.clone());
                TaskOutcome::Failed(err)
            }
        }
    }

    fn give_up(&self, err: TransferError, attempts: u32) -> TaskOutcome {
        let err = TransferError::RetriesExhausted {
            attempts,
            last: err.to_string(),
        };
        self.file.fail(err.clone());
        TaskOutcome::Failed(err)
    }
}

impl TaskBody for DownloadChunk {
    fn group(&self) -> GroupId {
        self.file.transfer().id()
    }

    fn validate(&self) -> bool {
        !self.file.transfer().is_paused()
    }

    fn is_stale(&self) -> bool {
        self.done.load(Ordering::Acquire) || self.is_gone()
    }

    /// The chunk the writer is blocked on runs even while throttled
    fn bypasses_throttle(&self) -> bool {
        self.file
            .writer()
            .is_some_and(|writer| writer.position() == self.chunk.offset)
    }

    fn run(self: Arc<Self>, ctx: TaskContext) -> BoxFuture<'static, TaskOutcome> {
        self.fetch(ctx).boxed()
    }

    fn interrupted(&self) {
        self.file
            .state()
            .progress
            .chunk_reset(self.file.transfer().id(), self.chunk.offset);
    }

    fn destroy(&self) {
        self.interrupted();
    }

    fn describe(&self) -> String {
        format!(
            "{} chunk {}-{}",
            self.file.transfer().id(),
            self.chunk.offset,
            self.chunk.end()
        )
    }
}
