/*!
 * Per-file download coordination
 *
 * The coordinator runs as a queue task: it resolves URLs (retrying through
 * the queue with capped backoff), plans chunks, negotiates resume state and
 * starts the sink writer. A separate driver task then waits for the writer
 * to finish, verifies the condensed MAC and commits or discards the target.
 *
 * Cancellation discards the partial target and its resume record. Any
 * other failure keeps both so a later attempt can continue.
 */

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::chunk::DownloadChunk;
use super::{DownloadRequest, DownloadTarget};
use crate::crypto::{ChunkCipher, FileKey};
use crate::error::{ErrorCategory, Result, TransferError};
use crate::net::{DownloadTicket, PortSelector, TicketUrls};
use crate::queue::{GroupId, TaskContext, TaskOutcome};
use crate::scheduler::{SchedulerState, Task, TaskBody};
use crate::sink::target::partial_path;
use crate::sink::writer::WriterOutput;
use crate::sink::{FileTarget, MemoryTarget, SinkContext, SinkTarget, SinkWriter};
use crate::transfer::plan::{plan_chunks, resume_point, skip_completed, PlannedChunk};
use crate::transfer::resume::{download_tag, ResumeRecord};
use crate::transfer::verify::verify_macs;
use crate::transfer::{Direction, Transfer, TransferEvent, TransferPhase, Verification};

pub struct DownloadFile {
    state: Arc<SchedulerState>,
    transfer: Arc<Transfer>,
    handle: String,
    key: FileKey,
    cipher: ChunkCipher,
    target: DownloadTarget,
    tag: String,
    ports: PortSelector,
    /// Current URL set and its generation
    urls: Mutex<Option<(u64, TicketUrls)>>,
    refresh: tokio::sync::Mutex<()>,
    url_attempts: AtomicU32,
    writer: Mutex<Option<SinkWriter>>,
    driving: AtomicBool,
}

impl DownloadFile {
    pub(crate) fn new(
        state: Arc<SchedulerState>,
        transfer: Arc<Transfer>,
        request: DownloadRequest,
    ) -> Arc<Self> {
        let ports = PortSelector::new(state.config.retry.alternate_port);
        Arc::new(Self {
            cipher: request.key.chunk_cipher(),
            tag: download_tag(&request.handle),
            key: request.key,
            handle: request.handle,
            target: request.target,
            ports,
            state,
            transfer,
            urls: Mutex::new(None),
            refresh: tokio::sync::Mutex::new(()),
            url_attempts: AtomicU32::new(0),
            writer: Mutex::new(None),
            driving: AtomicBool::new(false),
        })
    }

    pub fn transfer(&self) -> &Arc<Transfer> {
        &self.transfer
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub(crate) fn state(&self) -> &Arc<SchedulerState> {
        &self.state
    }

    pub(crate) fn cipher(&self) -> &ChunkCipher {
        &self.cipher
    }

    pub(crate) fn ports(&self) -> &PortSelector {
        &self.ports
    }

    pub(crate) fn urls(&self) -> Option<(u64, TicketUrls)> {
        self.urls.lock().clone()
    }

    pub(crate) fn writer(&self) -> Option<SinkWriter> {
        self.writer.lock().clone()
    }

    fn set_urls(&self, urls: TicketUrls) {
        let mut current = self.urls.lock();
        let generation = current.as_ref().map_or(1, |(g, _)| g + 1);
        *current = Some((generation, urls));
    }

    async fn fetch_ticket(&self) -> Result<DownloadTicket> {
        let timeout = self.state.config.timeouts.api_call();
        match tokio::time::timeout(timeout, self.state.api.download_url(&self.handle)).await {
            Ok(result) => result.map_err(TransferError::from),
            Err(_) => Err(TransferError::Timeout(timeout)),
        }
    }

    /// Replace URLs that went stale, unless another chunk already did since
    /// `seen` was read.
    pub(crate) async fn refresh_urls(&self, seen: u64) -> Result<()> {
        let _guard = self.refresh.lock().await;
        if self.urls().is_some_and(|(generation, _)| generation != seen) {
            return Ok(());
        }
        let ticket = self.fetch_ticket().await?;
        if ticket.size != self.transfer.size() {
            return Err(TransferError::Malformed(format!(
                "size changed from {} to {}",
                self.transfer.size(),
                ticket.size
            )));
        }
        debug!(transfer = %self.transfer.id(), "chunk URLs refreshed");
        self.set_urls(ticket.urls);
        Ok(())
    }

    /// Fail the transfer once; later calls are ignored
    pub(crate) fn fail(&self, err: TransferError) {
        let id = self.transfer.id();
        if !self.transfer.fail(err.clone()) {
            return;
        }
        warn!(transfer = %id, error = %err, category = %err.category(), "download failed");
        self.state.events.publish(TransferEvent::error(id, &err));
        self.state.downloads.filter(id);
        let writer = self.writer();
        if let Some(writer) = writer {
            writer.close();
        }
        self.state.forget(id);
    }

    async fn coordinate(self: Arc<Self>) -> TaskOutcome {
        if self.is_stale() {
            return TaskOutcome::Aborted;
        }
        let ticket = match self.fetch_ticket().await {
            Ok(ticket) => ticket,
            Err(err) => return self.ticket_failure(err),
        };
        self.url_attempts.store(0, Ordering::Release);
        if self.is_stale() {
            return TaskOutcome::Aborted;
        }

        match self.prepare(ticket).await {
            Ok(()) => TaskOutcome::Completed,
            Err(err) => {
                self.fail(err.clone());
                TaskOutcome::Failed(err)
            }
        }
    }

    fn ticket_failure(&self, err: TransferError) -> TaskOutcome {
        let retry = &self.state.config.retry;
        match err.category() {
            ErrorCategory::Overquota => {
                self.state.enter_overquota(Direction::Download, err.retry_after());
                TaskOutcome::Retry {
                    after: Duration::ZERO,
                }
            }
            ErrorCategory::Cancelled => TaskOutcome::Aborted,
            ErrorCategory::TransientNetwork | ErrorCategory::LocalIo => {
                let attempts = self.url_attempts.fetch_add(1, Ordering::AcqRel) + 1;
                if attempts > retry.url_retry_limit {
                    let err = TransferError::RetriesExhausted {
                        attempts,
                        last: err.to_string(),
                    };
                    self.fail(err.clone());
                    return TaskOutcome::Failed(err);
                }
                let after = retry.url_backoff().delay_for(attempts);
                debug!(transfer = %self.transfer.id(), attempts, ?after, error = %err, "URL request failed");
                TaskOutcome::Retry { after }
            }
            ErrorCategory::Fatal | ErrorCategory::Integrity => {
                self.fail(err.clone());
                TaskOutcome::Failed(err)
            }
        }
    }

    async fn prepare(self: &Arc<Self>, ticket: DownloadTicket) -> Result<()> {
        let id = self.transfer.id();
        let size = ticket.size;
        let raid = ticket.urls.is_raid();
        self.transfer.set_size(size);
        self.set_urls(ticket.urls);
        self.state.events.publish(TransferEvent::Start {
            id,
            direction: Direction::Download,
            name: ticket.name.unwrap_or_else(|| self.transfer.name().to_string()),
            size,
        });
        self.transfer.advance_phase(TransferPhase::Planning);

        let plan = plan_chunks(size, &self.state.config.chunks);
        let mut target = self.open_target().await?;
        let offset = self.negotiate_resume(&plan, target.as_mut()).await?;
        let chunks = skip_completed(plan, offset);
        info!(transfer = %id, size, offset, chunks = chunks.len(), raid, "download planned");

        self.state.progress.register(id, size, offset);
        let resume = if size >= self.state.config.sink.resumable_threshold {
            self.state
                .resume
                .clone()
                .map(|store| (store, self.tag.clone()))
        } else {
            None
        };
        let queue = self.state.downloads.clone();
        let source = format!("sink-{}", id);
        let (writer, join) = SinkWriter::spawn(
            target,
            offset,
            SinkContext {
                transfer: self.transfer.clone(),
                progress: self.state.progress.clone(),
                resume,
                config: self.state.config.sink.clone(),
                throttle: Arc::new(move |on| queue.set_throttle(&source, on)),
            },
        );
        self.state.attach_sink(id, writer.clone());
        *self.writer.lock() = Some(writer);
        self.driving.store(true, Ordering::Release);
        self.transfer.advance_phase(TransferPhase::Transferring);
        tokio::spawn(self.clone().drive(join));

        let tasks: Vec<Task> = chunks
            .into_iter()
            .map(|chunk: PlannedChunk| Task::ChunkFetch(DownloadChunk::new(self.clone(), chunk)))
            .collect();
        self.state.downloads.push_many(tasks);
        Ok(())
    }

    async fn open_target(&self) -> Result<Box<dyn SinkTarget>> {
        Ok(match &self.target {
            DownloadTarget::File(dest) => Box::new(
                FileTarget::open(dest, &self.state.config.sink.partial_suffix).await?,
            ),
            DownloadTarget::Memory => Box::new(MemoryTarget::new()),
        })
    }

    /// Decide where to continue from. A record is trusted only if it
    /// describes a file of this size and the target holds at least that
    /// many bytes.
    async fn negotiate_resume(
        &self,
        plan: &[PlannedChunk],
        target: &mut dyn SinkTarget,
    ) -> Result<u64> {
        let id = self.transfer.id();
        let size = self.transfer.size();
        let durable = target.durable_len().await?;

        if let Some(record) = self.load_record(size).await {
            if record.size == size && record.byte_offset <= size && durable >= record.byte_offset {
                let offset = resume_point(plan, record.byte_offset);
                let macs = record
                    .macs
                    .into_iter()
                    .filter(|(block, _)| *block < offset)
                    .collect();
                target.truncate(offset).await?;
                self.transfer.restore(offset, macs);
                info!(transfer = %id, offset, durable, "resuming download");
                return Ok(offset);
            }
            warn!(
                transfer = %id,
                recorded = record.byte_offset,
                durable,
                "resume record does not match partial data, starting over"
            );
            self.remove_record().await;
        }

        if durable > 0 {
            target.truncate(0).await?;
        }
        Ok(0)
    }

    async fn load_record(&self, size: u64) -> Option<ResumeRecord> {
        if size < self.state.config.sink.resumable_threshold {
            return None;
        }
        let store = self.state.resume.as_ref()?;
        match store.load(&self.tag).await {
            Ok(record) => record,
            Err(err) => {
                warn!(transfer = %self.transfer.id(), error = %err, "ignoring unreadable resume record");
                None
            }
        }
    }

    async fn remove_record(&self) {
        if let Some(store) = &self.state.resume {
            if let Err(err) = store.remove(&self.tag).await {
                debug!(transfer = %self.transfer.id(), error = %err, "could not remove resume record");
            }
        }
    }

    async fn discard(&self, target: Box<dyn SinkTarget>) {
        let description = target.describe();
        if let Err(err) = target.discard().await {
            warn!(target = %description, error = %err, "could not discard partial download");
        }
    }

    async fn drive(self: Arc<Self>, join: JoinHandle<WriterOutput>) {
        let output = join.await;
        if let Some(writer) = self.writer.lock().take() {
            writer.close();
        }
        let (target, result) = match output {
            Ok(output) => output,
            Err(err) => {
                self.fail(TransferError::LocalIo(format!("writer task ended: {}", err)));
                return;
            }
        };

        match result {
            Ok(()) => self.verify_and_commit(target).await,
            Err(err) => self.abandon(target, err).await,
        }
    }

    async fn abandon(&self, target: Box<dyn SinkTarget>, err: TransferError) {
        let id = self.transfer.id();
        if self.transfer.is_cancelled() {
            self.discard(target).await;
            self.remove_record().await;
            self.state.forget(id);
            debug!(transfer = %id, "cancelled download cleaned up");
        } else if self.transfer.phase().is_terminal() {
            // the partial file and its record stay for a later attempt
            drop(target);
        } else {
            self.fail(err);
        }
    }

    async fn verify_and_commit(&self, target: Box<dyn SinkTarget>) {
        let id = self.transfer.id();
        let expected = self.key.meta_mac();
        let macs = self.transfer.macs();
        let cipher = self.cipher.clone();
        let integrity = self.state.config.integrity.clone();
        let verdict = tokio::task::spawn_blocking(move || {
            verify_macs(&cipher, &macs, expected, &integrity)
        })
        .await;

        match verdict {
            Ok(Verification::Match) => debug!(transfer = %id, "MAC verified"),
            Ok(Verification::Recovered { excluded }) => {
                warn!(transfer = %id, ?excluded, "MAC matched after leaving out stray blocks")
            }
            Ok(Verification::Mismatch) => {
                self.discard(target).await;
                self.remove_record().await;
                self.fail(TransferError::Integrity(format!(
                    "condensed MAC of {} does not match its key",
                    self.transfer.name()
                )));
                return;
            }
            Err(err) => {
                self.fail(TransferError::LocalIo(format!("verification task: {}", err)));
                return;
            }
        }

        if self.transfer.is_cancelled() {
            self.abandon(target, TransferError::Cancelled).await;
            return;
        }
        self.transfer.advance_phase(TransferPhase::Finalizing);
        self.state.events.publish(TransferEvent::BeforeComplete { id });

        let artifact = match target.finalize().await {
            Ok(artifact) => artifact,
            Err(err) => {
                self.fail(err.into());
                return;
            }
        };
        self.remove_record().await;
        self.state.forget(id);

        let size = self.transfer.size();
        if self.transfer.phase() == TransferPhase::Finalizing {
            self.state.events.publish(TransferEvent::Complete { id, size });
        }
        if self.transfer.complete(artifact) {
            info!(transfer = %id, size, "download complete");
        }
    }

    /// Remove what a cancelled coordinator may have left before its driver
    /// started
    fn discard_orphan(&self) {
        let state = self.state.clone();
        let id = self.transfer.id();
        let tag = self.tag.clone();
        let part = match &self.target {
            DownloadTarget::File(dest) => Some(partial_path(dest, &state.config.sink.partial_suffix)),
            DownloadTarget::Memory => None,
        };
        tokio::spawn(async move {
            if let Some(part) = part {
                if let Err(err) = tokio::fs::remove_file(&part).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %part.display(), error = %err, "could not remove partial file");
                    }
                }
            }
            if let Some(store) = &state.resume {
                if let Err(err) = store.remove(&tag).await {
                    debug!(transfer = %id, error = %err, "could not remove resume record");
                }
            }
            state.forget(id);
        });
    }
}

impl TaskBody for DownloadFile {
    fn group(&self) -> GroupId {
        self.transfer.id()
    }

    fn validate(&self) -> bool {
        !self.transfer.is_paused()
    }

    fn is_stale(&self) -> bool {
        self.transfer.is_cancelled() || self.transfer.phase().is_terminal()
    }

    fn run(self: Arc<Self>, _ctx: TaskContext) -> BoxFuture<'static, TaskOutcome> {
        self.coordinate().boxed()
    }

    fn destroy(&self) {
        if self.transfer.is_cancelled() && !self.driving.load(Ordering::Acquire) {
            self.discard_orphan();
        }
    }

    fn describe(&self) -> String {
        format!("{} download {}", self.transfer.id(), self.handle)
    }
}
