/*!
 * Per-file upload coordination
 *
 * The coordinator obtains an upload ticket (one POST target reused by all
 * of the file's chunks), plans the chunks, starts the read-ahead pipeline
 * and queues one [`UploadChunk`] per range. When the last chunk is
 * accepted the block MACs are condensed, the random upload key is
 * completed with the meta-MAC and the node is created.
 */

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::chunk::UploadChunk;
use super::pipeline::ReadAhead;
use super::source::UploadSource;
use super::UploadRequest;
use crate::crypto::{ChunkCipher, UploadKey};
use crate::error::{ErrorCategory, Result, TransferError};
use crate::net::{NodeRequest, PortSelector, StoredNode, UploadTicket};
use crate::queue::{GroupId, TaskContext, TaskOutcome};
use crate::scheduler::{SchedulerState, Task, TaskBody};
use crate::transfer::plan::plan_upload;
use crate::transfer::{Artifact, Direction, Transfer, TransferEvent, TransferPhase};

pub struct UploadFile {
    state: Arc<SchedulerState>,
    transfer: Arc<Transfer>,
    source: Arc<dyn UploadSource>,
    key: UploadKey,
    cipher: ChunkCipher,
    parent: Option<String>,
    ports: PortSelector,
    ticket: Mutex<Option<UploadTicket>>,
    ticket_attempts: AtomicU32,
    pipeline: Mutex<Option<Arc<ReadAhead>>>,
    token: Mutex<Option<String>>,
    /// Chunks not yet accepted by the storage host
    remaining: AtomicUsize,
    finishing: AtomicBool,
}

impl UploadFile {
    pub(crate) fn new(
        state: Arc<SchedulerState>,
        transfer: Arc<Transfer>,
        request: UploadRequest,
    ) -> Arc<Self> {
        let key = request.key.unwrap_or_else(UploadKey::generate);
        let ports = PortSelector::new(state.config.retry.alternate_port);
        Arc::new(Self {
            cipher: key.chunk_cipher(),
            key,
            source: request.source,
            parent: request.parent,
            ports,
            state,
            transfer,
            ticket: Mutex::new(None),
            ticket_attempts: AtomicU32::new(0),
            pipeline: Mutex::new(None),
            token: Mutex::new(None),
            remaining: AtomicUsize::new(0),
            finishing: AtomicBool::new(false),
        })
    }

    pub fn transfer(&self) -> &Arc<Transfer> {
        &self.transfer
    }

    pub(crate) fn state(&self) -> &Arc<SchedulerState> {
        &self.state
    }

    pub(crate) fn ports(&self) -> &PortSelector {
        &self.ports
    }

    pub(crate) fn post_url(&self) -> Option<String> {
        self.ticket.lock().as_ref().map(|t| t.post_url.clone())
    }

    pub(crate) fn pipeline(&self) -> Option<Arc<ReadAhead>> {
        self.pipeline.lock().clone()
    }

    fn shutdown_pipeline(&self) {
        let pipeline = self.pipeline.lock().take();
        if let Some(pipeline) = pipeline {
            pipeline.shutdown();
        }
    }

    /// Free buffers and shared entries of a cancelled upload
    pub(crate) fn release_cancelled(&self) {
        if self.transfer.is_cancelled() {
            self.shutdown_pipeline();
            self.state.forget(self.transfer.id());
        }
    }

    /// Fail the transfer once; later calls are ignored
    pub(crate) fn fail(&self, err: TransferError) {
        let id = self.transfer.id();
        if !self.transfer.fail(err.clone()) {
            return;
        }
        warn!(transfer = %id, error = %err, category = %err.category(), "upload failed");
        self.state.events.publish(TransferEvent::error(id, &err));
        self.state.uploads.filter(id);
        self.shutdown_pipeline();
        self.state.forget(id);
    }

    async fn fetch_ticket(&self, size: u64) -> Result<UploadTicket> {
        let attempt = self.ticket_attempts.load(Ordering::Acquire);
        let timeout = self.state.config.timeouts.api_call();
        match tokio::time::timeout(timeout, self.state.api.upload_ticket(size, attempt)).await {
            Ok(result) => result.map_err(TransferError::from),
            Err(_) => Err(TransferError::Timeout(timeout)),
        }
    }

    async fn coordinate(self: Arc<Self>) -> TaskOutcome {
        if self.is_stale() {
            return TaskOutcome::Aborted;
        }
        let size = self.source.len();
        self.transfer.set_size(size);

        let ticket = match self.fetch_ticket(size).await {
            Ok(ticket) => ticket,
            Err(err) => return self.ticket_failure(err),
        };
        self.ticket_attempts.store(0, Ordering::Release);
        if self.is_stale() {
            return TaskOutcome::Aborted;
        }
        self.start(ticket, size);
        TaskOutcome::Completed
    }

    fn ticket_failure(&self, err: TransferError) -> TaskOutcome {
        let retry = &self.state.config.retry;
        match err.category() {
            ErrorCategory::Overquota => {
                self.state.enter_overquota(Direction::Upload, err.retry_after());
                TaskOutcome::Retry {
                    after: Duration::ZERO,
                }
            }
            ErrorCategory::Cancelled => TaskOutcome::Aborted,
            ErrorCategory::TransientNetwork | ErrorCategory::LocalIo => {
                let attempts = self.ticket_attempts.fetch_add(1, Ordering::AcqRel) + 1;
                if attempts > retry.url_retry_limit {
                    let err = TransferError::RetriesExhausted {
                        attempts,
                        last: err.to_string(),
                    };
                    self.fail(err.clone());
                    return TaskOutcome::Failed(err);
                }
                let after = retry.url_backoff().delay_for(attempts);
                debug!(transfer = %self.transfer.id(), attempts, ?after, error = %err, "upload ticket request failed");
                TaskOutcome::Retry { after }
            }
            ErrorCategory::Fatal | ErrorCategory::Integrity => {
                self.fail(err.clone());
                TaskOutcome::Failed(err)
            }
        }
    }

    fn start(self: &Arc<Self>, ticket: UploadTicket, size: u64) {
        let id = self.transfer.id();
        *self.ticket.lock() = Some(ticket);
        self.state.events.publish(TransferEvent::Start {
            id,
            direction: Direction::Upload,
            name: self.transfer.name().to_string(),
            size,
        });
        self.transfer.advance_phase(TransferPhase::Planning);

        let chunks = plan_upload(size, &self.state.config.chunks);
        self.state.progress.register(id, size, 0);
        self.remaining.store(chunks.len(), Ordering::Release);
        let upload = &self.state.config.upload;
        let pipeline = ReadAhead::start(
            self.source.clone(),
            self.cipher.clone(),
            &chunks,
            upload.read_ahead_depth,
            upload.checksum_suffix,
        );
        *self.pipeline.lock() = Some(Arc::new(pipeline));
        self.transfer.advance_phase(TransferPhase::Transferring);
        info!(transfer = %id, size, chunks = chunks.len(), source = %self.source.describe(), "upload planned");

        let tasks: Vec<Task> = chunks
            .into_iter()
            .map(|chunk| Task::ChunkUpload(UploadChunk::new(self.clone(), chunk)))
            .collect();
        self.state.uploads.push_many(tasks);
    }

    /// Record an accepted chunk; the last one triggers node creation
    pub(crate) fn chunk_accepted(self: &Arc<Self>, token: Option<String>) {
        if let Some(token) = token {
            *self.token.lock() = Some(token);
        }
        let left = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .map_or(0, |previous| previous.saturating_sub(1));
        if left == 0 && !self.finishing.swap(true, Ordering::AcqRel) {
            tokio::spawn(self.clone().finish());
        }
    }

    async fn finish(self: Arc<Self>) {
        let id = self.transfer.id();
        self.shutdown_pipeline();
        self.transfer.advance_phase(TransferPhase::Verifying);

        let token = self.token.lock().clone();
        let Some(token) = token else {
            self.fail(TransferError::Malformed(
                "every chunk accepted but no completion token received".into(),
            ));
            return;
        };
        let macs = self.transfer.macs();
        let key = self.key.complete(self.cipher.meta_mac(macs.values()));

        self.transfer.advance_phase(TransferPhase::Finalizing);
        self.state.events.publish(TransferEvent::BeforeComplete { id });

        let request = NodeRequest {
            name: self.transfer.name().to_string(),
            completion_token: token,
            key: key.clone(),
            size: self.transfer.size(),
            parent: self.parent.clone(),
        };
        let node = match self.put_node(request).await {
            Ok(node) => node,
            Err(err) => {
                self.fail(err);
                return;
            }
        };
        if self.transfer.is_cancelled() {
            return;
        }

        self.state.forget(id);
        let size = self.transfer.size();
        self.state.events.publish(TransferEvent::Complete { id, size });
        if self.transfer.complete(Artifact::Node {
            handle: node.handle.clone(),
            key,
        }) {
            info!(transfer = %id, size, node = %node.handle, "upload complete");
        }
    }

    /// Create the node, retrying transient failures with the URL backoff
    async fn put_node(&self, request: NodeRequest) -> Result<StoredNode> {
        let retry = &self.state.config.retry;
        let timeout = self.state.config.timeouts.api_call();
        let mut attempts = 0;
        loop {
            let result = match tokio::time::timeout(timeout, self.state.api.put_node(request.clone())).await {
                Ok(result) => result.map_err(TransferError::from),
                Err(_) => Err(TransferError::Timeout(timeout)),
            };
            let err = match result {
                Ok(node) => return Ok(node),
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };
            attempts += 1;
            if attempts > retry.url_retry_limit {
                return Err(TransferError::RetriesExhausted {
                    attempts,
                    last: err.to_string(),
                });
            }
            if self.transfer.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let after = retry.url_backoff().delay_for(attempts);
            debug!(transfer = %self.transfer.id(), attempts, ?after, error = %err, "node creation failed");
            tokio::time::sleep(after).await;
        }
    }
}

impl TaskBody for UploadFile {
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
        self.release_cancelled();
    }

    fn describe(&self) -> String {
        format!("{} upload {}", self.transfer.id(), self.source.describe())
    }
}
