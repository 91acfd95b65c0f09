/*!
 * Scheduler state and task dispatch
 *
 * One [`SchedulerState`] owns everything transfers share: the two work
 * queues, the progress table, the event publisher, the overquota gates and
 * the registry of live transfers. Components reach it through an `Arc`,
 * never through globals.
 *
 * Queues hold [`Task`] values, a tagged union over chunk fetches, chunk
 * uploads and the per-file coordinators that plan them.
 */

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::download::{DownloadChunk, DownloadFile, DownloadManager};
use crate::error::Result;
use crate::net::{HttpTransport, StorageApi};
use crate::queue::{GroupId, QueueSettings, QueueStats, QueueTask, TaskContext, TaskOutcome, WorkQueue};
use crate::sink::SinkWriter;
use crate::transfer::{
    Direction, EventPublisher, EventSubscriber, OverquotaGate, ProgressTable, ProgressUpdate,
    ResumeStore, Selector, Transfer, TransferEvent, TransferId,
};
use crate::upload::{UploadChunk, UploadFile, UploadManager};

/// Behaviour every queued unit provides
pub(crate) trait TaskBody: Send + Sync + 'static {
    fn group(&self) -> GroupId;

    fn validate(&self) -> bool {
        true
    }

    fn is_stale(&self) -> bool;

    fn bypasses_throttle(&self) -> bool {
        false
    }

    fn run(self: Arc<Self>, ctx: TaskContext) -> BoxFuture<'static, TaskOutcome>;

    fn interrupted(&self) {}

    fn destroy(&self) {}

    fn describe(&self) -> String;
}

/// File-level task: acquires URLs or a ticket, plans chunks, pushes them
#[derive(Clone)]
pub enum Coordinator {
    Download(Arc<DownloadFile>),
    Upload(Arc<UploadFile>),
}

/// Anything a work queue can run
#[derive(Clone)]
pub enum Task {
    ChunkFetch(Arc<DownloadChunk>),
    ChunkUpload(Arc<UploadChunk>),
    FileCoordinator(Coordinator),
}

impl Task {
    fn body(&self) -> &dyn TaskBody {
        match self {
            Task::ChunkFetch(chunk) => chunk.as_ref(),
            Task::ChunkUpload(chunk) => chunk.as_ref(),
            Task::FileCoordinator(Coordinator::Download(file)) => file.as_ref(),
            Task::FileCoordinator(Coordinator::Upload(file)) => file.as_ref(),
        }
    }
}

impl QueueTask for Task {
    fn group(&self) -> GroupId {
        self.body().group()
    }

    fn validate(&self) -> bool {
        self.body().validate()
    }

    fn is_stale(&self) -> bool {
        self.body().is_stale()
    }

    fn bypasses_throttle(&self) -> bool {
        self.body().bypasses_throttle()
    }

    fn run(&self, ctx: TaskContext) -> BoxFuture<'static, TaskOutcome> {
        match self {
            Task::ChunkFetch(chunk) => chunk.clone().run(ctx),
            Task::ChunkUpload(chunk) => chunk.clone().run(ctx),
            Task::FileCoordinator(Coordinator::Download(file)) => file.clone().run(ctx),
            Task::FileCoordinator(Coordinator::Upload(file)) => file.clone().run(ctx),
        }
    }

    fn interrupted(&self) {
        self.body().interrupted()
    }

    fn destroy(&self) {
        self.body().destroy()
    }

    fn describe(&self) -> String {
        self.body().describe()
    }
}

/// State shared by every transfer of one scheduler
pub struct SchedulerState {
    pub(crate) config: EngineConfig,
    pub(crate) http: Arc<dyn HttpTransport>,
    pub(crate) api: Arc<dyn StorageApi>,
    pub(crate) resume: Option<Arc<dyn ResumeStore>>,
    pub(crate) downloads: WorkQueue<Task>,
    pub(crate) uploads: WorkQueue<Task>,
    pub(crate) progress: Arc<ProgressTable>,
    pub(crate) events: EventPublisher,
    pub(crate) download_gate: Arc<OverquotaGate>,
    pub(crate) upload_gate: Arc<OverquotaGate>,
    transfers: Mutex<BTreeMap<TransferId, Arc<Transfer>>>,
    sinks: Mutex<BTreeMap<TransferId, SinkWriter>>,
    next_id: AtomicU64,
}

impl SchedulerState {
    pub(crate) fn queue(&self, direction: Direction) -> &WorkQueue<Task> {
        match direction {
            Direction::Download => &self.downloads,
            Direction::Upload => &self.uploads,
        }
    }

    pub(crate) fn gate(&self, direction: Direction) -> &Arc<OverquotaGate> {
        match direction {
            Direction::Download => &self.download_gate,
            Direction::Upload => &self.upload_gate,
        }
    }

    /// Create and track a new transfer
    pub(crate) fn register(&self, direction: Direction, name: &str) -> Arc<Transfer> {
        let id = TransferId(self.next_id.fetch_add(1, Ordering::AcqRel));
        let transfer = Transfer::new(id, direction, name);
        self.transfers.lock().insert(id, transfer.clone());
        debug!(transfer = %id, %direction, name, "transfer registered");
        transfer
    }

    /// Track the writer of a live download so cancellation can close it
    pub(crate) fn attach_sink(&self, id: TransferId, writer: SinkWriter) {
        self.sinks.lock().insert(id, writer);
    }

    fn close_sink(&self, id: TransferId) {
        let writer = self.sinks.lock().remove(&id);
        if let Some(writer) = writer {
            writer.close();
        }
    }

    /// Drop a finished transfer's shared entries
    pub(crate) fn forget(&self, id: TransferId) {
        self.transfers.lock().remove(&id);
        self.sinks.lock().remove(&id);
        self.progress.remove(id);
    }

    /// Hold the queue of `direction` until quota is back
    pub(crate) fn enter_overquota(&self, direction: Direction, retry_after: Option<std::time::Duration>) {
        self.gate(direction).enter(self.queue(direction), retry_after);
    }

    fn selected(&self, selector: &Selector) -> Vec<Arc<Transfer>> {
        self.transfers
            .lock()
            .values()
            .filter(|t| selector.matches(t.id()))
            .cloned()
            .collect()
    }
}

/// Entry point: owns the shared state and hands out the direction managers
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        config: EngineConfig,
        http: Arc<dyn HttpTransport>,
        api: Arc<dyn StorageApi>,
        resume: Option<Arc<dyn ResumeStore>>,
    ) -> Result<(Self, EventSubscriber)> {
        config.validate()?;
        let (events, subscriber) = EventPublisher::channel();
        let progress = Arc::new(ProgressTable::new(std::time::Duration::from_millis(
            config.queue.progress_interval_ms,
        )));
        let overquota_wait = config.retry.overquota_retry();

        let state = SchedulerState {
            downloads: WorkQueue::new(QueueSettings::downloads(&config.queue), events.clone()),
            uploads: WorkQueue::new(QueueSettings::uploads(&config.queue), events.clone()),
            download_gate: OverquotaGate::new(Direction::Download, events.clone(), overquota_wait),
            upload_gate: OverquotaGate::new(Direction::Upload, events.clone(), overquota_wait),
            config,
            http,
            api,
            resume,
            progress,
            events,
            transfers: Mutex::new(BTreeMap::new()),
            sinks: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        };
        Ok((
            Self {
                state: Arc::new(state),
            },
            subscriber,
        ))
    }

    pub fn downloads(&self) -> DownloadManager {
        DownloadManager::new(self.state.clone())
    }

    pub fn uploads(&self) -> UploadManager {
        UploadManager::new(self.state.clone())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.state.config
    }

    /// Hold the selected transfers, aborting their running tasks
    pub fn pause(&self, selector: impl Into<Selector>) -> usize {
        let selected = self.state.selected(&selector.into());
        for transfer in &selected {
            transfer.set_paused(true);
            self.state.queue(transfer.direction()).pause_group(transfer.id());
        }
        selected.len()
    }

    pub fn resume(&self, selector: impl Into<Selector>) -> usize {
        let selected = self.state.selected(&selector.into());
        for transfer in &selected {
            transfer.set_paused(false);
            self.state.queue(transfer.direction()).resume_group(transfer.id());
        }
        selected.len()
    }

    /// Cancel the selected transfers; partial artifacts are discarded
    pub fn cancel(&self, selector: impl Into<Selector>) -> usize {
        let selected = self.state.selected(&selector.into());
        let mut cancelled = 0;
        for transfer in &selected {
            if !transfer.cancel() {
                continue;
            }
            cancelled += 1;
            let id = transfer.id();
            let removed = self.state.queue(transfer.direction()).cancel_group(id);
            self.state.close_sink(id);
            info!(transfer = %id, tasks = removed, "transfer cancelled");
            self.state.events.publish(TransferEvent::Cancelled { id });
        }
        cancelled
    }

    /// External signal that quota is available again
    pub fn clear_overquota(&self, direction: Direction) -> bool {
        self.state.gate(direction).clear(self.state.queue(direction))
    }

    pub fn is_overquota(&self, direction: Direction) -> bool {
        self.state.gate(direction).is_active()
    }

    /// Live transfers, oldest first
    pub fn active(&self) -> Vec<TransferId> {
        self.state.transfers.lock().keys().copied().collect()
    }

    pub fn progress(&self, id: TransferId) -> Option<ProgressUpdate> {
        self.state.progress.snapshot(id)
    }

    pub fn queue_stats(&self, direction: Direction) -> QueueStats {
        self.state.queue(direction).stats()
    }

    pub fn peak_in_flight(&self, direction: Direction) -> usize {
        self.state.queue(direction).peak_in_flight()
    }
}
