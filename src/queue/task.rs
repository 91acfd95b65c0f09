//! Task contract for the work queue

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::TransferError;
use crate::transfer::TransferId;

/// Tasks are grouped by the transfer they belong to
pub type GroupId = TransferId;

/// Queue-assigned identity of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// How a task run ended
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed,
    /// Requeue at the front after the delay
    Retry { after: Duration },
    /// The task already reported the failure to its transfer
    Failed(TransferError),
    /// The task's transfer is gone; drop it
    Aborted,
}

/// Unit of work the queue can schedule.
///
/// Tasks are cheap handles (usually `Arc`s) so the queue can keep a copy
/// for requeueing while a run is in flight.
pub trait QueueTask: Clone + Send + Sync + 'static {
    fn group(&self) -> GroupId;

    /// Whether the task may start now. Invalid entries are skipped in place.
    fn validate(&self) -> bool;

    /// Whether the task can never run again; stale entries are dropped.
    fn is_stale(&self) -> bool {
        false
    }

    /// Whether the task may start while the queue is throttled. The entry
    /// the sink is waiting on must not sit behind its own backpressure.
    fn bypasses_throttle(&self) -> bool {
        false
    }

    fn run(&self, ctx: TaskContext) -> BoxFuture<'static, TaskOutcome>;

    /// A run was aborted before finishing; the task will be requeued.
    fn interrupted(&self) {}

    /// The task is leaving the queue for good without completing.
    fn destroy(&self) {}

    fn describe(&self) -> String;
}

type ReleaseFn = dyn Fn(TaskId) -> bool + Send + Sync;

/// Handle a running task uses to talk back to its queue
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    release: Arc<ReleaseFn>,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, release: Arc<ReleaseFn>) -> Self {
        Self { id, release }
    }

    /// Context not attached to any queue; early release is always refused.
    pub fn detached() -> Self {
        Self {
            id: TaskId(0),
            release: Arc::new(|_| false),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Offer this task's slot back while it finishes.
    ///
    /// Returns true if the queue accepted and temporarily expanded.
    pub fn release_early(&self) -> bool {
        (self.release)(self.id)
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext").field("id", &self.id).finish()
    }
}
