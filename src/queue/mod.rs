/*!
 * Concurrency-limited work queue
 *
 * Tasks wait in a FIFO and are started while fewer than `limit` of them
 * hold a slot. Tasks belong to groups (one per transfer), and a group can
 * be paused: its queued entries move to a paused bucket, its running
 * entries are aborted and put back in front of that bucket.
 *
 * Admission also stops while the queue is paused globally. While any
 * throttle source (a backpressured sink) is active only entries that
 * bypass the throttle are started.
 */

pub mod task;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::config::QueueConfig;
use crate::transfer::{EventPublisher, TransferEvent};

pub use task::{GroupId, QueueTask, TaskContext, TaskId, TaskOutcome};

/// Static queue parameters
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub name: String,
    pub limit: usize,
    pub empty_scan_cap: usize,
    pub empty_scan_delay: Duration,
    pub early_release: bool,
    pub max_expansion: usize,
}

impl QueueSettings {
    pub fn downloads(config: &QueueConfig) -> Self {
        Self::from_config("downloads", config.download_limit, config)
    }

    pub fn uploads(config: &QueueConfig) -> Self {
        Self::from_config("uploads", config.upload_limit, config)
    }

    fn from_config(name: &str, limit: usize, config: &QueueConfig) -> Self {
        Self {
            name: name.to_string(),
            limit: limit.max(1),
            empty_scan_cap: config.empty_scan_cap.max(1),
            empty_scan_delay: Duration::from_millis(config.empty_scan_delay_ms),
            early_release: config.early_release,
            max_expansion: config.max_expansion,
        }
    }
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub paused: usize,
    /// Tasks holding a slot
    pub running: usize,
    /// Slots temporarily added by early release
    pub expanded: usize,
    /// Tasks executing, including early-released ones
    pub in_flight: usize,
    pub limit: usize,
    pub globally_paused: bool,
    pub throttled: bool,
}

struct Entry<T> {
    id: TaskId,
    task: T,
}

struct Working<T> {
    task: T,
    group: GroupId,
    abort: Option<AbortHandle>,
    released: bool,
}

struct QueueState<T> {
    pending: VecDeque<Entry<T>>,
    paused_groups: HashMap<GroupId, VecDeque<Entry<T>>>,
    working: HashMap<TaskId, Working<T>>,
    running: usize,
    running_by_group: HashMap<GroupId, usize>,
    expanded: usize,
    paused: bool,
    throttles: HashSet<String>,
    rescan_scheduled: bool,
    next_id: u64,
    peak_in_flight: usize,
}

impl<T> QueueState<T> {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            paused_groups: HashMap::new(),
            working: HashMap::new(),
            running: 0,
            running_by_group: HashMap::new(),
            expanded: 0,
            paused: false,
            throttles: HashSet::new(),
            rescan_scheduled: false,
            next_id: 1,
            peak_in_flight: 0,
        }
    }

    fn next_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Give back the slot (or expansion) a finished or aborted task held.
    fn release_slot(&mut self, group: GroupId, released: bool) {
        if released {
            self.expanded = self.expanded.saturating_sub(1);
        } else {
            self.running = self.running.saturating_sub(1);
        }
        if let Some(count) = self.running_by_group.get_mut(&group) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.running_by_group.remove(&group);
            }
        }
    }

    fn requeue_front(&mut self, group: GroupId, entry: Entry<T>) {
        match self.paused_groups.get_mut(&group) {
            Some(bucket) => bucket.push_front(entry),
            None => self.pending.push_front(entry),
        }
    }
}

struct QueueInner<T> {
    settings: QueueSettings,
    state: Mutex<QueueState<T>>,
    events: EventPublisher,
}

/// Shared handle to a work queue
pub struct WorkQueue<T: QueueTask> {
    inner: Arc<QueueInner<T>>,
}

impl<T: QueueTask> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: QueueTask> WorkQueue<T> {
    pub fn new(settings: QueueSettings, events: EventPublisher) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                settings,
                state: Mutex::new(QueueState::new()),
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    pub fn limit(&self) -> usize {
        self.inner.settings.limit
    }

    /// Append a task and start whatever fits
    pub fn push(&self, task: T) {
        self.push_many(std::iter::once(task));
    }

    pub fn push_many(&self, tasks: impl IntoIterator<Item = T>) {
        {
            let mut state = self.inner.state.lock();
            let mut announced = HashSet::new();
            for task in tasks {
                let group = task.group();
                let entry = Entry {
                    id: state.next_id(),
                    task,
                };
                match state.paused_groups.get_mut(&group) {
                    Some(bucket) => bucket.push_back(entry),
                    None => state.pending.push_back(entry),
                }
                if announced.insert(group) {
                    self.inner.events.publish(TransferEvent::Queued { id: group });
                }
            }
        }
        self.process();
    }

    /// Insert at the head of the queue (or of the group's paused bucket)
    pub fn push_first(&self, task: T) {
        {
            let mut state = self.inner.state.lock();
            let group = task.group();
            let entry = Entry {
                id: state.next_id(),
                task,
            };
            state.requeue_front(group, entry);
        }
        self.process();
    }

    /// Pause one group, aborting its running tasks.
    ///
    /// Returns how many in-flight tasks were aborted.
    pub fn pause_group(&self, group: GroupId) -> usize {
        let aborted = {
            let mut state = self.inner.state.lock();

            let mut interrupted: Vec<(TaskId, Working<T>)> = Vec::new();
            let ids: Vec<TaskId> = state
                .working
                .iter()
                .filter(|(_, w)| w.group == group)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(w) = state.working.remove(&id) {
                    interrupted.push((id, w));
                }
            }
            interrupted.sort_by_key(|(id, _)| *id);

            let mut bucket: VecDeque<Entry<T>> = VecDeque::new();
            for (id, w) in interrupted.iter() {
                if let Some(abort) = &w.abort {
                    abort.abort();
                }
                state.release_slot(group, w.released);
                w.task.interrupted();
                bucket.push_back(Entry {
                    id: *id,
                    task: w.task.clone(),
                });
            }
            state.running_by_group.remove(&group);

            let (mine, others): (VecDeque<_>, VecDeque<_>) = state
                .pending
                .drain(..)
                .partition(|entry| entry.task.group() == group);
            state.pending = others;
            bucket.extend(mine);
            if let Some(existing) = state.paused_groups.remove(&group) {
                bucket.extend(existing);
            }
            state.paused_groups.insert(group, bucket);

            debug!(
                queue = %self.inner.settings.name,
                group = %group,
                aborted = interrupted.len(),
                "group paused"
            );
            interrupted.len()
        };
        self.inner.events.publish(TransferEvent::Paused { id: group });
        self.process();
        aborted
    }

    /// Move a paused group's entries back to the front, in their original order
    pub fn resume_group(&self, group: GroupId) {
        let resumed = {
            let mut state = self.inner.state.lock();
            match state.paused_groups.remove(&group) {
                Some(bucket) => {
                    for entry in bucket.into_iter().rev() {
                        state.pending.push_front(entry);
                    }
                    true
                }
                None => false,
            }
        };
        if resumed {
            debug!(queue = %self.inner.settings.name, group = %group, "group resumed");
            self.inner.events.publish(TransferEvent::Resumed { id: group });
            self.process();
        }
    }

    /// Resume several groups so that their work is served in the given order
    pub fn resume_groups(&self, groups: &[GroupId]) {
        let resumed: Vec<GroupId> = {
            let mut state = self.inner.state.lock();
            let mut front: VecDeque<Entry<T>> = VecDeque::new();
            let mut resumed = Vec::new();
            for group in groups {
                if let Some(bucket) = state.paused_groups.remove(group) {
                    front.extend(bucket);
                    resumed.push(*group);
                }
            }
            for entry in front.into_iter().rev() {
                state.pending.push_front(entry);
            }
            resumed
        };
        for group in &resumed {
            self.inner.events.publish(TransferEvent::Resumed { id: *group });
        }
        if !resumed.is_empty() {
            debug!(queue = %self.inner.settings.name, groups = resumed.len(), "groups resumed");
            self.process();
        }
    }

    pub fn is_group_paused(&self, group: GroupId) -> bool {
        self.inner.state.lock().paused_groups.contains_key(&group)
    }

    /// Stop admitting tasks; running ones continue
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        self.process();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Remove and destroy a group's queued and paused tasks
    pub fn filter(&self, group: GroupId) -> usize {
        let removed: Vec<Entry<T>> = {
            let mut state = self.inner.state.lock();
            let (mine, others): (VecDeque<_>, VecDeque<_>) = state
                .pending
                .drain(..)
                .partition(|entry| entry.task.group() == group);
            state.pending = others;
            let mut removed: Vec<Entry<T>> = mine.into_iter().collect();
            if let Some(bucket) = state.paused_groups.remove(&group) {
                removed.extend(bucket);
            }
            removed
        };
        for entry in &removed {
            entry.task.destroy();
        }
        removed.len()
    }

    /// Filter a group and abort whatever of it is running
    pub fn cancel_group(&self, group: GroupId) -> usize {
        let mut count = self.filter(group);
        let aborted: Vec<Working<T>> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<TaskId> = state
                .working
                .iter()
                .filter(|(_, w)| w.group == group)
                .map(|(id, _)| *id)
                .collect();
            let mut aborted = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(w) = state.working.remove(&id) {
                    state.release_slot(group, w.released);
                    aborted.push(w);
                }
            }
            aborted
        };
        for w in &aborted {
            if let Some(abort) = &w.abort {
                abort.abort();
            }
            w.task.destroy();
        }
        count += aborted.len();
        self.process();
        count
    }

    /// Hold admission while `source` is throttling
    pub fn set_throttle(&self, source: &str, on: bool) {
        let changed = {
            let mut state = self.inner.state.lock();
            if on {
                state.throttles.insert(source.to_string())
            } else {
                state.throttles.remove(source)
            }
        };
        if changed {
            trace!(queue = %self.inner.settings.name, source, on, "throttle changed");
            if !on {
                self.process();
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            pending: state.pending.len(),
            paused: state.paused_groups.values().map(VecDeque::len).sum(),
            running: state.running,
            expanded: state.expanded,
            in_flight: state.working.len(),
            limit: self.inner.settings.limit,
            globally_paused: state.paused,
            throttled: !state.throttles.is_empty(),
        }
    }

    /// Tasks of `group` currently executing
    pub fn running_for(&self, group: GroupId) -> usize {
        self.inner
            .state
            .lock()
            .running_by_group
            .get(&group)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of simultaneously executing tasks seen so far
    pub fn peak_in_flight(&self) -> usize {
        self.inner.state.lock().peak_in_flight
    }

    /// Unpaused groups with running or queued work, oldest first
    pub fn active_groups(&self) -> Vec<GroupId> {
        let state = self.inner.state.lock();
        let mut working: Vec<(TaskId, GroupId)> =
            state.working.iter().map(|(id, w)| (*id, w.group)).collect();
        working.sort();

        let mut seen = HashSet::new();
        working
            .into_iter()
            .map(|(_, group)| group)
            .chain(state.pending.iter().map(|entry| entry.task.group()))
            .filter(|group| seen.insert(*group))
            .collect()
    }

    /// Start every valid entry that fits
    pub fn process(&self) {
        let settings = &self.inner.settings;
        let mut schedule_rescan = false;
        {
            let mut state = self.inner.state.lock();
            if state.paused {
                return;
            }
            let throttled = !state.throttles.is_empty();

            let mut idx = 0;
            let mut consecutive_invalid = 0;
            let mut skipped_any = false;
            while state.running < settings.limit && idx < state.pending.len() {
                if state.pending[idx].task.is_stale() {
                    if let Some(entry) = state.pending.remove(idx) {
                        entry.task.destroy();
                    }
                    continue;
                }
                if throttled && !state.pending[idx].task.bypasses_throttle() {
                    idx += 1;
                    continue;
                }
                if !state.pending[idx].task.validate() {
                    idx += 1;
                    skipped_any = true;
                    consecutive_invalid += 1;
                    if consecutive_invalid >= settings.empty_scan_cap {
                        break;
                    }
                    continue;
                }
                consecutive_invalid = 0;
                if let Some(entry) = state.pending.remove(idx) {
                    self.start_locked(&mut state, entry);
                }
            }

            if skipped_any && state.running < settings.limit && !state.rescan_scheduled {
                state.rescan_scheduled = true;
                schedule_rescan = true;
            }
        }

        if schedule_rescan {
            let weak = Arc::downgrade(&self.inner);
            let delay = settings.empty_scan_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    inner.state.lock().rescan_scheduled = false;
                    WorkQueue { inner }.process();
                }
            });
        }
    }

    fn start_locked(&self, state: &mut QueueState<T>, entry: Entry<T>) {
        let group = entry.task.group();
        let id = entry.id;

        state.running += 1;
        *state.running_by_group.entry(group).or_insert(0) += 1;

        let ctx = TaskContext::new(id, self.release_fn());
        let future = entry.task.run(ctx);
        let queue = self.clone();
        let handle = tokio::spawn(async move {
            let outcome = future.await;
            queue.finish(id, outcome);
        });

        state.working.insert(
            id,
            Working {
                task: entry.task,
                group,
                abort: Some(handle.abort_handle()),
                released: false,
            },
        );
        state.peak_in_flight = state.peak_in_flight.max(state.working.len());
        trace!(queue = %self.inner.settings.name, task = %id, group = %group, "task started");
        self.inner.events.publish(TransferEvent::Working { id: group });
    }

    fn release_fn(&self) -> Arc<dyn Fn(TaskId) -> bool + Send + Sync> {
        let weak: Weak<QueueInner<T>> = Arc::downgrade(&self.inner);
        Arc::new(move |id| match weak.upgrade() {
            Some(inner) => WorkQueue { inner }.release_early(id),
            None => false,
        })
    }

    /// Free a running task's slot while it keeps executing
    fn release_early(&self, id: TaskId) -> bool {
        let settings = &self.inner.settings;
        if !settings.early_release {
            return false;
        }
        {
            let mut state = self.inner.state.lock();
            if state.expanded >= settings.max_expansion {
                return false;
            }
            match state.working.get_mut(&id) {
                Some(w) if !w.released => w.released = true,
                _ => return false,
            }
            state.running = state.running.saturating_sub(1);
            state.expanded += 1;
            trace!(queue = %settings.name, task = %id, expanded = state.expanded, "slot released early");
        }
        self.process();
        true
    }

    fn finish(&self, id: TaskId, outcome: TaskOutcome) {
        let mut delayed = None;
        {
            let mut state = self.inner.state.lock();
            // Missing means a pause or cancel already took the entry back.
            let Some(w) = state.working.remove(&id) else {
                return;
            };
            state.release_slot(w.group, w.released);

            match outcome {
                TaskOutcome::Completed => {}
                TaskOutcome::Retry { after } if after.is_zero() => {
                    state.requeue_front(w.group, Entry { id, task: w.task });
                }
                TaskOutcome::Retry { after } => {
                    delayed = Some((after, Entry { id, task: w.task }));
                }
                TaskOutcome::Failed(err) => {
                    warn!(
                        queue = %self.inner.settings.name,
                        task = %w.task.describe(),
                        error = %err,
                        "task failed"
                    );
                    w.task.destroy();
                }
                TaskOutcome::Aborted => w.task.destroy(),
            }
        }

        if let Some((after, entry)) = delayed {
            let weak = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                if let Some(inner) = weak.upgrade() {
                    let queue = WorkQueue { inner };
                    {
                        let mut state = queue.inner.state.lock();
                        let group = entry.task.group();
                        state.requeue_front(group, entry);
                    }
                    queue.process();
                }
            });
        }
        self.process();
    }
}
