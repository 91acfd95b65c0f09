//! Overquota hold
//!
//! When the backend refuses more transfer every active group of the queue
//! is paused and admission stops. The hold is lifted by [`OverquotaGate::clear`]
//! (the caller detected that quota is available again) or by a timer when
//! the backend said how long to wait. Groups come back in the order they
//! were paused.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{info, warn};

use super::{Direction, EventPublisher, TransferEvent};
use crate::queue::{GroupId, QueueTask, WorkQueue};

#[derive(Debug, Default)]
struct GateState {
    active: bool,
    paused: Vec<GroupId>,
    timer: Option<AbortHandle>,
}

#[derive(Debug)]
pub struct OverquotaGate {
    direction: Direction,
    events: EventPublisher,
    /// Wait applied when the backend gives none
    default_wait: Option<Duration>,
    state: Mutex<GateState>,
}

impl OverquotaGate {
    pub fn new(direction: Direction, events: EventPublisher, default_wait: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            direction,
            events,
            default_wait,
            state: Mutex::new(GateState::default()),
        })
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Groups held by the gate, in pause order
    pub fn paused_groups(&self) -> Vec<GroupId> {
        self.state.lock().paused.clone()
    }

    /// Hold `queue`. Returns true if this call started the hold.
    ///
    /// Calling it again while held pauses whatever became active since.
    pub fn enter<T: QueueTask>(
        self: &Arc<Self>,
        queue: &WorkQueue<T>,
        retry_after: Option<Duration>,
    ) -> bool {
        queue.pause();
        let candidates = queue.active_groups();

        let (started, fresh) = {
            let mut state = self.state.lock();
            let started = !state.active;
            state.active = true;
            let fresh: Vec<GroupId> = candidates
                .into_iter()
                .filter(|group| !state.paused.contains(group))
                .collect();
            state.paused.extend(fresh.iter().copied());
            (started, fresh)
        };

        for group in &fresh {
            queue.pause_group(*group);
        }

        if started {
            let wait = retry_after.or(self.default_wait);
            warn!(direction = %self.direction, groups = fresh.len(), ?wait, "over quota, holding transfers");
            self.events.publish(TransferEvent::Overquota {
                direction: self.direction,
                retry_after: wait,
            });
            if let Some(wait) = wait {
                let gate = Arc::downgrade(self);
                let queue = queue.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    if let Some(gate) = gate.upgrade() {
                        gate.release(&queue, false);
                    }
                });
                self.state.lock().timer = Some(timer.abort_handle());
            }
        }
        started
    }

    /// Lift the hold; returns false if none was active
    pub fn clear<T: QueueTask>(&self, queue: &WorkQueue<T>) -> bool {
        self.release(queue, true)
    }

    fn release<T: QueueTask>(&self, queue: &WorkQueue<T>, abort_timer: bool) -> bool {
        let (groups, timer) = {
            let mut state = self.state.lock();
            if !state.active {
                return false;
            }
            state.active = false;
            (std::mem::take(&mut state.paused), state.timer.take())
        };
        if abort_timer {
            if let Some(timer) = timer {
                timer.abort();
            }
        }

        info!(direction = %self.direction, groups = groups.len(), "quota available, resuming transfers");
        queue.resume_groups(&groups);
        queue.resume();
        self.events.publish(TransferEvent::OverquotaCleared {
            direction: self.direction,
        });
        true
    }
}
