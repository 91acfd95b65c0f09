/*!
 * Transfer event publisher
 *
 * Lifecycle and progress notifications flow to subscribers over an
 * unbounded channel. Publishing never blocks and never fails: a dropped
 * subscriber simply stops receiving.
 */

use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::{Direction, TransferId};
use crate::error::{ErrorCategory, TransferError};

/// Point-in-time progress of one transfer
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub id: TransferId,
    pub percent: f64,
    /// Bytes received or sent, including in-flight chunks
    pub loaded: u64,
    pub total: u64,
    /// Bytes per second over the recent window
    pub speed: f64,
    /// Durable byte offset
    pub position: u64,
}

/// Lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// A task of this transfer entered a queue
    Queued { id: TransferId },

    /// Size is known and chunk work is about to begin
    Start {
        id: TransferId,
        direction: Direction,
        name: String,
        size: u64,
    },

    /// A task of this transfer took a queue slot
    Working { id: TransferId },

    Progress(ProgressUpdate),

    Paused { id: TransferId },

    Resumed { id: TransferId },

    /// The backend refused more transfer; the queue is held
    Overquota {
        direction: Direction,
        retry_after: Option<Duration>,
    },

    OverquotaCleared { direction: Direction },

    /// Data is verified; the artifact is about to be committed
    BeforeComplete { id: TransferId },

    Complete { id: TransferId, size: u64 },

    Error {
        id: TransferId,
        message: String,
        category: ErrorCategory,
    },

    Cancelled { id: TransferId },
}

impl TransferEvent {
    pub fn error(id: TransferId, err: &TransferError) -> Self {
        TransferEvent::Error {
            id,
            message: err.to_string(),
            category: err.category(),
        }
    }

    /// Transfer this event concerns, if any
    pub fn transfer_id(&self) -> Option<TransferId> {
        match self {
            TransferEvent::Queued { id }
            | TransferEvent::Start { id, .. }
            | TransferEvent::Working { id }
            | TransferEvent::Paused { id }
            | TransferEvent::Resumed { id }
            | TransferEvent::BeforeComplete { id }
            | TransferEvent::Complete { id, .. }
            | TransferEvent::Error { id, .. }
            | TransferEvent::Cancelled { id } => Some(*id),
            TransferEvent::Progress(update) => Some(update.id),
            TransferEvent::Overquota { .. } | TransferEvent::OverquotaCleared { .. } => None,
        }
    }
}

/// Event publisher - sends events to the subscriber
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: Option<UnboundedSender<TransferEvent>>,
}

impl EventPublisher {
    /// Create a publisher and its subscriber
    pub fn channel() -> (Self, EventSubscriber) {
        let (tx, rx) = unbounded_channel();
        (
            EventPublisher { sender: Some(tx) },
            EventSubscriber { receiver: rx },
        )
    }

    /// Create a no-op publisher
    pub fn noop() -> Self {
        EventPublisher { sender: None }
    }

    /// Publish an event
    pub fn publish(&self, event: TransferEvent) {
        if let Some(ref tx) = self.sender {
            let _ = tx.send(event); // Subscriber may have dropped
        }
    }
}

/// Event subscriber - receives events
#[derive(Debug)]
pub struct EventSubscriber {
    receiver: UnboundedReceiver<TransferEvent>,
}

impl EventSubscriber {
    /// Wait for the next event; `None` once every publisher is gone
    pub async fn recv(&mut self) -> Option<TransferEvent> {
        self.receiver.recv().await
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&mut self) -> Option<TransferEvent> {
        self.receiver.try_recv().ok()
    }

    /// Everything already published
    pub fn drain(&mut self) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let (publisher, mut subscriber) = EventPublisher::channel();
        let id = TransferId(7);
        publisher.publish(TransferEvent::Queued { id });
        publisher.publish(TransferEvent::Complete { id, size: 10 });

        assert_eq!(subscriber.recv().await, Some(TransferEvent::Queued { id }));
        let rest = subscriber.drain();
        assert_eq!(rest, vec![TransferEvent::Complete { id, size: 10 }]);
    }

    #[test]
    fn test_noop_publisher() {
        EventPublisher::noop().publish(TransferEvent::Working { id: TransferId(1) });
    }

    #[test]
    fn test_dropped_subscriber_is_ignored() {
        let (publisher, subscriber) = EventPublisher::channel();
        drop(subscriber);
        publisher.publish(TransferEvent::Paused { id: TransferId(1) });
    }

    #[test]
    fn test_error_event() {
        let event = TransferEvent::error(TransferId(3), &TransferError::Integrity("mac".into()));
        match event {
            TransferEvent::Error { id, category, .. } => {
                assert_eq!(id, TransferId(3));
                assert_eq!(category, ErrorCategory::Integrity);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            TransferEvent::OverquotaCleared {
                direction: Direction::Download
            }
            .transfer_id(),
            None
        );
    }
}
