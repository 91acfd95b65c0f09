//! Transfer lifecycle
//!
//! A [`Transfer`] is the state one file's download or upload shares between
//! its coordinator, its chunk tasks and its sink. Phases only ever move
//! forward:
//!
//! ```text
//! PendingUrl -> Planning -> Transferring -> Verifying -> Finalizing -> Done
//!      \____________\______________\_____________\____________\-> Cancelled | Failed
//! ```

pub mod events;
pub mod plan;
pub mod progress;
pub mod quota;
pub mod resume;
pub mod verify;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::crypto::{BlockMac, FileKey};
use crate::error::{Result, TransferError};

pub use events::{EventPublisher, EventSubscriber, ProgressUpdate, TransferEvent};
pub use plan::PlannedChunk;
pub use progress::ProgressTable;
pub use quota::OverquotaGate;
pub use resume::{JsonDirResumeStore, MemoryResumeStore, ResumeRecord, ResumeStore};
pub use verify::Verification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferPhase {
    PendingUrl,
    Planning,
    Transferring,
    Verifying,
    Finalizing,
    Done,
    Cancelled,
    Failed,
}

impl TransferPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferPhase::Done | TransferPhase::Cancelled | TransferPhase::Failed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            TransferPhase::PendingUrl => 0,
            TransferPhase::Planning => 1,
            TransferPhase::Transferring => 2,
            TransferPhase::Verifying => 3,
            TransferPhase::Finalizing => 4,
            TransferPhase::Done | TransferPhase::Cancelled | TransferPhase::Failed => 5,
        }
    }
}

/// Which transfers an operation applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    One(TransferId),
    Many(Vec<TransferId>),
}

impl Selector {
    pub fn matches(&self, id: TransferId) -> bool {
        match self {
            Selector::All => true,
            Selector::One(one) => *one == id,
            Selector::Many(ids) => ids.contains(&id),
        }
    }
}

impl From<TransferId> for Selector {
    fn from(id: TransferId) -> Self {
        Selector::One(id)
    }
}

impl From<Vec<TransferId>> for Selector {
    fn from(ids: Vec<TransferId>) -> Self {
        Selector::Many(ids)
    }
}

/// What a finished transfer produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Download committed to this path
    File(PathBuf),
    /// Download held in memory
    Memory(Bytes),
    /// Upload stored as a node, with the key that decrypts it
    Node { handle: String, key: FileKey },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferSummary {
    pub id: TransferId,
    pub direction: Direction,
    pub size: u64,
    pub artifact: Artifact,
    pub elapsed: Duration,
}

type Outcome = Option<std::result::Result<TransferSummary, TransferError>>;

/// Shared state of one file transfer
#[derive(Debug)]
pub struct Transfer {
    id: TransferId,
    direction: Direction,
    name: String,
    size: AtomicU64,
    cancelled: AtomicBool,
    paused: AtomicBool,
    byte_offset: AtomicU64,
    macs: Mutex<BTreeMap<u64, BlockMac>>,
    failures: AtomicU32,
    in_flight: AtomicUsize,
    phase: watch::Sender<TransferPhase>,
    outcome: watch::Sender<Outcome>,
    started: Instant,
}

impl Transfer {
    pub fn new(id: TransferId, direction: Direction, name: impl Into<String>) -> Arc<Self> {
        let (phase, _) = watch::channel(TransferPhase::PendingUrl);
        let (outcome, _) = watch::channel(None);
        Arc::new(Self {
            id,
            direction,
            name: name.into(),
            size: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            byte_offset: AtomicU64::new(0),
            macs: Mutex::new(BTreeMap::new()),
            failures: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            phase,
            outcome,
            started: Instant::now(),
        })
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    pub fn phase(&self) -> TransferPhase {
        *self.phase.borrow()
    }

    /// Move to `next`. Refuses to go backwards or leave a terminal phase.
    pub fn advance_phase(&self, next: TransferPhase) -> bool {
        self.phase.send_if_modified(|current| {
            if current.is_terminal() || next.rank() < current.rank() || *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    /// Wait until the phase reaches `target` or becomes terminal.
    pub async fn reached(&self, target: TransferPhase) -> TransferPhase {
        let mut rx = self.phase.subscribe();
        let result = rx
            .wait_for(|phase| phase.rank() >= target.rank() || phase.is_terminal())
            .await
            .map(|phase| *phase);
        result.unwrap_or_else(|_| self.phase())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Flag cancellation and resolve waiters. False if already finished.
    pub fn cancel(&self) -> bool {
        self.cancelled.store(true, Ordering::Release);
        if self.advance_phase(TransferPhase::Cancelled) {
            self.resolve(Err(TransferError::Cancelled));
            true
        } else {
            false
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn byte_offset(&self) -> u64 {
        self.byte_offset.load(Ordering::Acquire)
    }

    /// Move the durable offset forward. It may never shrink or pass the size.
    pub fn advance_offset(&self, offset: u64) -> Result<()> {
        let size = self.size();
        if offset > size {
            return Err(TransferError::LocalIo(format!(
                "offset {} beyond size {}",
                offset, size
            )));
        }
        let previous = self.byte_offset.fetch_max(offset, Ordering::AcqRel);
        if previous > offset {
            return Err(TransferError::LocalIo(format!(
                "offset moved backwards from {} to {}",
                previous, offset
            )));
        }
        Ok(())
    }

    /// Seed offset and MACs from a trusted resume record
    pub fn restore(&self, offset: u64, macs: BTreeMap<u64, BlockMac>) {
        self.byte_offset.store(offset, Ordering::Release);
        *self.macs.lock() = macs;
    }

    pub fn record_macs(&self, macs: &[(u64, BlockMac)]) {
        self.macs.lock().extend(macs.iter().copied());
    }

    pub fn macs(&self) -> BTreeMap<u64, BlockMac> {
        self.macs.lock().clone()
    }

    /// Count a chunk failure; returns the consecutive total
    pub fn note_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_failures(&self) {
        self.failures.store(0, Ordering::Release);
    }

    pub fn chunk_started(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn chunk_finished(&self) -> usize {
        let previous = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Fail the transfer. The first terminal outcome wins.
    pub fn fail(&self, err: TransferError) -> bool {
        if self.advance_phase(TransferPhase::Failed) {
            self.resolve(Err(err));
            true
        } else {
            false
        }
    }

    pub fn complete(&self, artifact: Artifact) -> bool {
        if self.advance_phase(TransferPhase::Done) {
            self.resolve(Ok(TransferSummary {
                id: self.id,
                direction: self.direction,
                size: self.size(),
                artifact,
                elapsed: self.started.elapsed(),
            }));
            true
        } else {
            false
        }
    }

    fn resolve(&self, result: std::result::Result<TransferSummary, TransferError>) {
        self.outcome.send_if_modified(|outcome| {
            if outcome.is_some() {
                false
            } else {
                *outcome = Some(result);
                true
            }
        });
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome.borrow().clone()
    }

    /// Wait for the terminal outcome
    pub async fn wait(&self) -> std::result::Result<TransferSummary, TransferError> {
        let mut rx = self.outcome.subscribe();
        let result = match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        result.unwrap_or(Err(TransferError::Cancelled))
    }
}

/// Counts a running chunk against its transfer until dropped, including
/// when the chunk's task is aborted
pub(crate) struct InFlightChunk(Arc<Transfer>);

impl InFlightChunk {
    pub(crate) fn enter(transfer: &Arc<Transfer>) -> Self {
        transfer.chunk_started();
        Self(transfer.clone())
    }
}

impl Drop for InFlightChunk {
    fn drop(&mut self) {
        self.0.chunk_finished();
    }
}

/// Caller-facing handle to an enqueued transfer
#[derive(Debug, Clone)]
pub struct TransferHandle {
    transfer: Arc<Transfer>,
}

impl TransferHandle {
    pub(crate) fn new(transfer: Arc<Transfer>) -> Self {
        Self { transfer }
    }

    pub fn id(&self) -> TransferId {
        self.transfer.id()
    }

    pub fn phase(&self) -> TransferPhase {
        self.transfer.phase()
    }

    pub fn transfer(&self) -> &Arc<Transfer> {
        &self.transfer
    }

    pub async fn wait(&self) -> std::result::Result<TransferSummary, TransferError> {
        self.transfer.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_only_moves_forward() {
        let transfer = Transfer::new(TransferId(1), Direction::Download, "a");
        assert!(transfer.advance_phase(TransferPhase::Planning));
        assert!(transfer.advance_phase(TransferPhase::Transferring));
        assert!(!transfer.advance_phase(TransferPhase::Planning));
        assert!(!transfer.advance_phase(TransferPhase::Transferring));
        assert!(transfer.advance_phase(TransferPhase::Verifying));
        assert_eq!(transfer.phase(), TransferPhase::Verifying);
    }

    #[test]
    fn test_terminal_phase_is_absorbing() {
        let transfer = Transfer::new(TransferId(2), Direction::Upload, "b");
        assert!(transfer.cancel());
        assert!(!transfer.cancel());
        assert!(!transfer.fail(TransferError::Network("late".into())));
        assert!(!transfer.advance_phase(TransferPhase::Done));
        assert_eq!(transfer.phase(), TransferPhase::Cancelled);
        assert_eq!(transfer.outcome(), Some(Err(TransferError::Cancelled)));
    }

    #[test]
    fn test_offset_is_monotonic_and_bounded() {
        let transfer = Transfer::new(TransferId(3), Direction::Download, "c");
        transfer.set_size(100);
        transfer.advance_offset(40).unwrap();
        transfer.advance_offset(40).unwrap();
        assert!(transfer.advance_offset(30).is_err());
        assert!(transfer.advance_offset(101).is_err());
        assert_eq!(transfer.byte_offset(), 40);
    }

    #[test]
    fn test_in_flight_counter_saturates() {
        let transfer = Transfer::new(TransferId(4), Direction::Download, "d");
        transfer.chunk_started();
        transfer.chunk_started();
        assert_eq!(transfer.chunk_finished(), 1);
        assert_eq!(transfer.chunk_finished(), 0);
        assert_eq!(transfer.chunk_finished(), 0);
    }

    #[tokio::test]
    async fn test_wait_resolves_on_complete() {
        let transfer = Transfer::new(TransferId(5), Direction::Download, "e");
        transfer.set_size(3);
        let waiter = {
            let transfer = transfer.clone();
            tokio::spawn(async move { transfer.wait().await })
        };
        assert!(transfer.complete(Artifact::Memory(Bytes::from_static(b"abc"))));
        let summary = waiter.await.unwrap().unwrap();
        assert_eq!(summary.size, 3);
        assert_eq!(summary.artifact, Artifact::Memory(Bytes::from_static(b"abc")));
    }

    #[tokio::test]
    async fn test_reached_returns_on_terminal() {
        let transfer = Transfer::new(TransferId(6), Direction::Download, "f");
        transfer.fail(TransferError::NotFound("x".into()));
        assert_eq!(
            transfer.reached(TransferPhase::Verifying).await,
            TransferPhase::Failed
        );
    }

    #[test]
    fn test_selector() {
        assert!(Selector::All.matches(TransferId(9)));
        assert!(Selector::from(TransferId(1)).matches(TransferId(1)));
        assert!(!Selector::One(TransferId(1)).matches(TransferId(2)));
        assert!(Selector::Many(vec![TransferId(1), TransferId(3)]).matches(TransferId(3)));
    }
}
