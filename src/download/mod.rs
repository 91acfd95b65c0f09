//! Downloads
//!
//! [`DownloadManager::enqueue`] registers a transfer and queues its
//! [`DownloadFile`] coordinator. The coordinator resolves the chunk URLs,
//! negotiates resume state against the target, starts the sink writer and
//! queues one [`DownloadChunk`] per planned range. A driver task waits for
//! the writer, verifies the condensed MAC and commits the artifact.

pub mod chunk;
pub mod file;

use std::path::PathBuf;
use std::sync::Arc;

use crate::crypto::FileKey;
use crate::queue::QueueStats;
use crate::scheduler::{Coordinator, SchedulerState, Task};
use crate::transfer::{Direction, TransferHandle};

pub use chunk::DownloadChunk;
pub use file::DownloadFile;

/// Where the plaintext goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    /// Written next to this path, renamed onto it once verified
    File(PathBuf),
    Memory,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Node handle passed to the backend for URL resolution
    pub handle: String,
    pub key: FileKey,
    pub target: DownloadTarget,
    /// Display name; the backend's name or the handle when absent
    pub name: Option<String>,
}

/// Queues downloads on a scheduler
#[derive(Clone)]
pub struct DownloadManager {
    state: Arc<SchedulerState>,
}

impl DownloadManager {
    pub(crate) fn new(state: Arc<SchedulerState>) -> Self {
        Self { state }
    }

    pub fn enqueue(&self, request: DownloadRequest) -> TransferHandle {
        let name = request.name.clone().unwrap_or_else(|| request.handle.clone());
        let transfer = self.state.register(Direction::Download, &name);
        let file = DownloadFile::new(self.state.clone(), transfer.clone(), request);
        self.state
            .downloads
            .push(Task::FileCoordinator(Coordinator::Download(file)));
        TransferHandle::new(transfer)
    }

    pub fn enqueue_many(&self, requests: impl IntoIterator<Item = DownloadRequest>) -> Vec<TransferHandle> {
        requests.into_iter().map(|r| self.enqueue(r)).collect()
    }

    pub fn stats(&self) -> QueueStats {
        self.state.downloads.stats()
    }
}
