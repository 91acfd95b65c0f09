//! Uploads
//!
//! [`UploadManager::enqueue`] registers a transfer and queues its
//! [`UploadFile`] coordinator. Chunks are read and encrypted ahead of the
//! network by a bounded [`ReadAhead`] pipeline and posted to the ticket's
//! URL at their offset.

pub mod chunk;
pub mod file;
pub mod pipeline;
pub mod source;

use std::sync::Arc;

use crate::crypto::UploadKey;
use crate::queue::QueueStats;
use crate::scheduler::{Coordinator, SchedulerState, Task};
use crate::transfer::{Direction, TransferHandle};

pub use chunk::UploadChunk;
pub use file::UploadFile;
pub use pipeline::{Prepared, ReadAhead};
pub use source::{FileSource, MemorySource, UploadSource};

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub source: Arc<dyn UploadSource>,
    /// Name of the node to create
    pub name: String,
    /// Folder to create the node in
    pub parent: Option<String>,
    /// Fixed key, mainly for tests; a random one is generated otherwise
    pub key: Option<UploadKey>,
}

impl UploadRequest {
    pub fn new(source: Arc<dyn UploadSource>, name: impl Into<String>) -> Self {
        Self {
            source,
            name: name.into(),
            parent: None,
            key: None,
        }
    }
}

/// Queues uploads on a scheduler
#[derive(Clone)]
pub struct UploadManager {
    state: Arc<SchedulerState>,
}

impl UploadManager {
    pub(crate) fn new(state: Arc<SchedulerState>) -> Self {
        Self { state }
    }

    pub fn enqueue(&self, request: UploadRequest) -> TransferHandle {
        let transfer = self.state.register(Direction::Upload, &request.name);
        let file = UploadFile::new(self.state.clone(), transfer.clone(), request);
        self.state
            .uploads
            .push(Task::FileCoordinator(Coordinator::Upload(file)));
        TransferHandle::new(transfer)
    }

    pub fn stats(&self) -> QueueStats {
        self.state.uploads.stats()
    }
}
