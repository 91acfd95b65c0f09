/*!
 * Cumulus - chunked, encrypted cloud-storage transfers
 *
 * A transfer engine for files stored encrypted on a chunk-addressed backend:
 * - Bounded work queues with per-transfer pause, resume and cancel
 * - AES-CTR payloads authenticated by per-block CBC-MACs
 * - Resumable downloads with strictly ordered writes
 * - CloudRAID reads from six parity-striped hosts
 * - Pipelined uploads with bounded read-ahead
 * - Overquota holds, URL refresh and port fallback
 */

pub mod cli_progress;
pub mod config;
pub mod crypto;
pub mod download;
pub mod error;
pub mod logging;
pub mod net;
pub mod queue;
pub mod raid;
pub mod scheduler;
pub mod sink;
pub mod transfer;
pub mod upload;

// Re-export commonly used types
pub use config::EngineConfig;
pub use crypto::{FileKey, UploadKey};
pub use download::{DownloadManager, DownloadRequest, DownloadTarget};
pub use error::{ErrorCategory, Result, TransferError};
pub use net::{HttpTransport, ReqwestTransport, StaticTicketApi, StorageApi};
pub use scheduler::Scheduler;
pub use transfer::{
    Artifact, Direction, EventSubscriber, Selector, TransferEvent, TransferHandle, TransferId,
    TransferPhase, TransferSummary,
};
pub use upload::{FileSource, MemorySource, UploadManager, UploadRequest, UploadSource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
