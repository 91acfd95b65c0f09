/*!
 * Bounded read-ahead for uploads
 *
 * A producer task walks the chunk plan in order, reading and encrypting
 * each chunk into a buffer while the network is busy with earlier ones.
 * Every buffer holds a permit of a semaphore sized `read_ahead_depth`, so
 * buffered-but-unsent data never exceeds that many chunks. A permit is
 * returned when the chunk's POST is accepted and its buffer dropped.
 *
 * Chunks the producer no longer covers (a failed read, a buffer discarded
 * after a malformed response) are read and encrypted on demand.
 */

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use super::source::UploadSource;
use crate::crypto::{upload_checksum, ChunkCipher, MacList};
use crate::error::{Result, TransferError};
use crate::transfer::PlannedChunk;

/// An encrypted chunk ready to post
#[derive(Debug)]
pub struct Prepared {
    pub chunk: PlannedChunk,
    pub data: Bytes,
    pub macs: MacList,
    pub checksum: Option<String>,
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug, Default)]
struct PipelineState {
    ready: HashMap<u64, Result<Prepared>>,
    /// Offsets the producer has yet to prepare
    upcoming: BTreeSet<u64>,
    stopped: bool,
}

#[derive(Debug)]
struct PipelineShared {
    source: Arc<dyn UploadSource>,
    cipher: ChunkCipher,
    checksums: bool,
    slots: Arc<Semaphore>,
    state: Mutex<PipelineState>,
    notify: Notify,
    encrypt_jobs: AtomicUsize,
}

#[derive(Debug)]
pub struct ReadAhead {
    shared: Arc<PipelineShared>,
    producer: Mutex<Option<AbortHandle>>,
}

impl ReadAhead {
    /// Start preparing `chunks` in order, at most `depth` at a time
    pub fn start(
        source: Arc<dyn UploadSource>,
        cipher: ChunkCipher,
        chunks: &[PlannedChunk],
        depth: usize,
        checksums: bool,
    ) -> Self {
        let shared = Arc::new(PipelineShared {
            source,
            cipher,
            checksums,
            slots: Arc::new(Semaphore::new(depth.max(1))),
            state: Mutex::new(PipelineState {
                upcoming: chunks.iter().map(|c| c.offset).collect(),
                ..Default::default()
            }),
            notify: Notify::new(),
            encrypt_jobs: AtomicUsize::new(0),
        });
        let producer = tokio::spawn(produce(shared.clone(), chunks.to_vec()));
        Self {
            shared,
            producer: Mutex::new(Some(producer.abort_handle())),
        }
    }

    /// Buffer for `chunk`, waiting for the producer if it is still ahead
    pub async fn take(&self, chunk: PlannedChunk) -> Result<Prepared> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if let Some(slot) = state.ready.remove(&chunk.offset) {
                    return slot;
                }
                if state.stopped || !state.upcoming.contains(&chunk.offset) {
                    break;
                }
            }
            notified.await;
        }
        trace!(offset = chunk.offset, "reading chunk on demand");
        prepare(&self.shared, chunk, None).await
    }

    /// Return an unsent buffer for a later retry
    pub fn put_back(&self, prepared: Prepared) {
        let mut state = self.shared.state.lock();
        if !state.stopped {
            state.ready.insert(prepared.chunk.offset, Ok(prepared));
        }
    }

    /// Stop producing and free every buffer
    pub fn shutdown(&self) {
        if let Some(producer) = self.producer.lock().take() {
            producer.abort();
        }
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            state.ready.clear();
            state.upcoming.clear();
        }
        self.shared.notify.notify_waiters();
    }

    /// Encryption jobs started so far
    pub fn encrypt_jobs(&self) -> usize {
        self.shared.encrypt_jobs.load(Ordering::Acquire)
    }

    /// Buffers prepared and not yet taken
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().ready.len()
    }
}

impl Drop for ReadAhead {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.get_mut().take() {
            producer.abort();
        }
    }
}

async fn produce(shared: Arc<PipelineShared>, chunks: Vec<PlannedChunk>) {
    for chunk in chunks {
        let Ok(permit) = shared.slots.clone().acquire_owned().await else {
            break;
        };
        {
            let state = shared.state.lock();
            if state.stopped {
                break;
            }
            if !state.upcoming.contains(&chunk.offset) {
                continue;
            }
        }

        let result = prepare(&shared, chunk, Some(permit)).await;
        let failed = result.is_err();
        {
            let mut state = shared.state.lock();
            state.upcoming.remove(&chunk.offset);
            if !state.stopped {
                state.ready.insert(chunk.offset, result);
            }
            if failed {
                // later chunks are read on demand
                state.upcoming.clear();
            }
        }
        shared.notify.notify_waiters();
        if failed {
            debug!(offset = chunk.offset, "read-ahead stopped after a failed read");
            break;
        }
    }
}

async fn prepare(
    shared: &PipelineShared,
    chunk: PlannedChunk,
    permit: Option<OwnedSemaphorePermit>,
) -> Result<Prepared> {
    if chunk.size == 0 {
        return Ok(Prepared {
            chunk,
            data: Bytes::new(),
            macs: MacList::new(),
            checksum: shared.checksums.then(|| upload_checksum(&[])),
            _permit: permit,
        });
    }

    let len = usize::try_from(chunk.size)
        .map_err(|_| TransferError::LocalIo(format!("chunk of {} bytes", chunk.size)))?;
    let plain = shared.source.read_at(chunk.offset, len).await?;

    shared.encrypt_jobs.fetch_add(1, Ordering::AcqRel);
    let cipher = shared.cipher.clone();
    let offset = chunk.offset;
    let (data, macs) = tokio::task::spawn_blocking(move || cipher.encrypt_chunk(offset, plain))
        .await
        .map_err(|e| TransferError::LocalIo(format!("encrypt task: {}", e)))?;

    Ok(Prepared {
        chunk,
        checksum: shared.checksums.then(|| upload_checksum(&data)),
        data: Bytes::from(data),
        macs,
        _permit: permit,
    })
}
