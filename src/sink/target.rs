/*!
 * Storage targets for downloaded bytes
 *
 * A file download writes into `<dest><suffix>` and renames it onto the
 * destination only after the MACs verify, so an interrupted transfer
 * never leaves a truncated file under the final name.
 */

use std::io::{self, ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::SinkTarget;
use crate::transfer::Artifact;

/// Partial file next to the destination, renamed on finalize
#[derive(Debug)]
pub struct FileTarget {
    dest: PathBuf,
    part: PathBuf,
    file: File,
}

impl FileTarget {
    /// Open (or create) the partial file without truncating it.
    pub async fn open(dest: &Path, suffix: &str) -> io::Result<Self> {
        let part = partial_path(dest, suffix);
        if let Some(parent) = part.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&part)
            .await?;
        Ok(Self {
            dest: dest.to_owned(),
            part,
            file,
        })
    }

    pub fn partial_path(&self) -> &Path {
        &self.part
    }
}

/// `<dest><suffix>`, e.g. `movie.mkv.cumulus-part`
pub fn partial_path(dest: &Path, suffix: &str) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[async_trait]
impl SinkTarget for FileTarget {
    async fn durable_len(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata().await?.len())
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len).await?;
        self.file.sync_data().await
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }

    async fn reclaim_space(&mut self, keep: u64) -> io::Result<()> {
        // drop whatever a failed write left past the durable prefix
        let len = self.file.metadata().await?.len();
        if len > keep {
            debug!(path = %self.part.display(), keep, len, "trimming partial tail");
            self.file.set_len(keep).await?;
        }
        Ok(())
    }

    fn supports_fallback(&self) -> bool {
        true
    }

    async fn read_prefix(&mut self, len: u64) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(0)).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn finalize(self: Box<Self>) -> io::Result<Artifact> {
        let FileTarget { dest, part, file } = *self;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&part, &dest).await?;
        Ok(Artifact::File(dest))
    }

    async fn discard(self: Box<Self>) -> io::Result<()> {
        let FileTarget { part, file, .. } = *self;
        drop(file);
        match tokio::fs::remove_file(&part).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn describe(&self) -> String {
        self.part.display().to_string()
    }
}

/// Whole file kept in memory
#[derive(Debug, Default)]
pub struct MemoryTarget {
    buf: Vec<u8>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from bytes recovered from another target
    pub fn with_prefix(prefix: Vec<u8>) -> Self {
        Self { buf: prefix }
    }
}

#[async_trait]
impl SinkTarget for MemoryTarget {
    async fn durable_len(&mut self) -> io::Result<u64> {
        Ok(self.buf.len() as u64)
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.buf.truncate(len as usize);
        Ok(())
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start + data.len();
        if self.buf.len() < end {
            self.buf
                .try_reserve(end - self.buf.len())
                .map_err(|e| io::Error::new(ErrorKind::OutOfMemory, e.to_string()))?;
            self.buf.resize(end, 0);
        }
        self.buf[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn reclaim_space(&mut self, keep: u64) -> io::Result<()> {
        self.buf.truncate(keep as usize);
        self.buf.shrink_to_fit();
        Ok(())
    }

    async fn read_prefix(&mut self, len: u64) -> io::Result<Vec<u8>> {
        self.buf
            .get(..len as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| io::Error::new(ErrorKind::UnexpectedEof, "prefix beyond buffer"))
    }

    async fn finalize(self: Box<Self>) -> io::Result<Artifact> {
        Ok(Artifact::Memory(Bytes::from(self.buf)))
    }

    async fn discard(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory ({} bytes)", self.buf.len())
    }
}
