/*!
 * Resume state for interrupted downloads
 *
 * After each durable write the sink persists the contiguous byte offset
 * together with every block MAC seen so far. A restarted transfer trusts
 * the record only if the partial artifact on disk is at least that long.
 */

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::crypto::BlockMac;
use crate::error::{Result, TransferError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    /// Contiguous bytes durably written from offset zero
    pub byte_offset: u64,
    /// Size of the file the record belongs to
    pub size: u64,
    pub macs: BTreeMap<u64, BlockMac>,
    pub updated_at: DateTime<Utc>,
}

impl ResumeRecord {
    pub fn new(byte_offset: u64, size: u64, macs: BTreeMap<u64, BlockMac>) -> Self {
        Self {
            byte_offset,
            size,
            macs,
            updated_at: Utc::now(),
        }
    }
}

/// Tag under which a download's record is kept
pub fn download_tag(handle: &str) -> String {
    format!("dl:{}", handle)
}

#[async_trait]
pub trait ResumeStore: Send + Sync {
    async fn load(&self, tag: &str) -> Result<Option<ResumeRecord>>;
    async fn save(&self, tag: &str, record: &ResumeRecord) -> Result<()>;
    async fn remove(&self, tag: &str) -> Result<()>;
}

/// Process-local store, also used by tests
#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    records: Mutex<HashMap<String, ResumeRecord>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: &str) -> Option<ResumeRecord> {
        self.records.lock().get(tag).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResumeStore for MemoryResumeStore {
    async fn load(&self, tag: &str) -> Result<Option<ResumeRecord>> {
        Ok(self.get(tag))
    }

    async fn save(&self, tag: &str, record: &ResumeRecord) -> Result<()> {
        self.records.lock().insert(tag.to_string(), record.clone());
        Ok(())
    }

    async fn remove(&self, tag: &str) -> Result<()> {
        self.records.lock().remove(tag);
        Ok(())
    }
}

/// One JSON file per record, replaced atomically via rename
#[derive(Debug, Clone)]
pub struct JsonDirResumeStore {
    dir: PathBuf,
}

impl JsonDirResumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            TransferError::Resume(format!("cannot create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, tag: &str) -> PathBuf {
        let digest = Sha256::digest(tag.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }
}

#[async_trait]
impl ResumeStore for JsonDirResumeStore {
    async fn load(&self, tag: &str) -> Result<Option<ResumeRecord>> {
        let path = self.path_for(tag);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TransferError::Resume(e.to_string())),
        };
        match serde_json::from_slice(&contents) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(tag, error = %e, "discarding unreadable resume record");
                Ok(None)
            }
        }
    }

    async fn save(&self, tag: &str, record: &ResumeRecord) -> Result<()> {
        let path = self.path_for(tag);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_vec(record)?;
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| TransferError::Resume(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| TransferError::Resume(e.to_string()))?;
        debug!(tag, offset = record.byte_offset, "resume record saved");
        Ok(())
    }

    async fn remove(&self, tag: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(tag)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::Resume(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(offset: u64) -> ResumeRecord {
        let mut macs = BTreeMap::new();
        macs.insert(0, [1, 2, 3, 4]);
        macs.insert(131072, [5, 6, 7, 8]);
        ResumeRecord::new(offset, 1 << 20, macs)
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryResumeStore::new();
        let tag = download_tag("abc");
        assert_eq!(store.load(&tag).await.unwrap(), None);

        store.save(&tag, &record(262144)).await.unwrap();
        assert_eq!(store.load(&tag).await.unwrap().unwrap().byte_offset, 262144);

        store.remove(&tag).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = JsonDirResumeStore::new(dir.path().join("state")).unwrap();
        let tag = download_tag("h1");
        let saved = record(131072);

        store.save(&tag, &saved).await.unwrap();
        let loaded = store.load(&tag).await.unwrap().unwrap();
        assert_eq!(loaded, saved);

        // no temp file left behind
        let names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json"));

        store.remove(&tag).await.unwrap();
        store.remove(&tag).await.unwrap();
        assert_eq!(store.load(&tag).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_store_ignores_corrupt_record() {
        let dir = tempdir().unwrap();
        let store = JsonDirResumeStore::new(dir.path()).unwrap();
        let tag = download_tag("broken");
        std::fs::write(store.path_for(&tag), b"{not json").unwrap();
        assert_eq!(store.load(&tag).await.unwrap(), None);
    }

    #[test]
    fn test_tags_do_not_collide() {
        let dir = tempdir().unwrap();
        let store = JsonDirResumeStore::new(dir.path()).unwrap();
        assert_ne!(store.path_for("dl:a"), store.path_for("dl:b"));
    }
}
