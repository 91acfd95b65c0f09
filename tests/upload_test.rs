//! Uploads against the in-memory cloud, and round trips through download

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{sample, CountingSource, MockCloud};
use cumulus::config::EngineConfig;
use cumulus::{
    Artifact, Direction, DownloadRequest, DownloadTarget, FileSource, MemorySource, Scheduler,
    TransferError, TransferEvent, UploadRequest, UploadSource,
};

const KIB: u64 = 1024;

fn config() -> EngineConfig {
    let mut config = EngineConfig::strict();
    config.queue.upload_limit = 3;
    config.queue.download_limit = 3;
    config.chunks.initial_size = 128 * KIB;
    config.chunks.growth_factor = 2;
    config.chunks.max_size = 512 * KIB;
    config.upload.read_ahead_depth = 4;
    config.retry.chunk_backoff_initial_ms = 10;
    config.retry.chunk_backoff_max_ms = 50;
    config.retry.url_backoff_initial_ms = 10;
    config.retry.url_backoff_max_ms = 50;
    config
}

fn scheduler(cloud: &Arc<MockCloud>) -> (Scheduler, cumulus::EventSubscriber) {
    Scheduler::new(config(), cloud.clone(), cloud.clone(), None).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_upload_then_download_round_trip() {
    let cloud = MockCloud::new();
    let (scheduler, mut events) = scheduler(&cloud);
    let plaintext = sample(1_500_000, 21);

    let source = Arc::new(MemorySource::new(plaintext.clone()));
    let summary = scheduler
        .uploads()
        .enqueue(UploadRequest::new(source, "photo.jpg"))
        .wait()
        .await
        .unwrap();
    assert_eq!(summary.direction, Direction::Upload);
    assert_eq!(summary.size, plaintext.len() as u64);

    let Artifact::Node { handle, key } = summary.artifact else {
        panic!("upload should produce a node");
    };
    let nodes = cloud.nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].name, "photo.jpg");
    assert_eq!(nodes[0].key, key);
    assert_eq!(nodes[0].size, plaintext.len() as u64);
    // 128K + 256K + 512K + 512K + rest
    assert_eq!(cloud.posts().len(), 5);
    assert!(cloud.posts().iter().all(|url| url.contains("?c=")));

    let stored = cloud.stored_ciphertext(&handle).unwrap();
    assert_ne!(&stored[..], &plaintext[..]);

    let downloaded = scheduler
        .downloads()
        .enqueue(DownloadRequest {
            handle,
            key,
            target: DownloadTarget::Memory,
            name: None,
        })
        .wait()
        .await
        .unwrap();
    assert_eq!(downloaded.artifact, Artifact::Memory(plaintext.into()));

    let seen = events.drain();
    assert!(seen.iter().any(|e| matches!(
        e,
        TransferEvent::Start { direction: Direction::Upload, .. }
    )));
    assert!(!seen.iter().any(|e| matches!(e, TransferEvent::Error { .. })));
}

#[tokio::test]
async fn test_empty_upload_posts_once_without_reading() {
    let cloud = MockCloud::new();
    let (scheduler, _events) = scheduler(&cloud);
    let source = CountingSource::new(Vec::new());

    let summary = scheduler
        .uploads()
        .enqueue(UploadRequest::new(source.clone() as Arc<dyn UploadSource>, "empty.txt"))
        .wait()
        .await
        .unwrap();

    assert_eq!(summary.size, 0);
    assert!(matches!(summary.artifact, Artifact::Node { .. }));
    assert_eq!(source.reads(), 0);
    let posts = cloud.posts();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].starts_with("http://up.test/ul1/0"));
    assert_eq!(cloud.nodes()[0].size, 0);
}

#[tokio::test]
async fn test_failed_post_is_retried_from_buffer() {
    let cloud = MockCloud::new();
    cloud.script("http://up.test/ul1", &[503]);
    let (scheduler, _events) = scheduler(&cloud);
    let plaintext = sample(300_000, 22);
    let source = CountingSource::new(plaintext.clone());

    let summary = scheduler
        .uploads()
        .enqueue(UploadRequest::new(source.clone() as Arc<dyn UploadSource>, "retry.bin"))
        .wait()
        .await
        .unwrap();

    // 128K + 256K chunks, one of them posted twice
    assert_eq!(cloud.posts().len(), 3);
    assert_eq!(source.reads(), 2);

    let Artifact::Node { handle, key } = summary.artifact else {
        panic!("upload should produce a node");
    };
    let downloaded = scheduler
        .downloads()
        .enqueue(DownloadRequest {
            handle,
            key,
            target: DownloadTarget::Memory,
            name: None,
        })
        .wait()
        .await
        .unwrap();
    assert_eq!(downloaded.artifact, Artifact::Memory(plaintext.into()));
}

#[tokio::test]
async fn test_upload_from_file() {
    let cloud = MockCloud::new();
    let (scheduler, _events) = scheduler(&cloud);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    let plaintext = sample(200_000, 23);
    std::fs::write(&path, &plaintext).unwrap();

    let source = Arc::new(FileSource::open(&path).await.unwrap());
    assert_eq!(source.len(), plaintext.len() as u64);
    let mut request = UploadRequest::new(source, "notes.txt");
    request.parent = Some("folder1".into());
    let summary = scheduler.uploads().enqueue(request).wait().await.unwrap();

    assert!(matches!(summary.artifact, Artifact::Node { .. }));
    assert_eq!(cloud.nodes()[0].parent.as_deref(), Some("folder1"));
}

#[tokio::test]
async fn test_cancelled_upload_creates_no_node() {
    let cloud = MockCloud::new();
    let (scheduler, _events) = scheduler(&cloud);
    let source = Arc::new(MemorySource::new(sample(2_000_000, 24)));

    let handle = scheduler
        .uploads()
        .enqueue(UploadRequest::new(source, "gone.bin"));
    assert_eq!(scheduler.cancel(handle.id()), 1);

    assert_eq!(handle.wait().await.unwrap_err(), TransferError::Cancelled);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cloud.nodes().is_empty());
}
