//! In-memory cloud used by the integration tests.
//!
//! One [`MockCloud`] plays both the storage hosts (`HttpTransport`) and the
//! backend API (`StorageApi`), so an upload's node can be downloaded again.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cumulus::crypto::{FileKey, UploadKey};
use cumulus::net::api::{DownloadTicket, NodeRequest, StoredNode, TicketUrls, UploadTicket};
use cumulus::net::{ApiError, BodyStream, HttpError, HttpTransport, StorageApi};
use cumulus::transfer::{EventSubscriber, TransferEvent};
use cumulus::UploadSource;
use cumulus_core_raid::encode_parts;
use parking_lot::Mutex;
use url::Url;

/// Bytes per streamed body piece
const PIECE: usize = 64 * 1024;

/// A file as the backend stores it
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub plaintext: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub key: FileKey,
}

/// Deterministic, non-repeating-looking test data
pub fn sample(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).rotate_left(seed as u32 % 32) as u8 ^ seed)
        .collect()
}

/// Encrypt `plaintext` the way an uploader would and derive its file key.
pub fn encrypt_file(plaintext: Vec<u8>, seed: u32) -> StoredFile {
    let upload_key = UploadKey::from_words([
        0x0102_0304 ^ seed,
        0x1111_2222,
        0x3333_4444 ^ seed,
        0x5555_6666,
        0x7777_8888,
        0x9999_aaaa ^ seed,
    ]);
    let cipher = upload_key.chunk_cipher();
    let (ciphertext, macs) = cipher.encrypt_chunk(0, plaintext.clone());
    let meta = cipher.meta_mac(macs.iter().map(|(_, mac)| mac));
    StoredFile {
        plaintext,
        ciphertext,
        key: upload_key.complete(meta),
    }
}

#[derive(Debug, Clone)]
struct Listing {
    name: String,
    size: u64,
    urls: Vec<String>,
    generation: u32,
    raid: bool,
}

#[derive(Debug, Default)]
struct UploadSlot {
    size: u64,
    received: BTreeMap<u64, Bytes>,
    token: Option<String>,
}

#[derive(Default)]
struct CloudState {
    /// Object bytes keyed by URL base (scheme, host and path)
    objects: HashMap<String, Bytes>,
    listings: HashMap<String, Listing>,
    /// Bases that answer 403
    expired: HashSet<String>,
    /// Handles whose URLs go stale right after the next ticket is issued
    expire_on_issue: HashSet<String>,
    /// Bases that accept the request and never answer
    silent: HashSet<String>,
    /// Statuses returned, one per request, before a base behaves again
    scripted: HashMap<String, VecDeque<u16>>,
    uploads: HashMap<String, UploadSlot>,
    nodes: Vec<NodeRequest>,
    gets: Vec<String>,
    posts: Vec<String>,
    next_id: u64,
}

#[derive(Default)]
pub struct MockCloud {
    state: Mutex<CloudState>,
    /// Delay before each GET answers
    latency: Mutex<Duration>,
    ticket_calls: AtomicUsize,
    live_gets: AtomicUsize,
    peak_gets: AtomicUsize,
}

/// Split a request URL into its base and its last path segment.
fn split(url: &str) -> Result<(String, String), HttpError> {
    let mut parsed = Url::parse(url).map_err(|e| HttpError::InvalidUrl(e.to_string()))?;
    let _ = parsed.set_port(None);
    let path = parsed.path().to_string();
    let (dir, last) = path
        .rsplit_once('/')
        .ok_or_else(|| HttpError::InvalidUrl(url.to_string()))?;
    let host = parsed.host_str().unwrap_or_default();
    Ok((format!("{}://{}{}", parsed.scheme(), host, dir), last.to_string()))
}

fn parse_range(segment: &str) -> Option<(usize, usize)> {
    let (start, end) = segment.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

struct GetGuard<'a>(&'a AtomicUsize);

impl Drop for GetGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Serve `file` from one host under `handle`
    pub fn add_file(&self, handle: &str, file: &StoredFile) {
        let base = format!("http://dl.test/{}/g0", handle);
        let mut state = self.state.lock();
        state.objects.insert(base.clone(), Bytes::from(file.ciphertext.clone()));
        state.listings.insert(
            handle.to_string(),
            Listing {
                name: format!("{}.bin", handle),
                size: file.ciphertext.len() as u64,
                urls: vec![base],
                generation: 0,
                raid: false,
            },
        );
    }

    /// Serve `file` as six CloudRAID parts under `handle`
    pub fn add_raid_file(&self, handle: &str, file: &StoredFile) {
        let mut state = self.state.lock();
        let mut urls = Vec::new();
        for (index, part) in encode_parts(&file.ciphertext).into_iter().enumerate() {
            let base = format!("http://raid{}.test/{}", index, handle);
            state.objects.insert(base.clone(), Bytes::from(part));
            urls.push(base);
        }
        state.listings.insert(
            handle.to_string(),
            Listing {
                name: format!("{}.bin", handle),
                size: file.ciphertext.len() as u64,
                urls,
                generation: 0,
                raid: true,
            },
        );
    }

    /// URL bases currently handed out for `handle`
    pub fn urls(&self, handle: &str) -> Vec<String> {
        self.state
            .lock()
            .listings
            .get(handle)
            .map(|l| l.urls.clone())
            .unwrap_or_default()
    }

    /// Make the current single-host URL answer 403 and hand out a fresh one.
    pub fn expire(&self, handle: &str) {
        let mut state = self.state.lock();
        let Some(listing) = state.listings.get(handle).cloned() else {
            return;
        };
        let old = listing.urls[0].clone();
        let data = state.objects.get(&old).cloned().unwrap_or_default();
        let generation = listing.generation + 1;
        let fresh = format!("http://dl.test/{}/g{}", handle, generation);
        state.objects.insert(fresh.clone(), data);
        state.expired.insert(old);
        state.listings.insert(
            handle.to_string(),
            Listing {
                urls: vec![fresh],
                generation,
                ..listing
            },
        );
    }

    /// Let the next ticket for `handle` go out, then expire its URL.
    pub fn expire_after_next_ticket(&self, handle: &str) {
        self.state.lock().expire_on_issue.insert(handle.to_string());
    }

    pub fn silence(&self, base: &str) {
        self.state.lock().silent.insert(base.to_string());
    }

    /// Answer the next requests to `base` with these statuses
    pub fn script(&self, base: &str, statuses: &[u16]) {
        self.state
            .lock()
            .scripted
            .entry(base.to_string())
            .or_default()
            .extend(statuses.iter().copied());
    }

    pub fn gets(&self) -> Vec<String> {
        self.state.lock().gets.clone()
    }

    pub fn posts(&self) -> Vec<String> {
        self.state.lock().posts.clone()
    }

    /// Start offsets of every GET issued against `base`
    pub fn requested_offsets(&self, base: &str) -> Vec<u64> {
        self.gets()
            .iter()
            .filter_map(|url| {
                let (b, segment) = split(url).ok()?;
                if b != base {
                    return None;
                }
                parse_range(&segment).map(|(start, _)| start as u64)
            })
            .collect()
    }

    pub fn ticket_calls(&self) -> usize {
        self.ticket_calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrent_gets(&self) -> usize {
        self.peak_gets.load(Ordering::SeqCst)
    }

    pub fn nodes(&self) -> Vec<NodeRequest> {
        self.state.lock().nodes.clone()
    }

    /// Ciphertext the backend holds for an uploaded node
    pub fn stored_ciphertext(&self, handle: &str) -> Option<Bytes> {
        let state = self.state.lock();
        let listing = state.listings.get(handle)?;
        state.objects.get(&listing.urls[0]).cloned()
    }

    fn take_scripted(state: &mut CloudState, base: &str) -> Option<u16> {
        let queue = state.scripted.get_mut(base)?;
        let status = queue.pop_front();
        if queue.is_empty() {
            state.scripted.remove(base);
        }
        status
    }

    fn accept_chunk(&self, url: &str, body: Bytes) -> Result<Bytes, HttpError> {
        let (base, segment) = split(url)?;
        let offset: u64 = segment
            .parse()
            .map_err(|_| HttpError::InvalidUrl(url.to_string()))?;
        let mut state = self.state.lock();
        state.posts.push(url.to_string());
        if let Some(status) = Self::take_scripted(&mut state, &base) {
            return Err(HttpError::Status(status));
        }
        state.next_id += 1;
        let next_id = state.next_id;
        let Some(slot) = state.uploads.get_mut(&base) else {
            return Ok(Bytes::from_static(b"-9"));
        };
        if offset + body.len() as u64 > slot.size {
            return Ok(Bytes::from_static(b"-2"));
        }
        slot.received.insert(offset, body);
        let received: u64 = slot.received.values().map(|b| b.len() as u64).sum();
        if received == slot.size && slot.token.is_none() {
            let token = format!("{:0>36}", format!("TOKEN{}", next_id));
            slot.token = Some(token.clone());
            return Ok(Bytes::from(token));
        }
        Ok(Bytes::new())
    }
}

#[async_trait]
impl HttpTransport for MockCloud {
    async fn get(&self, url: &str) -> Result<BodyStream, HttpError> {
        let live = self.live_gets.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_gets.fetch_max(live, Ordering::SeqCst);
        let _guard = GetGuard(&self.live_gets);

        let (base, segment) = split(url)?;
        let (silent, data) = {
            let mut state = self.state.lock();
            state.gets.push(url.to_string());
            if let Some(status) = Self::take_scripted(&mut state, &base) {
                return Err(HttpError::Status(status));
            }
            if state.expired.contains(&base) {
                return Err(HttpError::Status(403));
            }
            let data = state
                .objects
                .get(&base)
                .cloned()
                .ok_or(HttpError::Status(404))?;
            (state.silent.contains(&base), data)
        };
        if silent {
            futures::future::pending::<()>().await;
        }

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let (start, end) = parse_range(&segment).ok_or_else(|| HttpError::InvalidUrl(url.into()))?;
        if start > end || end >= data.len() {
            return Err(HttpError::Status(416));
        }
        let body = data.slice(start..=end);
        let pieces: Vec<Result<Bytes, HttpError>> = (0..body.len())
            .step_by(PIECE)
            .map(|at| Ok(body.slice(at..(at + PIECE).min(body.len()))))
            .collect();
        Ok(Box::pin(futures::stream::iter(pieces)))
    }

    async fn post(&self, url: &str, body: Bytes) -> Result<Bytes, HttpError> {
        self.accept_chunk(url, body)
    }
}

#[async_trait]
impl StorageApi for MockCloud {
    async fn download_url(&self, handle: &str) -> Result<DownloadTicket, ApiError> {
        self.ticket_calls.fetch_add(1, Ordering::SeqCst);
        let (listing, expire) = {
            let mut state = self.state.lock();
            let listing = state.listings.get(handle).cloned().ok_or(ApiError::NotFound)?;
            (listing, state.expire_on_issue.remove(handle))
        };
        if expire {
            self.expire(handle);
        }
        let urls = if listing.raid {
            let parts: [String; 6] = listing
                .urls
                .try_into()
                .map_err(|_| ApiError::Other(-1))?;
            TicketUrls::Raid(parts)
        } else {
            TicketUrls::Single(listing.urls[0].clone())
        };
        Ok(DownloadTicket {
            size: listing.size,
            urls,
            name: Some(listing.name),
        })
    }

    async fn upload_ticket(&self, size: u64, _attempt: u32) -> Result<UploadTicket, ApiError> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let post_url = format!("http://up.test/ul{}", state.next_id);
        state.uploads.insert(
            post_url.clone(),
            UploadSlot {
                size,
                ..UploadSlot::default()
            },
        );
        Ok(UploadTicket { post_url })
    }

    async fn put_node(&self, request: NodeRequest) -> Result<StoredNode, ApiError> {
        let mut state = self.state.lock();
        let slot = state
            .uploads
            .values()
            .find(|slot| slot.token.as_deref() == Some(request.completion_token.as_str()))
            .ok_or(ApiError::Other(-2))?;
        let ciphertext: Vec<u8> = slot.received.values().flat_map(|b| b.iter().copied()).collect();

        state.next_id += 1;
        let handle = format!("node{}", state.next_id);
        let base = format!("http://dl.test/{}/g0", handle);
        state.objects.insert(base.clone(), Bytes::from(ciphertext));
        state.listings.insert(
            handle.clone(),
            Listing {
                name: request.name.clone(),
                size: request.size,
                urls: vec![base],
                generation: 0,
                raid: false,
            },
        );
        state.nodes.push(request);
        Ok(StoredNode { handle })
    }
}

/// Source that counts how often it is read
#[derive(Debug)]
pub struct CountingSource {
    data: Vec<u8>,
    pub reads: AtomicUsize,
}

impl CountingSource {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data,
            reads: AtomicUsize::new(0),
        })
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UploadSource for CountingSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let start = offset as usize;
        self.data
            .get(start..start + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
    }

    fn describe(&self) -> String {
        format!("counting source ({} bytes)", self.data.len())
    }
}

/// Collect events until one matches, failing after `limit`.
pub async fn wait_for_event<F>(
    events: &mut EventSubscriber,
    limit: Duration,
    mut matches: F,
) -> Vec<TransferEvent>
where
    F: FnMut(&TransferEvent) -> bool,
{
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let hit = matches(&event);
        seen.push(event);
        if hit {
            return seen;
        }
    }
}
