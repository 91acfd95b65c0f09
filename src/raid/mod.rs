/*!
 * CloudRAID chunk fetcher
 *
 * Reads one file range from six part hosts. All six are asked for their
 * stripe of the range; as soon as five have answered the sixth is dropped
 * and rebuilt from parity by the [`LineAssembler`]. When an active part
 * fails or stalls mid-stream it trades places with the skipped one, which
 * is re-requested from the current line boundary.
 *
 * Failures past `failure_ceiling`, or an HTTP status outside the retryable
 * set, fail the whole range so the chunk task can retry it from scratch.
 */

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cumulus_core_raid::{LineAssembler, RaidError, RaidGeometry, RAID_PARTS};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tracing::{debug, trace, warn};

use crate::config::RaidConfig;
use crate::error::{Result, TransferError};
use crate::net::http::{BodyStream, HttpError, HttpTransport};

impl From<RaidError> for TransferError {
    fn from(err: RaidError) -> Self {
        TransferError::Raid(err.to_string())
    }
}

/// Result of one open-or-read step on a part
struct PartRead {
    part: usize,
    epoch: u64,
    stream: Option<BodyStream>,
    result: std::result::Result<Option<Bytes>, HttpError>,
}

enum PartSource {
    Open(String),
    Stream(BodyStream),
}

pub struct CloudRaidFetcher {
    http: Arc<dyn HttpTransport>,
    urls: [String; RAID_PARTS],
    geometry: RaidGeometry,
    config: RaidConfig,
    stall: Duration,
}

impl std::fmt::Debug for CloudRaidFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudRaidFetcher")
            .field("file_size", &self.geometry.file_size())
            .field("stall", &self.stall)
            .finish()
    }
}

impl CloudRaidFetcher {
    pub fn new(
        http: Arc<dyn HttpTransport>,
        urls: [String; RAID_PARTS],
        file_size: u64,
        config: RaidConfig,
        stall: Duration,
    ) -> Self {
        Self {
            http,
            urls,
            geometry: RaidGeometry::new(file_size),
            config,
            stall,
        }
    }

    fn part_url(&self, part: usize, range: &Range<u64>) -> String {
        format!("{}/{}-{}", self.urls[part], range.start, range.end - 1)
    }

    /// Fetch `range` of the file, reporting produced bytes as they appear.
    pub async fn fetch<F>(&self, range: Range<u64>, mut on_progress: F) -> Result<Vec<u8>>
    where
        F: FnMut(u64) + Send,
    {
        let wanted = range.end - range.start;
        let mut assembler = LineAssembler::new(&self.geometry, range.clone())?;
        let mut output = Vec::with_capacity(wanted as usize);
        let mut failures = 0u32;

        assembler.advance();
        output.extend(assembler.take_output());
        if assembler.is_complete() {
            return Ok(output);
        }

        let streams = self.open_parts(&mut assembler, &mut failures).await?;

        let mut epochs = [0u64; RAID_PARTS];
        let mut reads: FuturesUnordered<BoxFuture<'static, PartRead>> = FuturesUnordered::new();
        for (part, stream) in streams.into_iter().enumerate() {
            if let Some(stream) = stream {
                reads.push(self.step(part, 0, PartSource::Stream(stream)));
            }
        }

        while !assembler.is_complete() {
            let Some(read) = reads.next().await else {
                assembler.advance();
                output.extend(assembler.take_output());
                if assembler.is_complete() {
                    break;
                }
                return Err(TransferError::Raid(format!(
                    "parts ran dry with {} bytes missing",
                    assembler.remaining()
                )));
            };
            if read.epoch != epochs[read.part] {
                continue;
            }
            let part = read.part;

            match read.result {
                Ok(Some(bytes)) => {
                    let produced = assembler.push(part, &bytes)?;
                    if produced > 0 {
                        output.extend(assembler.take_output());
                        on_progress(output.len() as u64);
                    }
                    if !assembler.part_complete(part) {
                        if let Some(stream) = read.stream {
                            reads.push(self.step(part, epochs[part], PartSource::Stream(stream)));
                        }
                    }
                }
                Ok(None) if assembler.part_complete(part) => {}
                outcome => {
                    let err = match outcome {
                        Err(err) => err,
                        _ => HttpError::Body(format!("part {} ended early", part)),
                    };
                    self.note_failure(part, &err, &mut failures)?;

                    epochs[part] += 1;
                    if let Some(promoted) = assembler.fail_part(part)? {
                        epochs[promoted] += 1;
                        let resume = assembler.resume_range(promoted)?;
                        debug!(failed = part, promoted, start = resume.start, "swapping RAID part");
                        if !resume.is_empty() {
                            let url = self.part_url(promoted, &resume);
                            reads.push(self.step(promoted, epochs[promoted], PartSource::Open(url)));
                        }
                    }
                    if assembler.advance() > 0 {
                        output.extend(assembler.take_output());
                        on_progress(output.len() as u64);
                    }
                }
            }
        }

        if output.len() as u64 != wanted {
            return Err(TransferError::Raid(format!(
                "reassembled {} bytes, expected {}",
                output.len(),
                wanted
            )));
        }
        Ok(output)
    }

    /// Open every part with data, keep the first five to answer and skip the
    /// last one.
    async fn open_parts(
        &self,
        assembler: &mut LineAssembler,
        failures: &mut u32,
    ) -> Result<Vec<Option<BodyStream>>> {
        let mut streams: Vec<Option<BodyStream>> = (0..RAID_PARTS).map(|_| None).collect();
        let mut ready = 0usize;
        let mut opens: FuturesUnordered<BoxFuture<'static, (usize, std::result::Result<BodyStream, HttpError>)>> =
            FuturesUnordered::new();

        for part in 0..RAID_PARTS {
            let range = assembler.part_range(part)?;
            if range.is_empty() {
                ready += 1;
            } else {
                opens.push(self.open(part, self.part_url(part, &range)));
            }
        }

        while ready < RAID_PARTS - 1 {
            let Some((part, result)) = opens.next().await else {
                break;
            };
            match result {
                Ok(stream) => {
                    streams[part] = Some(stream);
                    ready += 1;
                }
                Err(err) => {
                    self.note_failure(part, &err, failures)?;
                    if assembler.skipped().is_none() {
                        assembler.skip(part)?;
                    } else {
                        let range = assembler.part_range(part)?;
                        opens.push(self.open(part, self.part_url(part, &range)));
                    }
                }
            }
        }

        if assembler.skipped().is_none() {
            if let Some(slowest) = streams
                .iter()
                .enumerate()
                .position(|(part, s)| {
                    s.is_none() && assembler.part_range(part).is_ok_and(|r| !r.is_empty())
                })
            {
                trace!(part = slowest, "skipping slowest RAID part");
                assembler.skip(slowest)?;
            }
        }
        Ok(streams)
    }

    fn note_failure(&self, part: usize, err: &HttpError, failures: &mut u32) -> Result<()> {
        *failures += 1;
        if let HttpError::Status(status) = err {
            if !self.config.retryable_statuses.contains(status) {
                return Err(TransferError::Http { status: *status });
            }
        }
        if *failures > self.config.failure_ceiling {
            return Err(TransferError::Raid(format!(
                "{} part failures, last on part {}: {}",
                failures, part, err
            )));
        }
        warn!(part, failures = *failures, error = %err, "RAID part failed");
        Ok(())
    }

    fn open(
        &self,
        part: usize,
        url: String,
    ) -> BoxFuture<'static, (usize, std::result::Result<BodyStream, HttpError>)> {
        let http = self.http.clone();
        let stall = self.stall;
        async move {
            let result = match tokio::time::timeout(stall, http.get(&url)).await {
                Ok(result) => result,
                Err(_) => Err(HttpError::Timeout(stall)),
            };
            (part, result)
        }
        .boxed()
    }

    fn step(&self, part: usize, epoch: u64, source: PartSource) -> BoxFuture<'static, PartRead> {
        let http = self.http.clone();
        let stall = self.stall;
        async move {
            let mut stream = match source {
                PartSource::Stream(stream) => stream,
                PartSource::Open(url) => match tokio::time::timeout(stall, http.get(&url)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(err)) => {
                        return PartRead {
                            part,
                            epoch,
                            stream: None,
                            result: Err(err),
                        }
                    }
                    Err(_) => {
                        return PartRead {
                            part,
                            epoch,
                            stream: None,
                            result: Err(HttpError::Timeout(stall)),
                        }
                    }
                },
            };
            let result = match tokio::time::timeout(stall, stream.next()).await {
                Ok(Some(Ok(bytes))) => Ok(Some(bytes)),
                Ok(Some(Err(err))) => Err(err),
                Ok(None) => Ok(None),
                Err(_) => Err(HttpError::Timeout(stall)),
            };
            PartRead {
                part,
                epoch,
                stream: Some(stream),
                result,
            }
        }
        .boxed()
    }
}
