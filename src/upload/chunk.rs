//! One planned range of an upload

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, trace};

use super::file::UploadFile;
use super::pipeline::Prepared;
use crate::error::{ErrorCategory, Result, TransferError};
use crate::net::api::parse_error_code;
use crate::net::ApiError;
use crate::queue::{GroupId, TaskContext, TaskOutcome};
use crate::scheduler::TaskBody;
use crate::transfer::{Direction, InFlightChunk, PlannedChunk, TransferEvent};

/// Length of the completion token a storage host returns
const TOKEN_LEN: usize = 36;

/// What the storage host said about one chunk POST
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PostResponse {
    Accepted,
    Token(String),
    Error(i64),
    Malformed,
}

pub(crate) fn interpret(body: &[u8]) -> PostResponse {
    if body.is_empty() {
        return PostResponse::Accepted;
    }
    if let Some(code) = parse_error_code(body) {
        return PostResponse::Error(code);
    }
    if body.len() == TOKEN_LEN && body.iter().all(|b| b.is_ascii_graphic()) {
        if let Ok(token) = std::str::from_utf8(body) {
            return PostResponse::Token(token.to_string());
        }
    }
    PostResponse::Malformed
}

pub struct UploadChunk {
    file: Arc<UploadFile>,
    chunk: PlannedChunk,
    done: AtomicBool,
}

impl UploadChunk {
    pub(crate) fn new(file: Arc<UploadFile>, chunk: PlannedChunk) -> Arc<Self> {
        Arc::new(Self {
            file,
            chunk,
            done: AtomicBool::new(false),
        })
    }

    pub fn chunk(&self) -> &PlannedChunk {
        &self.chunk
    }

    fn is_gone(&self) -> bool {
        let transfer = self.file.transfer();
        transfer.is_cancelled() || transfer.phase().is_terminal()
    }

    fn chunk_url(&self, post_url: &str, checksum: Option<&str>) -> Result<String> {
        let base = self.file.ports().apply(post_url)?;
        let mut url = format!("{}/{}", base.trim_end_matches('/'), self.chunk.offset);
        if let Some(checksum) = checksum {
            url.push_str("?c=");
            url.push_str(checksum);
        }
        Ok(url)
    }

    async fn send(self: Arc<Self>) -> TaskOutcome {
        if self.done.load(Ordering::Acquire) {
            return TaskOutcome::Completed;
        }
        if self.is_gone() {
            return TaskOutcome::Aborted;
        }
        let _in_flight = InFlightChunk::enter(self.file.transfer());
        let (Some(pipeline), Some(post_url)) = (self.file.pipeline(), self.file.post_url()) else {
            return TaskOutcome::Aborted;
        };

        let prepared = match pipeline.take(self.chunk).await {
            Ok(prepared) => prepared,
            Err(err) => return self.recover(err, None),
        };
        if self.is_gone() {
            return TaskOutcome::Aborted;
        }
        let url = match self.chunk_url(&post_url, prepared.checksum.as_deref()) {
            Ok(url) => url,
            Err(err) => return self.recover(err, Some(prepared)),
        };

        let state = self.file.state();
        let timeout = state.config.timeouts.upload_post();
        let body = match tokio::time::timeout(timeout, state.http.post(&url, prepared.data.clone())).await {
            Ok(Ok(body)) => body,
            Ok(Err(err)) => return self.recover(err.into(), Some(prepared)),
            Err(_) => return self.recover(TransferError::Timeout(timeout), Some(prepared)),
        };

        match interpret(&body) {
            PostResponse::Accepted => self.accepted(prepared, None),
            PostResponse::Token(token) => self.accepted(prepared, Some(token)),
            PostResponse::Error(code) => self.recover(ApiError::from_code(code).into(), Some(prepared)),
            PostResponse::Malformed => {
                let err = TransferError::Malformed(format!(
                    "unexpected {}-byte reply to chunk at {}",
                    body.len(),
                    self.chunk.offset
                ));
                // the buffer is not trusted again; the retry reads from the source
                drop(prepared);
                self.recover(err, None)
            }
        }
    }

    fn accepted(&self, prepared: Prepared, token: Option<String>) -> TaskOutcome {
        let state = self.file.state();
        let transfer = self.file.transfer();
        let id = transfer.id();

        transfer.record_macs(&prepared.macs);
        self.done.store(true, Ordering::Release);
        transfer.reset_failures();
        if let Some(update) = state.progress.chunk_done(id, self.chunk.offset, self.chunk.size) {
            state.events.publish(TransferEvent::Progress(update));
        }
        trace!(transfer = %id, offset = self.chunk.offset, token = token.is_some(), "chunk accepted");
        drop(prepared);
        self.file.chunk_accepted(token);
        TaskOutcome::Completed
    }

    fn recover(&self, err: TransferError, prepared: Option<Prepared>) -> TaskOutcome {
        if self.is_gone() {
            return TaskOutcome::Aborted;
        }
        let state = self.file.state();
        let transfer = self.file.transfer();
        let id = transfer.id();
        let retry = &state.config.retry;

        let keep = |prepared: Option<Prepared>| {
            if let (Some(prepared), Some(pipeline)) = (prepared, self.file.pipeline()) {
                pipeline.put_back(prepared);
            }
        };

        match err.category() {
            ErrorCategory::Overquota => {
                keep(prepared);
                state.enter_overquota(Direction::Upload, err.retry_after());
                TaskOutcome::Retry {
                    after: Duration::ZERO,
                }
            }
            ErrorCategory::Cancelled => TaskOutcome::Aborted,
            ErrorCategory::TransientNetwork | ErrorCategory::LocalIo => {
                keep(prepared);
                let failures = transfer.note_failure();
                if failures > retry.chunk_retry_limit {
                    let err = TransferError::RetriesExhausted {
                        attempts: failures,
                        last: err.to_string(),
                    };
                    self.file.fail(err.clone());
                    return TaskOutcome::Failed(err);
                }
                if !matches!(err, TransferError::Http { .. } | TransferError::Malformed(_))
                    && failures % retry.port_switch_after.max(1) == 0
                {
                    let alternate = self.file.ports().toggle();
                    debug!(transfer = %id, alternate, "switching storage port");
                }
                let after = retry.chunk_backoff().delay_for(failures);
                debug!(transfer = %id, offset = self.chunk.offset, failures, ?after, error = %err, "chunk upload failed, retrying");
                TaskOutcome::Retry { after }
            }
            ErrorCategory::Fatal | ErrorCategory::Integrity => {
                self.file.fail(err.clone());
                TaskOutcome::Failed(err)
            }
        }
    }
}

impl TaskBody for UploadChunk {
    fn group(&self) -> GroupId {
        self.file.transfer().id()
    }

    fn validate(&self) -> bool {
        !self.file.transfer().is_paused()
    }

    fn is_stale(&self) -> bool {
        self.done.load(Ordering::Acquire) || self.is_gone()
    }

    fn run(self: Arc<Self>, _ctx: TaskContext) -> BoxFuture<'static, TaskOutcome> {
        self.send().boxed()
    }

    fn destroy(&self) {
        self.file.release_cancelled();
    }

    fn describe(&self) -> String {
        format!(
            "{} upload chunk {}-{}",
            self.file.transfer().id(),
            self.chunk.offset,
            self.chunk.end()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpret_responses() {
        assert_eq!(interpret(b""), PostResponse::Accepted);
        assert_eq!(interpret(b"-17"), PostResponse::Error(-17));
        assert_eq!(interpret(b" -3\n"), PostResponse::Error(-3));

        let token = "A".repeat(TOKEN_LEN);
        assert_eq!(interpret(token.as_bytes()), PostResponse::Token(token.clone()));

        assert_eq!(interpret(b"<html>"), PostResponse::Malformed);
        assert_eq!(interpret(&[0xff; TOKEN_LEN]), PostResponse::Malformed);
        assert_eq!(interpret("A ".repeat(18).as_bytes()), PostResponse::Malformed);
    }
}
