//! HTTP transport seam
//!
//! The engine only ever needs two shapes of request: a streamed GET of a
//! byte range and a POST whose whole response fits in memory. Both go
//! through [`HttpTransport`] so tests can substitute a scripted backend.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use thiserror::Error;
use tracing::trace;

/// Transport-level failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    #[error("HTTP status {0}")]
    Status(u16),

    #[error("connection failed: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("body stream failed: {0}")]
    Body(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Response body delivered piecewise
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, HttpError>> + Send>>;

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issue a GET, resolving once headers arrive. Non-2xx statuses are errors.
    async fn get(&self, url: &str) -> Result<BodyStream, HttpError>;

    /// POST `body` and collect the full response.
    async fn post(&self, url: &str, body: Bytes) -> Result<Bytes, HttpError>;
}

/// Drain a body stream, reporting the running byte count after each piece.
///
/// Fails with `Body` if the stream yields more than `expected` bytes.
pub async fn collect_body<F>(
    mut body: BodyStream,
    expected: u64,
    mut on_progress: F,
) -> Result<Bytes, HttpError>
where
    F: FnMut(u64),
{
    let mut buf = BytesMut::with_capacity(expected as usize);
    while let Some(piece) = body.next().await {
        let piece = piece?;
        if buf.len() as u64 + piece.len() as u64 > expected {
            return Err(HttpError::Body(format!(
                "body exceeds expected {} bytes",
                expected
            )));
        }
        buf.extend_from_slice(&piece);
        trace!(received = buf.len(), expected, "body progress");
        on_progress(buf.len() as u64);
    }
    Ok(buf.freeze())
}

/// Production transport backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("cumulus/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HttpError::Network(e.to_string()))?;
        Ok(Self {
            client,
            request_timeout,
        })
    }

    fn classify(&self, err: reqwest::Error) -> HttpError {
        if err.is_timeout() {
            HttpError::Timeout(self.request_timeout)
        } else if let Some(status) = err.status() {
            HttpError::Status(status.as_u16())
        } else if err.is_builder() {
            HttpError::InvalidUrl(err.to_string())
        } else {
            HttpError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<BodyStream, HttpError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status(status.as_u16()));
        }

        let stream = response
            .bytes_stream()
            .map(|piece| piece.map_err(|e| HttpError::Body(e.to_string())));
        Ok(Box::pin(stream))
    }

    async fn post(&self, url: &str, body: Bytes) -> Result<Bytes, HttpError> {
        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status(status.as_u16()));
        }

        response.bytes().await.map_err(|e| self.classify(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn body(pieces: Vec<&'static [u8]>) -> BodyStream {
        Box::pin(stream::iter(
            pieces.into_iter().map(|p| Ok(Bytes::from_static(p))),
        ))
    }

    #[tokio::test]
    async fn test_collect_body_reports_progress() {
        let mut seen = Vec::new();
        let bytes = collect_body(body(vec![b"abc", b"de"]), 5, |n| seen.push(n))
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"abcde");
        assert_eq!(seen, vec![3, 5]);
    }

    #[tokio::test]
    async fn test_collect_body_rejects_overflow() {
        let result = collect_body(body(vec![b"abcdef"]), 4, |_| {}).await;
        assert!(matches!(result, Err(HttpError::Body(_))));
    }

    #[tokio::test]
    async fn test_collect_body_propagates_stream_error() {
        let failing: BodyStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Err(HttpError::Network("reset".into())),
        ]));
        let result = collect_body(failing, 10, |_| {}).await;
        assert_eq!(result, Err(HttpError::Network("reset".into())));
    }

    #[test]
    fn test_reqwest_transport_builds() {
        assert!(ReqwestTransport::new(Duration::from_secs(5), Duration::from_secs(30)).is_ok());
    }
}
