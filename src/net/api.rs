//! Backend API seam: URL acquisition, upload tickets and node creation

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::http::HttpError;
use crate::crypto::FileKey;
use crate::error::{Result, TransferError};

/// Where a file's bytes can be fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketUrls {
    /// One host serves the whole file
    Single(String),
    /// Six hosts serve five data stripes and one parity stripe
    Raid([String; 6]),
}

impl TicketUrls {
    pub fn from_list(urls: Vec<String>) -> Result<Self> {
        match urls.len() {
            1 => Ok(TicketUrls::Single(urls.into_iter().next().unwrap_or_default())),
            6 => {
                let parts: [String; 6] = urls
                    .try_into()
                    .map_err(|_| TransferError::Malformed("RAID ticket".into()))?;
                Ok(TicketUrls::Raid(parts))
            }
            n => Err(TransferError::Malformed(format!(
                "expected 1 or 6 download URLs, got {}",
                n
            ))),
        }
    }

    pub fn is_raid(&self) -> bool {
        matches!(self, TicketUrls::Raid(_))
    }
}

/// Result of a download URL request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTicket {
    pub size: u64,
    pub urls: TicketUrls,
    pub name: Option<String>,
}

/// Result of an upload ticket request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
    pub post_url: String,
}

/// Everything needed to create the file node after an upload
#[derive(Debug, Clone)]
pub struct NodeRequest {
    pub name: String,
    pub completion_token: String,
    pub key: FileKey,
    pub size: u64,
    pub parent: Option<String>,
}

/// A node the backend accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredNode {
    pub handle: String,
}

/// Backend error, decoded from its numeric code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("temporary backend error {0}")]
    Transient(i64),

    #[error("too many requests")]
    TooMany,

    #[error("node not found")]
    NotFound,

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("over quota")]
    Overquota { retry_after: Option<Duration> },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Transport(#[from] HttpError),

    #[error("backend error {0}")]
    Other(i64),
}

impl ApiError {
    pub fn from_code(code: i64) -> Self {
        match code {
            -3 | -4 | -18 => ApiError::Transient(code),
            -6 => ApiError::TooMany,
            -9 => ApiError::NotFound,
            -11 => ApiError::AccessDenied("access violation".into()),
            -16 => ApiError::AccessDenied("blocked".into()),
            -17 => ApiError::Overquota { retry_after: None },
            other => ApiError::Other(other),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transient(_) => true,
            ApiError::Transport(HttpError::Status(status)) => *status >= 500,
            ApiError::Transport(_) => true,
            _ => false,
        }
    }
}

/// Parse a bare negative error code such as `-17`.
pub fn parse_error_code(body: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(body).ok()?.trim();
    if !text.starts_with('-') {
        return None;
    }
    text.parse().ok()
}

#[async_trait]
pub trait StorageApi: Send + Sync {
    /// Resolve a node handle to its size and chunk URLs.
    async fn download_url(&self, handle: &str) -> std::result::Result<DownloadTicket, ApiError>;

    /// Obtain a POST target for `size` bytes. `attempt` counts prior tries.
    async fn upload_ticket(
        &self,
        size: u64,
        attempt: u32,
    ) -> std::result::Result<UploadTicket, ApiError>;

    /// Create the file node once every chunk has been accepted.
    async fn put_node(&self, request: NodeRequest) -> std::result::Result<StoredNode, ApiError>;
}

/// JSON form of a pre-resolved download ticket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketDocument {
    pub size: u64,
    pub urls: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Serves one fixed ticket, for links resolved outside the engine.
#[derive(Debug, Clone)]
pub struct StaticTicketApi {
    ticket: DownloadTicket,
}

impl StaticTicketApi {
    pub fn new(ticket: DownloadTicket) -> Self {
        Self { ticket }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let doc: TicketDocument = serde_json::from_str(json)
            .map_err(|e| TransferError::Config(format!("invalid ticket: {}", e)))?;
        Ok(Self::new(DownloadTicket {
            size: doc.size,
            urls: TicketUrls::from_list(doc.urls)?,
            name: doc.name,
        }))
    }

    pub fn ticket(&self) -> &DownloadTicket {
        &self.ticket
    }
}

#[async_trait]
impl StorageApi for StaticTicketApi {
    async fn download_url(&self, _handle: &str) -> std::result::Result<DownloadTicket, ApiError> {
        Ok(self.ticket.clone())
    }

    async fn upload_ticket(
        &self,
        _size: u64,
        _attempt: u32,
    ) -> std::result::Result<UploadTicket, ApiError> {
        Err(ApiError::Unsupported("static tickets are download-only".into()))
    }

    async fn put_node(&self, _request: NodeRequest) -> std::result::Result<StoredNode, ApiError> {
        Err(ApiError::Unsupported("static tickets are download-only".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ApiError::from_code(-3), ApiError::Transient(-3));
        assert_eq!(ApiError::from_code(-9), ApiError::NotFound);
        assert_eq!(
            ApiError::from_code(-17),
            ApiError::Overquota { retry_after: None }
        );
        assert!(matches!(ApiError::from_code(-16), ApiError::AccessDenied(_)));
        assert_eq!(ApiError::from_code(-99), ApiError::Other(-99));
        assert!(ApiError::from_code(-4).is_transient());
        assert!(!ApiError::from_code(-11).is_transient());
    }

    #[test]
    fn test_parse_error_code() {
        assert_eq!(parse_error_code(b"-17"), Some(-17));
        assert_eq!(parse_error_code(b" -3\n"), Some(-3));
        assert_eq!(parse_error_code(b"17"), None);
        assert_eq!(parse_error_code(b"-x"), None);
        assert_eq!(parse_error_code(&[0xff, 0xfe]), None);
    }

    #[test]
    fn test_ticket_urls() {
        assert!(matches!(
            TicketUrls::from_list(vec!["http://a".into()]),
            Ok(TicketUrls::Single(_))
        ));
        let six: Vec<String> = (0..6).map(|i| format!("http://p{}", i)).collect();
        assert!(TicketUrls::from_list(six).unwrap().is_raid());
        assert!(TicketUrls::from_list(vec![]).is_err());
        assert!(TicketUrls::from_list(vec!["a".into(), "b".into()]).is_err());
    }

    #[tokio::test]
    async fn test_static_ticket_api() {
        let api = StaticTicketApi::from_json(
            r#"{"size": 42, "urls": ["https://host/dl/x"], "name": "a.bin"}"#,
        )
        .unwrap();
        let ticket = api.download_url("ignored").await.unwrap();
        assert_eq!(ticket.size, 42);
        assert_eq!(ticket.name.as_deref(), Some("a.bin"));
        assert!(matches!(
            api.upload_ticket(1, 0).await,
            Err(ApiError::Unsupported(_))
        ));
    }
}
