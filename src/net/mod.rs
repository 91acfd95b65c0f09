//! Network seams: HTTP transport, backend API and port fallback

pub mod api;
pub mod http;
pub mod ports;

pub use api::{
    ApiError, DownloadTicket, NodeRequest, StaticTicketApi, StorageApi, StoredNode, TicketUrls,
    UploadTicket,
};
pub use http::{collect_body, BodyStream, HttpError, HttpTransport, ReqwestTransport};
pub use ports::PortSelector;
