//! Alternate-port fallback for storage hosts
//!
//! Some networks block the default HTTPS port to storage nodes but let
//! 8080 through. After repeated failures a transfer flips between the
//! two for all of its chunk URLs.

use std::sync::atomic::{AtomicBool, Ordering};

use url::Url;

use crate::error::{Result, TransferError};

/// Rewrite `raw` to use `port`, or the scheme default when `None`.
pub fn with_port(raw: &str, port: Option<u16>) -> Result<String> {
    let mut url = Url::parse(raw).map_err(|e| TransferError::Config(format!("bad URL {}: {}", raw, e)))?;
    url.set_port(port)
        .map_err(|_| TransferError::Config(format!("URL {} cannot carry a port", raw)))?;
    Ok(url.to_string())
}

/// Per-transfer choice between the default and the alternate port.
#[derive(Debug)]
pub struct PortSelector {
    alternate: u16,
    use_alternate: AtomicBool,
}

impl PortSelector {
    pub fn new(alternate: u16) -> Self {
        Self {
            alternate,
            use_alternate: AtomicBool::new(false),
        }
    }

    /// Flip to the other port; returns true if now on the alternate.
    pub fn toggle(&self) -> bool {
        !self.use_alternate.fetch_xor(true, Ordering::AcqRel)
    }

    pub fn is_alternate(&self) -> bool {
        self.use_alternate.load(Ordering::Acquire)
    }

    /// Apply the current choice to a URL
    pub fn apply(&self, raw: &str) -> Result<String> {
        if self.is_alternate() {
            with_port(raw, Some(self.alternate))
        } else {
            with_port(raw, None)
        }
    }
}
