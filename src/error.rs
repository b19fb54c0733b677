//! Error types shared across the pipeline.
//!
//! Kept deliberately plain (manual `Display`/`Error` impls, no `thiserror`)
//! to match the rest of this crate's dependency footprint.

use std::fmt;

/// Outcome of a failed pipeline stage.
#[derive(Debug)]
pub enum ProxyError {
    /// A client protocol error (bad request line, unsupported method,
    /// unsupported version). The caller has already written an HTML error
    /// page to the client socket; nothing more should be sent.
    ClientProtocol { status: u16, reason: &'static str },
    /// Connect/read/write failure talking to the origin server, or a
    /// response that didn't carry a usable `Content-Length`. Never
    /// reported to the client.
    Upstream(std::io::Error),
    /// Read/write failure on the client socket itself.
    ClientIo(std::io::Error),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::ClientProtocol { status, reason } => {
                write!(f, "client protocol error: {status} {reason}")
            }
            ProxyError::Upstream(e) => write!(f, "upstream error: {e}"),
            ProxyError::ClientIo(e) => write!(f, "client I/O error: {e}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::ClientProtocol { .. } => None,
            ProxyError::Upstream(e) | ProxyError::ClientIo(e) => Some(e),
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
