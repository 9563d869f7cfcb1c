//! Error types shared by the server and client.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad auth, malformed init, or a blocked origin/IP. Never retried.
    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("subdomain unavailable")]
    SubdomainUnavailable,

    #[error("public port range exhausted")]
    PortExhausted,

    /// Any I/O failure on the control link.
    #[error("control link closed")]
    LinkClosed,

    /// No response within the request budget.
    #[error("request timed out")]
    RequestTimeout,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// The client has no working origin behind it.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("frame exceeds maximum size: {0} bytes")]
    FrameTooLarge(usize),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
