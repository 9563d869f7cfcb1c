//! Tunlink Shared Library
//!
//! Frame codec, error types, and rate-limit window math used by both the
//! tunnel server and the client.

pub mod error;
pub mod frame;
pub mod limits;

pub use error::{Error, Result};
pub use frame::{Frame, TunnelProtocol, MAX_FRAME_SIZE};
pub use limits::{RateLimits, Window};
