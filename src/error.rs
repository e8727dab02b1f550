//! Error taxonomy for the reactor core.
//!
//! Mirrors the failure modes a caller can actually observe: pool and queue
//! exhaustion, socket errors surfaced through the close callback, and parse
//! failures that are reported but do not tear down the connection.

use std::fmt;
use std::io;

/// Errors surfaced by the public API.
#[derive(Debug)]
pub enum NioError {
    /// A pool or queue could not grow to satisfy an allocation.
    OutOfMemory,
    /// A pool has reached its hard capacity.
    PoolExhausted,
    /// A socket operation failed with the given errno.
    SocketError(i32),
    /// `connect(2)` failed immediately (not `EINPROGRESS`).
    ConnectFailed(io::Error),
    /// The user-supplied parse callback returned a negative value.
    ParseError,
    /// The parse callback reported its output buffer was too small.
    ProtocolCapacity,
}

impl fmt::Display for NioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NioError::OutOfMemory => write!(f, "out of memory growing a pool"),
            NioError::PoolExhausted => write!(f, "pool exhausted (at capacity)"),
            NioError::SocketError(errno) => write!(f, "socket error (errno {errno})"),
            NioError::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            NioError::ParseError => write!(f, "parse callback reported a protocol error"),
            NioError::ProtocolCapacity => write!(f, "parse callback output buffer too small"),
        }
    }
}

impl std::error::Error for NioError {}

impl From<io::Error> for NioError {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => NioError::SocketError(errno),
            None => NioError::ConnectFailed(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, NioError>;
