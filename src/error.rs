//! Errors raised by the relay.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The listener could not be opened; the relay does not start.
    #[error("could not open listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("could not accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("read from {peer} failed: {source}")]
    Read {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("could not decode update: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("could not encode update: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("line from {peer} exceeds {limit} bytes without a delimiter")]
    LineTooLong { peer: SocketAddr, limit: usize },

    #[error("could not dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("dialing {addr} timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("write to {host} failed: {source}")]
    Write {
        host: String,
        #[source]
        source: io::Error,
    },
}
