//! Crate-wide error type.
//!
//! Mirrors the error taxonomy from the replication design: connection
//! failures, peer death, decode mismatches and timeouts each get their own
//! variant so callers (and the request bridge in particular) can match on
//! them instead of string-sniffing.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("topic name must be non-empty")]
    InvalidTopic,

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("peer is down")]
    PeerDown,

    #[error("request timed out")]
    Timeout,

    #[error("reply did not match the expected shape")]
    DecodeMismatch,

    #[error("failed to encode/decode a wire frame: {0}")]
    Codec(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
