//! Domain-specific error types for the console server.
//!
//! All fallible operations return `Result<T, TelconError>`.
//! Nothing the peer sends can make the server panic; malformed input is
//! either filtered, truncated, or reported through one of these variants.

use std::net::SocketAddr;
use thiserror::Error;

/// The canonical error type for telcon.
#[derive(Debug, Error)]
pub enum TelconError {
    // ── Transport Setup Errors ───────────────────────────────────
    /// The listening socket could not be created or bound.
    #[error("unable to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The bound socket could not be put into listening mode.
    #[error("error occurred during listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// No connection could be accepted on a listening socket.
    #[error("unable to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The outbound queue to the connection writer is gone.
    #[error("channel closed")]
    ChannelClosed,

    // ── Configuration Errors ─────────────────────────────────────
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for TelconError {
    fn from(s: String) -> Self {
        TelconError::Other(s)
    }
}

impl From<&str> for TelconError {
    fn from(s: &str) -> Self {
        TelconError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TelconError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        TelconError::ChannelClosed
    }
}

impl From<TelconError> for std::io::Error {
    fn from(e: TelconError) -> Self {
        match e {
            TelconError::Connection(io) => io,
            TelconError::ChannelClosed => {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)
            }
            other => std::io::Error::other(other),
        }
    }
}
