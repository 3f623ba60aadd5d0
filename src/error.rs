//! Error types shared by the port forwarding backends.

use std::io;

use thiserror::Error;

/// Result type for port forwarding operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the backends and the backend selector.
///
/// Per-mapping operations report these as FAIL lines and keep going; the IP
/// fetch and list operations treat them as fatal.
#[derive(Debug, Error)]
pub enum Error {
    /// Network I/O failure.
    #[error("{0}")]
    Io(#[from] io::Error),

    /// All retransmissions expired without a usable response.
    #[error("timed out waiting for a response")]
    Timeout,

    /// A numeric argument is outside the protocol's allowed range.
    #[error("value out of range")]
    Range,

    /// The active backend does not implement the operation.
    #[error("operation not supported")]
    Unsupported,

    /// Malformed packet, unexpected response, bad XML, non-OK HTTP status.
    #[error("{0}")]
    Protocol(String),

    /// A NAT-PMP result code other than success.
    #[error("{0}")]
    Refused(&'static str),

    /// The router answered a SOAP request with a fault.
    #[error("soap: {0}")]
    Soap(String),

    /// The router installed a mapping on a different external port than the
    /// one requested.
    #[error("router mapped a different external port than requested")]
    PortConflict,

    /// `--protocol` named a backend that is not registered.
    #[error("unknown protocol: {0}")]
    UnknownBackend(String),

    /// Every registered backend failed to probe.
    #[error("failed to initialize/discover a port forwarding mechanism")]
    NoBackend,
}
