//! Client error types
//!
//! Each layer has its own error family. All of them carry an explicit
//! `Cancelled` variant so a caller can tell "I aborted it" apart from
//! "it failed".

use protocol::{OpStatus, ProtocolError, ProtocolVersion};
use thiserror::Error;

/// Address resolution and connection errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to resolve {host}:{service}: {source}")]
    Resolve {
        host: String,
        service: String,
        #[source]
        source: std::io::Error,
    },

    /// Every candidate address was tried and none accepted the connection
    #[error("All {attempts} candidate addresses failed")]
    AllCandidatesFailed {
        attempts: usize,
        #[source]
        last: Option<std::io::Error>,
    },

    /// I/O failure on an established connection
    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection attempt cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Import and device-list handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The remote host answered with a non-OK status
    #[error("Remote host rejected the request: {0}")]
    RemoteRejected(OpStatus),

    /// The reply describes a different device than the one requested
    #[error("Imported device identity mismatch: requested {requested:?}, got {returned:?}")]
    IdentityMismatch { requested: String, returned: String },

    #[error("Unsupported protocol version {0}")]
    VersionMismatch(ProtocolVersion),

    #[error("Unexpected reply code {code:#06x} (expected {expected:#06x})")]
    UnexpectedReply { expected: u16, code: u16 },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Handshake cancelled")]
    Cancelled,
}

impl HandshakeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for HandshakeError {
    fn from(e: std::io::Error) -> Self {
        Self::Protocol(ProtocolError::Io(e))
    }
}

/// Outcome of a submitted request other than a completion
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The connection went away before the request completed
    #[error("Connection closed")]
    ConnectionClosed,

    /// The session is not forwarding requests (yet or anymore)
    #[error("Device session is not active")]
    NotActive,

    /// The request was unlinked before it completed
    #[error("Request cancelled (unlink status {status})")]
    Cancelled { status: i32 },

    /// The request cannot be framed consistently; nothing was sent
    #[error("Invalid request: {0}")]
    InvalidRequest(&'static str),
}

impl RequestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Errors while bringing up a device session
#[derive(Debug, Error)]
pub enum AttachError {
    /// Every virtual port is in use; no network I/O was attempted
    #[error("No free virtual port")]
    PortsExhausted,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The local device framework refused the imported device
    #[error("Device plug-in rejected: {0}")]
    PlugInRejected(String),

    #[error("Attach cancelled")]
    Cancelled,
}

impl AttachError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Transport(e) => e.is_cancelled(),
            Self::Handshake(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// Errors while tearing down a device session
#[derive(Debug, Error)]
pub enum DetachError {
    #[error("Invalid port {0}")]
    InvalidPort(u16),

    #[error("No device attached on port {0}")]
    NotAttached(u16),

    /// Waiting for the session to finish was aborted; teardown continues
    #[error("Detach wait cancelled")]
    Cancelled,
}

impl DetachError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
