//! Errors from logging setup and the loopback test server

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad log filter, or a subscriber is already installed
    #[error("Logging setup failed: {0}")]
    Logging(String),

    /// The peer sent an operation the mock server was not scripted for
    #[error("Unexpected operation {code:#06x} (expected {expected:#06x})")]
    UnexpectedOp { expected: u16, code: u16 },

    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
