//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
///
/// Any of these observed on a live connection is fatal to that connection:
/// once the byte stream can no longer be trusted there is no way to resync.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Fewer bytes available than the structure being decoded needs
    #[error("Truncated data: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// A field holds a value outside what the protocol allows
    #[error("Malformed {field}: {value}")]
    Malformed { field: &'static str, value: i64 },

    /// Bus-id is empty, too long for the 32-byte field, or contains NUL
    #[error("Invalid bus-id: {0:?}")]
    InvalidBusId(String),

    /// I/O error while reading or writing a stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn malformed(field: &'static str, value: impl Into<i64>) -> Self {
        Self::Malformed {
            field,
            value: value.into(),
        }
    }

    /// Check that `available` bytes cover `needed`
    pub(crate) fn ensure_len(needed: usize, available: usize) -> Result<()> {
        if available < needed {
            Err(Self::Truncated { needed, available })
        } else {
            Ok(())
        }
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
