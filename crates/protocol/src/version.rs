//! Protocol version management

use serde::{Deserialize, Serialize};

/// USB/IP protocol version as carried in the handshake header (BCD)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u16);

/// USB/IP 1.1.1, the only version spoken by Linux `usbipd` and its clones
pub const USBIP_VERSION: ProtocolVersion = ProtocolVersion(0x0111);

impl ProtocolVersion {
    /// Check if a peer speaking `other` can be talked to
    ///
    /// The handshake layout has never changed across released versions, so
    /// only an exact match is accepted.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.0 == other.0
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.0 >> 8,
            (self.0 >> 4) & 0xf,
            self.0 & 0xf
        )
    }
}
