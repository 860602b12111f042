//! Network subsystem
//!
//! TCP transport, the one-shot import handshake, and per-request
//! correlation on an established session connection.

pub mod correlation;
pub mod handshake;
pub mod transport;

use protocol::BusId;
use std::fmt;

pub use correlation::{
    CancelOutcome, CompletionHandle, PendingState, ReplyDisposition, RequestTable, SubmitRequest,
    UrbCompletion,
};
pub use handshake::{ExportedDevice, import, list_devices};
pub use transport::{Candidates, ConnectOptions, KeepaliveOutcome, connect, resolve};

/// Where a remote device lives: host, service and bus-id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceLocation {
    pub host: String,
    /// TCP port number or service name
    pub service: String,
    pub busid: BusId,
}

impl DeviceLocation {
    pub fn new(host: impl Into<String>, service: impl Into<String>, busid: BusId) -> Self {
        Self {
            host: host.into(),
            service: service.into(),
            busid,
        }
    }
}

impl fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}@[{}]:{}", self.busid, self.host, self.service)
        } else {
            write!(f, "{}@{}:{}", self.busid, self.host, self.service)
        }
    }
}
