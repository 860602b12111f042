//! USB and protocol type definitions
//!
//! This module defines the USB-related types shared by the handshake and the
//! per-request protocol: bus-ids, device speeds, transfer direction, operation
//! status codes and the exported device descriptor.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Size of the NUL-padded bus-id field on the wire
pub const BUS_ID_SIZE: usize = 32;

/// Size of the NUL-padded sysfs path field on the wire
pub const DEV_PATH_MAX: usize = 256;

/// Bus-id of a device on the exporting host (e.g. `"1-1"` or `"3-2.4"`)
///
/// Guaranteed to fit the 32-byte wire field including its terminating NUL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BusId(String);

impl BusId {
    /// Validate and wrap a bus-id string
    pub fn new(busid: impl Into<String>) -> Result<Self> {
        let busid = busid.into();
        if busid.is_empty() || busid.len() >= BUS_ID_SIZE || busid.contains('\0') {
            return Err(ProtocolError::InvalidBusId(busid));
        }
        Ok(Self(busid))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encode into the fixed-size NUL-padded wire field
    pub fn to_wire(&self) -> [u8; BUS_ID_SIZE] {
        let mut field = [0u8; BUS_ID_SIZE];
        field[..self.0.len()].copy_from_slice(self.0.as_bytes());
        field
    }

    /// Byte-for-byte comparison against a received wire field
    ///
    /// Bytes after the first NUL are ignored, as with `strncmp`.
    pub fn matches_wire(&self, field: &[u8]) -> bool {
        trim_nul(field) == self.0.as_bytes()
    }
}

impl std::fmt::Display for BusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for BusId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for BusId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<BusId> for String {
    fn from(value: BusId) -> Self {
        value.0
    }
}

/// Slice up to (not including) the first NUL byte
pub(crate) fn trim_nul(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

/// Decode a NUL-padded string field, replacing invalid UTF-8
pub(crate) fn wire_string(field: &[u8]) -> String {
    String::from_utf8_lossy(trim_nul(field)).into_owned()
}

/// Pack bus and device numbers the way the Linux stub driver does
pub fn make_devid(busnum: u32, devnum: u32) -> u32 {
    ((busnum & 0xffff) << 16) | (devnum & 0xffff)
}

/// USB device speed (values of the Linux `usb_device_speed` enum)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceSpeed {
    /// Speed not reported
    Unknown,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// Wireless USB 2.5
    Wireless,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

impl DeviceSpeed {
    pub fn from_wire(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::Unknown,
            1 => Self::Low,
            2 => Self::Full,
            3 => Self::High,
            4 => Self::Wireless,
            5 => Self::Super,
            6 => Self::SuperPlus,
            other => return Err(ProtocolError::malformed("speed", other)),
        })
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Low => 1,
            Self::Full => 2,
            Self::High => 3,
            Self::Wireless => 4,
            Self::Super => 5,
            Self::SuperPlus => 6,
        }
    }

    /// Whether the device needs a USB 3.x root hub port
    pub fn is_superspeed(self) -> bool {
        self >= Self::Super
    }
}

impl std::fmt::Display for DeviceSpeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown Speed",
            Self::Low => "Low Speed(1.5Mbps)",
            Self::Full => "Full Speed(12Mbps)",
            Self::High => "High Speed(480Mbps)",
            Self::Wireless => "Wireless Speed(2.5Gbps)",
            Self::Super => "Super Speed(5Gbps)",
            Self::SuperPlus => "Super Speed Plus(10Gbps)",
        };
        f.write_str(s)
    }
}

/// Transfer direction, from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Out),
            1 => Ok(Self::In),
            other => Err(ProtocolError::malformed("direction", other)),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Self::Out => 0,
            Self::In => 1,
        }
    }

    /// Direction encoded in bit 7 of an endpoint address
    pub fn from_endpoint_address(address: u8) -> Self {
        if address & 0x80 != 0 { Self::In } else { Self::Out }
    }
}

/// Status carried in the handshake common header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    /// Request completed successfully
    Ok,
    /// Device is not available for export
    NotAvailable,
    /// Device is already imported by someone else
    DeviceBusy,
    /// Device is in an error state
    DeviceError,
    /// No device with the requested bus-id
    NoDevice,
    /// Unspecified failure
    Error,
    /// A status this client does not know
    Unknown(u32),
}

impl OpStatus {
    pub fn from_wire(value: u32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::NotAvailable,
            2 => Self::DeviceBusy,
            3 => Self::DeviceError,
            4 => Self::NoDevice,
            5 => Self::Error,
            other => Self::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::NotAvailable => 1,
            Self::DeviceBusy => 2,
            Self::DeviceError => 3,
            Self::NoDevice => 4,
            Self::Error => 5,
            Self::Unknown(other) => other,
        }
    }
}

impl std::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::NotAvailable => write!(f, "device not available"),
            Self::DeviceBusy => write!(f, "device busy (already exported to another client)"),
            Self::DeviceError => write!(f, "device in error state"),
            Self::NoDevice => write!(f, "no such device"),
            Self::Error => write!(f, "unspecified error"),
            Self::Unknown(code) => write!(f, "unknown status {}", code),
        }
    }
}

/// Exported USB device as described by the remote host
///
/// Populated from an import or device-list reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDevice {
    /// Sysfs path on the remote host
    pub path: String,
    /// Bus-id on the remote host
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: DeviceSpeed,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Device release number (bcdDevice)
    pub bcd_device: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl UsbDevice {
    /// Device id used in every per-request header for this device
    pub fn devid(&self) -> u32 {
        make_devid(self.busnum, self.devnum)
    }
}

/// Interface summary returned by the device-list query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbInterface {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busid_validation() {
        assert!(BusId::new("1-1").is_ok());
        assert!(BusId::new("").is_err());
        assert!(BusId::new("a".repeat(31)).is_ok());
        assert!(BusId::new("a".repeat(32)).is_err());
        assert!(BusId::new("1-\01").is_err());
    }

    #[test]
    fn test_busid_wire() {
        let busid = BusId::new("3-2.4").unwrap();
        let wire = busid.to_wire();
        assert_eq!(&wire[..5], b"3-2.4");
        assert!(wire[5..].iter().all(|&b| b == 0));
        assert!(busid.matches_wire(&wire));
    }

    #[test]
    fn test_busid_matches_ignores_trailing_garbage() {
        let busid = BusId::new("1-1").unwrap();
        let mut field = [0u8; BUS_ID_SIZE];
        field[..3].copy_from_slice(b"1-1");
        field[10] = b'x';
        assert!(busid.matches_wire(&field));

        field[3] = b'0';
        assert!(!busid.matches_wire(&field));
    }

    #[test]
    fn test_make_devid() {
        assert_eq!(make_devid(1, 2), 0x0001_0002);
        assert_eq!(make_devid(0x12, 0x7f), 0x0012_007f);
    }

    #[test]
    fn test_speed_wire_values() {
        for value in 0..=6 {
            let speed = DeviceSpeed::from_wire(value).unwrap();
            assert_eq!(speed.to_wire(), value);
        }
        assert!(DeviceSpeed::from_wire(7).is_err());
        assert!(DeviceSpeed::Super.is_superspeed());
        assert!(!DeviceSpeed::High.is_superspeed());
    }

    #[test]
    fn test_direction_from_endpoint() {
        assert_eq!(Direction::from_endpoint_address(0x81), Direction::In);
        assert_eq!(Direction::from_endpoint_address(0x02), Direction::Out);
        assert!(Direction::from_wire(2).is_err());
    }

    #[test]
    fn test_op_status() {
        assert_eq!(OpStatus::from_wire(0), OpStatus::Ok);
        assert_eq!(OpStatus::from_wire(2), OpStatus::DeviceBusy);
        assert_eq!(OpStatus::from_wire(99), OpStatus::Unknown(99));
        assert_eq!(OpStatus::Unknown(99).to_wire(), 99);
    }
}
