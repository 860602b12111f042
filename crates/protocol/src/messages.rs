//! Handshake (operation) messages
//!
//! Before a connection carries USB traffic it exchanges one request/reply
//! pair of "operation" messages. Every operation starts with the 8-byte
//! common header:
//!
//! ```text
//! [version: u16][code: u16][status: u32]   (big-endian)
//! ```
//!
//! followed by an operation-specific body. Import requests carry a 32-byte
//! bus-id; import replies carry a 312-byte device descriptor.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::error::{ProtocolError, Result};
use crate::types::{
    BUS_ID_SIZE, BusId, DEV_PATH_MAX, DeviceSpeed, OpStatus, UsbDevice, UsbInterface, wire_string,
};
use crate::version::{ProtocolVersion, USBIP_VERSION};

/// Request the list of exportable devices
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Reply carrying the list of exportable devices
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Request to import one device
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Reply to an import request
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Common header of every operation message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCommon {
    pub version: ProtocolVersion,
    pub code: u16,
    pub status: OpStatus,
}

impl OpCommon {
    /// Size of the common header in bytes
    pub const SIZE: usize = 8;

    /// Header for an outgoing request
    pub fn request(code: u16) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status: OpStatus::Ok,
        }
    }

    /// Write header to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.version.0)?;
        writer.write_u16::<BigEndian>(self.code)?;
        writer.write_u32::<BigEndian>(self.status.to_wire())?;
        Ok(())
    }

    /// Decode header from the start of `src`
    pub fn decode(src: &[u8]) -> Result<Self> {
        ProtocolError::ensure_len(Self::SIZE, src.len())?;
        let mut cursor = Cursor::new(src);
        let version = ProtocolVersion(cursor.read_u16::<BigEndian>()?);
        let code = cursor.read_u16::<BigEndian>()?;
        let status = OpStatus::from_wire(cursor.read_u32::<BigEndian>()?);
        Ok(Self {
            version,
            code,
            status,
        })
    }
}

/// OP_REQ_IMPORT: common header followed by the bus-id field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub busid: BusId,
}

impl ImportRequest {
    /// Size of the whole request in bytes
    pub const SIZE: usize = OpCommon::SIZE + BUS_ID_SIZE;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        // Writing into a Vec cannot fail
        let _ = OpCommon::request(OP_REQ_IMPORT).write_to(&mut buf);
        buf.extend_from_slice(&self.busid.to_wire());
        buf
    }
}

/// OP_REQ_DEVLIST: a bare common header
pub fn encode_devlist_request() -> Vec<u8> {
    let mut buf = Vec::with_capacity(OpCommon::SIZE);
    let _ = OpCommon::request(OP_REQ_DEVLIST).write_to(&mut buf);
    buf
}

impl UsbDevice {
    /// Size of the device descriptor on the wire
    pub const WIRE_SIZE: usize = DEV_PATH_MAX + BUS_ID_SIZE + 3 * 4 + 3 * 2 + 6;

    /// Byte range of the bus-id field inside an encoded descriptor
    pub const BUSID_RANGE: std::ops::Range<usize> = DEV_PATH_MAX..DEV_PATH_MAX + BUS_ID_SIZE;

    /// Write descriptor to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut path = [0u8; DEV_PATH_MAX];
        let len = self.path.len().min(DEV_PATH_MAX - 1);
        path[..len].copy_from_slice(&self.path.as_bytes()[..len]);
        writer.write_all(&path)?;

        let mut busid = [0u8; BUS_ID_SIZE];
        let len = self.busid.len().min(BUS_ID_SIZE - 1);
        busid[..len].copy_from_slice(&self.busid.as_bytes()[..len]);
        writer.write_all(&busid)?;

        writer.write_u32::<BigEndian>(self.busnum)?;
        writer.write_u32::<BigEndian>(self.devnum)?;
        writer.write_u32::<BigEndian>(self.speed.to_wire())?;
        writer.write_u16::<BigEndian>(self.vendor_id)?;
        writer.write_u16::<BigEndian>(self.product_id)?;
        writer.write_u16::<BigEndian>(self.bcd_device)?;
        writer.write_all(&[
            self.class,
            self.subclass,
            self.protocol,
            self.configuration_value,
            self.num_configurations,
            self.num_interfaces,
        ])?;
        Ok(())
    }

    /// Decode descriptor from the start of `src`
    pub fn decode(src: &[u8]) -> Result<Self> {
        ProtocolError::ensure_len(Self::WIRE_SIZE, src.len())?;
        let mut cursor = Cursor::new(src);

        let mut path = [0u8; DEV_PATH_MAX];
        cursor.read_exact(&mut path)?;
        let mut busid = [0u8; BUS_ID_SIZE];
        cursor.read_exact(&mut busid)?;

        let busnum = cursor.read_u32::<BigEndian>()?;
        let devnum = cursor.read_u32::<BigEndian>()?;
        let speed = DeviceSpeed::from_wire(cursor.read_u32::<BigEndian>()?)?;
        let vendor_id = cursor.read_u16::<BigEndian>()?;
        let product_id = cursor.read_u16::<BigEndian>()?;
        let bcd_device = cursor.read_u16::<BigEndian>()?;

        let mut tail = [0u8; 6];
        cursor.read_exact(&mut tail)?;

        Ok(Self {
            path: wire_string(&path),
            busid: wire_string(&busid),
            busnum,
            devnum,
            speed,
            vendor_id,
            product_id,
            bcd_device,
            class: tail[0],
            subclass: tail[1],
            protocol: tail[2],
            configuration_value: tail[3],
            num_configurations: tail[4],
            num_interfaces: tail[5],
        })
    }
}

impl UsbInterface {
    /// Size of an interface record (the fourth byte is padding)
    pub const WIRE_SIZE: usize = 4;

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[self.class, self.subclass, self.protocol, 0])?;
        Ok(())
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        ProtocolError::ensure_len(Self::WIRE_SIZE, src.len())?;
        Ok(Self {
            class: src[0],
            subclass: src[1],
            protocol: src[2],
        })
    }
}

/// Decode the device count that follows an OP_REP_DEVLIST common header
pub fn decode_devlist_count(src: &[u8]) -> Result<u32> {
    ProtocolError::ensure_len(4, src.len())?;
    Ok(u32::from_be_bytes([src[0], src[1], src[2], src[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device() -> UsbDevice {
        UsbDevice {
            path: "/sys/devices/pci0000:00/0000:00:14.0/usb1/1-1".to_string(),
            busid: "1-1".to_string(),
            busnum: 1,
            devnum: 2,
            speed: DeviceSpeed::High,
            vendor_id: 0x1234,
            product_id: 0x5678,
            bcd_device: 0x0100,
            class: 0,
            subclass: 0,
            protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 2,
        }
    }

    #[test]
    fn test_op_common_layout() {
        let mut buf = Vec::new();
        OpCommon::request(OP_REQ_IMPORT).write_to(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x11, 0x80, 0x03, 0, 0, 0, 0]);

        let decoded = OpCommon::decode(&buf).unwrap();
        assert_eq!(decoded.code, OP_REQ_IMPORT);
        assert_eq!(decoded.status, OpStatus::Ok);
    }

    #[test]
    fn test_op_common_truncated() {
        assert!(matches!(
            OpCommon::decode(&[0x01, 0x11, 0x00]),
            Err(ProtocolError::Truncated {
                needed: 8,
                available: 3
            })
        ));
    }

    #[test]
    fn test_import_request_layout() {
        let req = ImportRequest {
            busid: BusId::new("1-1").unwrap(),
        };
        let bytes = req.encode();
        assert_eq!(bytes.len(), ImportRequest::SIZE);
        assert_eq!(&bytes[8..11], b"1-1");
        assert!(bytes[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_usb_device_wire_size() {
        assert_eq!(UsbDevice::WIRE_SIZE, 312);

        let mut buf = Vec::new();
        sample_device().write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), UsbDevice::WIRE_SIZE);
        assert_eq!(&buf[UsbDevice::BUSID_RANGE][..3], b"1-1");
    }

    #[test]
    fn test_usb_device_decode() {
        let device = sample_device();
        let mut buf = Vec::new();
        device.write_to(&mut buf).unwrap();

        let decoded = UsbDevice::decode(&buf).unwrap();
        assert_eq!(decoded, device);
        assert_eq!(decoded.devid(), 0x0001_0002);
    }

    #[test]
    fn test_usb_device_bad_speed() {
        let mut buf = Vec::new();
        sample_device().write_to(&mut buf).unwrap();
        // speed field follows busnum and devnum
        let speed_at = DEV_PATH_MAX + BUS_ID_SIZE + 8;
        buf[speed_at + 3] = 42;
        assert!(matches!(
            UsbDevice::decode(&buf),
            Err(ProtocolError::Malformed { field: "speed", .. })
        ));
    }

    #[test]
    fn test_interface_decode() {
        let intf = UsbInterface::decode(&[0x03, 0x01, 0x02, 0xff]).unwrap();
        assert_eq!(intf.class, 0x03);
        assert_eq!(intf.subclass, 0x01);
        assert_eq!(intf.protocol, 0x02);
    }

    #[test]
    fn test_devlist_count() {
        assert_eq!(decode_devlist_count(&[0, 0, 0, 3]).unwrap(), 3);
        assert!(decode_devlist_count(&[0, 0]).is_err());
    }
}
