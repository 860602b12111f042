//! Wire protocol library for usbip-client
//!
//! This crate defines the USB/IP wire format spoken between a client that
//! imports devices and a remote host that exports them. It provides typed
//! definitions for the handshake ("operation") messages and the per-request
//! headers, byte-exact encoding/decoding, and stream framing helpers.
//!
//! All multi-byte integers are big-endian on the wire.
//!
//! # Example
//!
//! ```
//! use protocol::{CmdSubmit, Direction, HeaderBasic, HeaderBody, UsbIpHeader, NON_ISOCH};
//!
//! let header = UsbIpHeader {
//!     basic: HeaderBasic { seqnum: 1, devid: 0x0001_0002, direction: Direction::In, ep: 1 },
//!     body: HeaderBody::CmdSubmit(CmdSubmit {
//!         transfer_flags: 0,
//!         transfer_buffer_length: 64,
//!         start_frame: 0,
//!         number_of_packets: NON_ISOCH,
//!         interval: 0,
//!         setup: [0; 8],
//!     }),
//! };
//!
//! let bytes = header.to_bytes();
//! let decoded = UsbIpHeader::decode(&bytes).unwrap();
//! assert_eq!(decoded, header);
//! ```
//!
//! # Handshake
//!
//! ```
//! use protocol::{BusId, ImportRequest};
//!
//! let req = ImportRequest { busid: BusId::new("1-1").unwrap() };
//! assert_eq!(req.encode().len(), ImportRequest::SIZE);
//! ```

pub mod codec;
pub mod error;
pub mod header;
pub mod messages;
pub mod types;
pub mod version;

pub use codec::{RawBusId, read_header, read_op_common};

#[cfg(feature = "async")]
pub use codec::{
    read_data_async, read_header_async, read_interfaces_async, read_iso_descriptors_async,
    read_op_common_async, read_u32_async, read_usb_device_async, write_frame_async,
};
pub use error::{ProtocolError, Result};
pub use header::{
    CmdSubmit, Command, HEADER_SIZE, HeaderBasic, HeaderBody, ISO_DESCRIPTOR_SIZE,
    IsoPacketDescriptor, MAX_ISO_PACKETS, NON_ISOCH, RetSubmit, UsbIpHeader, UsbIpPacket,
    decode_iso_descriptors,
};
pub use messages::{
    ImportRequest, OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_DEVLIST, OP_REQ_IMPORT, OpCommon,
    decode_devlist_count, encode_devlist_request,
};
pub use types::{
    BUS_ID_SIZE, BusId, DEV_PATH_MAX, DeviceSpeed, Direction, OpStatus, UsbDevice, UsbInterface,
    make_devid,
};
pub use version::{ProtocolVersion, USBIP_VERSION};
