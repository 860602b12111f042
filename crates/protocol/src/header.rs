//! Per-request headers
//!
//! Once a device is imported, every message on the connection starts with a
//! fixed 48-byte header: a 20-byte basic part shared by all commands and a
//! 28-byte command-specific part.
//!
//! ```text
//! 0      4       8      12          16   20                          48
//! [cmd  ][seqnum][devid][direction][ep  ][ command-specific, padded  ]
//! ```
//!
//! A CMD_SUBMIT for an OUT transfer is followed by `transfer_buffer_length`
//! bytes of data; a RET_SUBMIT for an IN transfer is followed by
//! `actual_length` bytes. Isochronous packet descriptors (16 bytes each)
//! follow the data when `number_of_packets` is positive.
//!
//! All fields are big-endian. This module is the only place that converts
//! between host and wire byte order for these structures.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::types::Direction;

/// Size of every per-request header
pub const HEADER_SIZE: usize = 48;

/// Size of one isochronous packet descriptor
pub const ISO_DESCRIPTOR_SIZE: usize = 16;

/// `number_of_packets` value for non-isochronous transfers
pub const NON_ISOCH: i32 = -1;

/// Upper bound on isochronous packets per request
pub const MAX_ISO_PACKETS: i32 = 1024;

const BASIC_SIZE: usize = 20;

/// Per-request command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Submit a USB request (URB)
    CmdSubmit,
    /// Unlink a previously submitted request
    CmdUnlink,
    /// Completion of a submitted request
    RetSubmit,
    /// Completion of an unlink request
    RetUnlink,
}

impl Command {
    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::CmdSubmit),
            2 => Ok(Self::CmdUnlink),
            3 => Ok(Self::RetSubmit),
            4 => Ok(Self::RetUnlink),
            other => Err(ProtocolError::malformed("command", other)),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Self::CmdSubmit => 1,
            Self::CmdUnlink => 2,
            Self::RetSubmit => 3,
            Self::RetUnlink => 4,
        }
    }
}

/// Fields shared by every per-request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderBasic {
    /// Sequence number correlating a command with its reply
    pub seqnum: u32,
    /// `(busnum << 16) | devnum` of the imported device
    pub devid: u32,
    pub direction: Direction,
    /// Endpoint number (without the direction bit)
    pub ep: u32,
}

/// CMD_SUBMIT specific fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdSubmit {
    pub transfer_flags: u32,
    /// Size of the OUT data that follows, or of the IN buffer expected back
    pub transfer_buffer_length: i32,
    pub start_frame: i32,
    /// Number of isochronous descriptors that follow, or [`NON_ISOCH`]
    pub number_of_packets: i32,
    pub interval: i32,
    /// Setup packet for control transfers
    pub setup: [u8; 8],
}

/// RET_SUBMIT specific fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSubmit {
    /// 0 on success, negative Linux errno otherwise
    pub status: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
}

/// Command-specific part of a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderBody {
    CmdSubmit(CmdSubmit),
    RetSubmit(RetSubmit),
    /// Sequence number of the submission to unlink
    CmdUnlink { unlink_seqnum: u32 },
    RetUnlink { status: i32 },
}

/// A complete 48-byte per-request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbIpHeader {
    pub basic: HeaderBasic,
    pub body: HeaderBody,
}

fn check_packet_count(field: &'static str, count: i32) -> Result<()> {
    if (NON_ISOCH..=MAX_ISO_PACKETS).contains(&count) {
        Ok(())
    } else {
        Err(ProtocolError::malformed(field, count))
    }
}

impl UsbIpHeader {
    pub fn command(&self) -> Command {
        match self.body {
            HeaderBody::CmdSubmit(_) => Command::CmdSubmit,
            HeaderBody::RetSubmit(_) => Command::RetSubmit,
            HeaderBody::CmdUnlink { .. } => Command::CmdUnlink,
            HeaderBody::RetUnlink { .. } => Command::RetUnlink,
        }
    }

    pub fn seqnum(&self) -> u32 {
        self.basic.seqnum
    }

    /// Number of isochronous descriptors that follow this header's data
    pub fn iso_packet_count(&self) -> usize {
        let count = match self.body {
            HeaderBody::CmdSubmit(cmd) => cmd.number_of_packets,
            HeaderBody::RetSubmit(ret) => ret.number_of_packets,
            _ => 0,
        };
        count.max(0) as usize
    }

    /// Length of the data a sender attaches to this header
    ///
    /// Only CMD_SUBMIT can answer this alone; a RET_SUBMIT carries IN data
    /// whose presence depends on the direction of the original submission.
    pub fn outbound_data_len(&self) -> usize {
        match self.body {
            HeaderBody::CmdSubmit(cmd) if self.basic.direction == Direction::Out => {
                cmd.transfer_buffer_length.max(0) as usize
            }
            _ => 0,
        }
    }

    /// Append the 48-byte wire form to `buf`
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.command().to_wire());
        buf.put_u32(self.basic.seqnum);
        buf.put_u32(self.basic.devid);
        buf.put_u32(self.basic.direction.to_wire());
        buf.put_u32(self.basic.ep);

        let written = match self.body {
            HeaderBody::CmdSubmit(cmd) => {
                buf.put_u32(cmd.transfer_flags);
                buf.put_i32(cmd.transfer_buffer_length);
                buf.put_i32(cmd.start_frame);
                buf.put_i32(cmd.number_of_packets);
                buf.put_i32(cmd.interval);
                buf.put_slice(&cmd.setup);
                28
            }
            HeaderBody::RetSubmit(ret) => {
                buf.put_i32(ret.status);
                buf.put_i32(ret.actual_length);
                buf.put_i32(ret.start_frame);
                buf.put_i32(ret.number_of_packets);
                buf.put_i32(ret.error_count);
                20
            }
            HeaderBody::CmdUnlink { unlink_seqnum } => {
                buf.put_u32(unlink_seqnum);
                4
            }
            HeaderBody::RetUnlink { status } => {
                buf.put_i32(status);
                4
            }
        };
        buf.put_bytes(0, HEADER_SIZE - BASIC_SIZE - written);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        self.encode(&mut &mut out[..]);
        out
    }

    /// Decode a header from the first 48 bytes of `src`
    pub fn decode(src: &[u8]) -> Result<Self> {
        ProtocolError::ensure_len(HEADER_SIZE, src.len())?;
        let mut buf = &src[..HEADER_SIZE];

        let command = Command::from_wire(buf.get_u32())?;
        let basic = HeaderBasic {
            seqnum: buf.get_u32(),
            devid: buf.get_u32(),
            direction: Direction::from_wire(buf.get_u32())?,
            ep: buf.get_u32(),
        };

        let body = match command {
            Command::CmdSubmit => {
                let transfer_flags = buf.get_u32();
                let transfer_buffer_length = buf.get_i32();
                let start_frame = buf.get_i32();
                let number_of_packets = buf.get_i32();
                let interval = buf.get_i32();
                let mut setup = [0u8; 8];
                buf.copy_to_slice(&mut setup);

                if transfer_buffer_length < 0 {
                    return Err(ProtocolError::malformed(
                        "transfer_buffer_length",
                        transfer_buffer_length,
                    ));
                }
                check_packet_count("number_of_packets", number_of_packets)?;

                HeaderBody::CmdSubmit(CmdSubmit {
                    transfer_flags,
                    transfer_buffer_length,
                    start_frame,
                    number_of_packets,
                    interval,
                    setup,
                })
            }
            Command::RetSubmit => {
                let ret = RetSubmit {
                    status: buf.get_i32(),
                    actual_length: buf.get_i32(),
                    start_frame: buf.get_i32(),
                    number_of_packets: buf.get_i32(),
                    error_count: buf.get_i32(),
                };
                if ret.actual_length < 0 {
                    return Err(ProtocolError::malformed("actual_length", ret.actual_length));
                }
                check_packet_count("number_of_packets", ret.number_of_packets)?;
                HeaderBody::RetSubmit(ret)
            }
            Command::CmdUnlink => HeaderBody::CmdUnlink {
                unlink_seqnum: buf.get_u32(),
            },
            Command::RetUnlink => HeaderBody::RetUnlink {
                status: buf.get_i32(),
            },
        };

        Ok(Self { basic, body })
    }
}

/// Isochronous packet descriptor (wire form of `usb_iso_packet_descriptor`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoPacketDescriptor {
    /// Offset of this packet inside the transfer buffer
    pub offset: u32,
    /// Expected length
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacketDescriptor {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.offset);
        buf.put_u32(self.length);
        buf.put_u32(self.actual_length);
        buf.put_i32(self.status);
    }
}

/// Decode `count` contiguous descriptors from the start of `src`
pub fn decode_iso_descriptors(src: &[u8], count: usize) -> Result<Vec<IsoPacketDescriptor>> {
    ProtocolError::ensure_len(count * ISO_DESCRIPTOR_SIZE, src.len())?;
    let mut buf = src;
    Ok((0..count)
        .map(|_| IsoPacketDescriptor {
            offset: buf.get_u32(),
            length: buf.get_u32(),
            actual_length: buf.get_u32(),
            status: buf.get_i32(),
        })
        .collect())
}

/// A header together with the variable-length continuation that follows it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbIpPacket {
    pub header: UsbIpHeader,
    /// Transfer data (OUT data for CMD_SUBMIT, IN data for RET_SUBMIT)
    pub data: Bytes,
    /// Isochronous descriptors; length matches the header's packet count
    pub iso_descriptors: Vec<IsoPacketDescriptor>,
}

impl UsbIpPacket {
    /// A packet with no continuation (unlinks, OUT completions)
    pub fn bare(header: UsbIpHeader) -> Self {
        Self {
            header,
            data: Bytes::new(),
            iso_descriptors: Vec::new(),
        }
    }

    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.data.len() + self.iso_descriptors.len() * ISO_DESCRIPTOR_SIZE
    }

    pub fn encode(&self) -> BytesMut {
        debug_assert_eq!(self.iso_descriptors.len(), self.header.iso_packet_count());

        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.data);
        for desc in &self.iso_descriptors {
            desc.encode(&mut buf);
        }
        buf
    }

    /// Decode a packet whose data section is `data_len` bytes long
    ///
    /// Returns the packet and the number of bytes consumed from `src`.
    pub fn decode(src: &[u8], data_len: usize) -> Result<(Self, usize)> {
        let header = UsbIpHeader::decode(src)?;
        let iso_count = header.iso_packet_count();
        let total = HEADER_SIZE + data_len + iso_count * ISO_DESCRIPTOR_SIZE;
        ProtocolError::ensure_len(total, src.len())?;

        let data_end = HEADER_SIZE + data_len;
        let data = Bytes::copy_from_slice(&src[HEADER_SIZE..data_end]);
        let iso_descriptors = decode_iso_descriptors(&src[data_end..total], iso_count)?;

        Ok((
            Self {
                header,
                data,
                iso_descriptors,
            },
            total,
        ))
    }
}
