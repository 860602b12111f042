//! Stream framing helpers
//!
//! The USB/IP wire format has no length prefix: the size of everything after
//! a header is implied by the header and, for IN completions, by the request
//! it answers. These helpers read exactly one structure at a time from a
//! byte stream so the caller can decide what follows.
//!
//! # Frame Format
//!
//! ```text
//! handshake:  [OpCommon: 8][body: op-specific]
//! requests:   [UsbIpHeader: 48][data: 0..N][iso descriptors: 16 * packets]
//! ```
//!
//! Synchronous variants work on [`std::io::Read`]; async variants are enabled
//! by the `async` feature and work on tokio streams.

use bytes::Bytes;
use std::io::Read;

use crate::error::Result;
use crate::header::{HEADER_SIZE, ISO_DESCRIPTOR_SIZE, IsoPacketDescriptor, UsbIpHeader};
use crate::messages::OpCommon;
use crate::types::{BUS_ID_SIZE, UsbDevice, UsbInterface};

#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Raw bus-id field as received, before any NUL trimming
pub type RawBusId = [u8; BUS_ID_SIZE];

/// Read one per-request header from a reader
pub fn read_header<R: Read>(reader: &mut R) -> Result<UsbIpHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut buf)?;
    UsbIpHeader::decode(&buf)
}

/// Read one handshake common header from a reader
pub fn read_op_common<R: Read>(reader: &mut R) -> Result<OpCommon> {
    let mut buf = [0u8; OpCommon::SIZE];
    reader.read_exact(&mut buf)?;
    OpCommon::decode(&buf)
}

/// Async: Read one handshake common header
#[cfg(feature = "async")]
pub async fn read_op_common_async<R>(reader: &mut R) -> Result<OpCommon>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; OpCommon::SIZE];
    reader.read_exact(&mut buf).await?;
    OpCommon::decode(&buf)
}

/// Async: Read one device descriptor
///
/// Also returns the bus-id field exactly as it appeared on the wire, so the
/// caller can compare it byte-for-byte with what it asked for.
#[cfg(feature = "async")]
pub async fn read_usb_device_async<R>(reader: &mut R) -> Result<(UsbDevice, RawBusId)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; UsbDevice::WIRE_SIZE];
    reader.read_exact(&mut buf).await?;

    let mut raw_busid = [0u8; BUS_ID_SIZE];
    raw_busid.copy_from_slice(&buf[UsbDevice::BUSID_RANGE]);
    Ok((UsbDevice::decode(&buf)?, raw_busid))
}

/// Async: Read `count` interface records following a device-list entry
#[cfg(feature = "async")]
pub async fn read_interfaces_async<R>(reader: &mut R, count: usize) -> Result<Vec<UsbInterface>>
where
    R: AsyncRead + Unpin,
{
    let mut interfaces = Vec::with_capacity(count);
    let mut buf = [0u8; UsbInterface::WIRE_SIZE];
    for _ in 0..count {
        reader.read_exact(&mut buf).await?;
        interfaces.push(UsbInterface::decode(&buf)?);
    }
    Ok(interfaces)
}

/// Async: Read a big-endian u32 (the device count of a device-list reply)
#[cfg(feature = "async")]
pub async fn read_u32_async<R>(reader: &mut R) -> Result<u32>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_u32().await?)
}

/// Async: Read one per-request header
#[cfg(feature = "async")]
pub async fn read_header_async<R>(reader: &mut R) -> Result<UsbIpHeader>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut buf).await?;
    UsbIpHeader::decode(&buf)
}

/// Async: Read exactly `len` bytes of transfer data
#[cfg(feature = "async")]
pub async fn read_data_async<R>(reader: &mut R, len: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    if len == 0 {
        return Ok(Bytes::new());
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Bytes::from(data))
}

/// Async: Read `count` isochronous descriptors
#[cfg(feature = "async")]
pub async fn read_iso_descriptors_async<R>(
    reader: &mut R,
    count: usize,
) -> Result<Vec<IsoPacketDescriptor>>
where
    R: AsyncRead + Unpin,
{
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; count * ISO_DESCRIPTOR_SIZE];
    reader.read_exact(&mut buf).await?;
    crate::header::decode_iso_descriptors(&buf, count)
}

/// Async: Write a pre-encoded frame and flush it
#[cfg(feature = "async")]
pub async fn write_frame_async<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
