//! Import and device-list handshakes
//!
//! Each connection starts with exactly one operation exchange. An import
//! turns the connection into a per-request stream for one device; a device
//! list query is answered and then the server closes the connection.

use protocol::{
    BusId, ImportRequest, OP_REP_DEVLIST, OP_REP_IMPORT, OpCommon, OpStatus, USBIP_VERSION,
    UsbDevice, UsbInterface, encode_devlist_request, read_interfaces_async, read_op_common_async,
    read_u32_async, read_usb_device_async, write_frame_async,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::HandshakeError;

/// Devices listed before trusting the remote count for allocation
const DEVLIST_PREALLOC_LIMIT: usize = 64;

/// One entry of a device list reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDevice {
    pub device: UsbDevice,
    pub interfaces: Vec<UsbInterface>,
}

/// Import `busid` over a freshly connected stream
///
/// On success the stream is positioned at the first per-request header.
pub async fn import<S>(
    stream: &mut S,
    busid: &BusId,
    cancel: &CancellationToken,
) -> Result<UsbDevice, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HandshakeError::Cancelled),
        result = import_device(stream, busid) => result,
    }
}

async fn import_device<S>(stream: &mut S, busid: &BusId) -> Result<UsbDevice, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Sending import request for {}", busid);
    let request = ImportRequest {
        busid: busid.clone(),
    };
    write_frame_async(stream, &request.encode()).await?;

    let reply = read_op_common_async(stream).await?;
    check_reply(&reply, OP_REP_IMPORT)?;

    let (device, raw_busid) = read_usb_device_async(stream).await?;
    if !busid.matches_wire(&raw_busid) {
        return Err(HandshakeError::IdentityMismatch {
            requested: busid.to_string(),
            returned: device.busid,
        });
    }

    info!(
        "Imported {} ({:04x}:{:04x}, {})",
        busid, device.vendor_id, device.product_id, device.speed
    );
    Ok(device)
}

/// Query the devices a remote host exports
pub async fn list_devices<S>(
    stream: &mut S,
    cancel: &CancellationToken,
) -> Result<Vec<ExportedDevice>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HandshakeError::Cancelled),
        result = query_devices(stream) => result,
    }
}

async fn query_devices<S>(stream: &mut S) -> Result<Vec<ExportedDevice>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame_async(stream, &encode_devlist_request()).await?;

    let reply = read_op_common_async(stream).await?;
    check_reply(&reply, OP_REP_DEVLIST)?;

    let count = read_u32_async(stream).await? as usize;
    debug!("Remote host exports {} device(s)", count);

    let mut devices = Vec::with_capacity(count.min(DEVLIST_PREALLOC_LIMIT));
    for _ in 0..count {
        let (device, _) = read_usb_device_async(stream).await?;
        let interfaces = read_interfaces_async(stream, device.num_interfaces as usize).await?;
        devices.push(ExportedDevice { device, interfaces });
    }
    Ok(devices)
}

/// Validate a reply header: version, then code, then status
fn check_reply(reply: &OpCommon, expected: u16) -> Result<(), HandshakeError> {
    if !USBIP_VERSION.is_compatible_with(&reply.version) {
        return Err(HandshakeError::VersionMismatch(reply.version));
    }
    if reply.code != expected {
        return Err(HandshakeError::UnexpectedReply {
            expected,
            code: reply.code,
        });
    }
    if reply.status != OpStatus::Ok {
        return Err(HandshakeError::RemoteRejected(reply.status));
    }
    Ok(())
}
