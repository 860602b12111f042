//! Test utilities for usbip-client
//!
//! Provides mock device descriptors, a loopback USB/IP server with scripted
//! replies, and helper functions for async tests across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_usb_device;
//!
//! let device = create_mock_usb_device("1-1", 0x1234, 0x5678);
//! assert_eq!(device.vendor_id, 0x1234);
//! assert_eq!(device.busid, "1-1");
//! ```

use bytes::Bytes;
use protocol::{
    BUS_ID_SIZE, DeviceSpeed, Direction, HeaderBasic, HeaderBody, NON_ISOCH, OP_REP_DEVLIST,
    OP_REP_IMPORT, OP_REQ_DEVLIST, OP_REQ_IMPORT, OpCommon, OpStatus, RetSubmit, USBIP_VERSION,
    UsbDevice, UsbInterface, UsbIpHeader, UsbIpPacket,
};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::{Error, Result};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock exported device descriptor
///
/// # Arguments
/// * `busid` - Bus-id on the (mock) remote host
/// * `vendor_id` - USB Vendor ID
/// * `product_id` - USB Product ID
pub fn create_mock_usb_device(busid: &str, vendor_id: u16, product_id: u16) -> UsbDevice {
    UsbDevice {
        path: format!("/sys/devices/pci0000:00/0000:00:14.0/usb1/{}", busid),
        busid: busid.to_string(),
        busnum: 1,
        devnum: 2,
        speed: DeviceSpeed::High,
        vendor_id,
        product_id,
        bcd_device: 0x0100,
        class: 0x00,
        subclass: 0x00,
        protocol: 0x00,
        configuration_value: 1,
        num_configurations: 1,
        num_interfaces: 1,
    }
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> std::result::Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// How the mock server answers an import request
#[derive(Debug, Clone)]
pub enum MockImportReply {
    /// Reply OK with this descriptor (its busid need not match the request)
    Device(UsbDevice),
    /// Reply with a failure status and no descriptor
    Reject(OpStatus),
}

/// Loopback USB/IP server driven step by step by a test
///
/// Each `accept_*` call serves exactly one connection. After an import the
/// raw stream is handed back so the test can script per-request replies
/// with [`read_command`], [`write_ret_submit`] and [`write_ret_unlink`].
pub struct MockUsbIpServer {
    listener: TcpListener,
}

impl MockUsbIpServer {
    /// Bind to an ephemeral port on 127.0.0.1
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Port number as a service string
    pub fn service(&self) -> Result<String> {
        Ok(self.local_addr()?.port().to_string())
    }

    /// Accept one connection and answer its import request
    ///
    /// Returns the stream and the bus-id the client asked for.
    pub async fn accept_import(&self, reply: &MockImportReply) -> Result<(TcpStream, String)> {
        let (mut stream, _) = self.listener.accept().await?;

        read_request(&mut stream, OP_REQ_IMPORT).await?;
        let mut busid = [0u8; BUS_ID_SIZE];
        stream.read_exact(&mut busid).await?;
        let end = busid.iter().position(|&b| b == 0).unwrap_or(BUS_ID_SIZE);
        let requested = String::from_utf8_lossy(&busid[..end]).into_owned();

        let mut out = Vec::with_capacity(OpCommon::SIZE + UsbDevice::WIRE_SIZE);
        match reply {
            MockImportReply::Device(device) => {
                reply_header(OP_REP_IMPORT, OpStatus::Ok).write_to(&mut out)?;
                device.write_to(&mut out)?;
            }
            MockImportReply::Reject(status) => {
                reply_header(OP_REP_IMPORT, *status).write_to(&mut out)?;
            }
        }
        stream.write_all(&out).await?;
        stream.flush().await?;

        Ok((stream, requested))
    }

    /// Accept one connection, answer its device-list request and close it
    pub async fn accept_devlist(&self, devices: &[(UsbDevice, Vec<UsbInterface>)]) -> Result<()> {
        let (mut stream, _) = self.listener.accept().await?;
        read_request(&mut stream, OP_REQ_DEVLIST).await?;

        let mut out = Vec::new();
        reply_header(OP_REP_DEVLIST, OpStatus::Ok).write_to(&mut out)?;
        out.extend_from_slice(&(devices.len() as u32).to_be_bytes());
        for (device, interfaces) in devices {
            device.write_to(&mut out)?;
            for intf in interfaces {
                intf.write_to(&mut out)?;
            }
        }
        stream.write_all(&out).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Accept one connection and close it without answering
    pub async fn accept_and_drop(&self) -> Result<()> {
        let (stream, _) = self.listener.accept().await?;
        drop(stream);
        Ok(())
    }
}

fn reply_header(code: u16, status: OpStatus) -> OpCommon {
    OpCommon {
        version: USBIP_VERSION,
        code,
        status,
    }
}

async fn read_request(stream: &mut TcpStream, expected: u16) -> Result<OpCommon> {
    let op = protocol::read_op_common_async(stream).await?;
    if op.code != expected {
        return Err(Error::UnexpectedOp {
            expected,
            code: op.code,
        });
    }
    Ok(op)
}

/// Read one command (CMD_SUBMIT or CMD_UNLINK) sent by the client
///
/// OUT data and isochronous descriptors are read along with the header.
pub async fn read_command(stream: &mut TcpStream) -> Result<UsbIpPacket> {
    let header = protocol::read_header_async(stream).await?;
    let data = protocol::read_data_async(stream, header.outbound_data_len()).await?;
    let iso_descriptors =
        protocol::read_iso_descriptors_async(stream, header.iso_packet_count()).await?;
    Ok(UsbIpPacket {
        header,
        data,
        iso_descriptors,
    })
}

/// Send a RET_SUBMIT for `seqnum` with `data` as IN payload
///
/// The reply header's direction is always `Out`, as Linux servers send it.
pub async fn write_ret_submit(
    stream: &mut TcpStream,
    seqnum: u32,
    status: i32,
    actual_length: i32,
    data: &[u8],
) -> Result<()> {
    let packet = UsbIpPacket {
        header: UsbIpHeader {
            basic: HeaderBasic {
                seqnum,
                devid: 0,
                direction: Direction::Out,
                ep: 0,
            },
            body: HeaderBody::RetSubmit(RetSubmit {
                status,
                actual_length,
                start_frame: 0,
                number_of_packets: NON_ISOCH,
                error_count: 0,
            }),
        },
        data: Bytes::copy_from_slice(data),
        iso_descriptors: Vec::new(),
    };
    stream.write_all(&packet.encode()).await?;
    stream.flush().await?;
    Ok(())
}

/// Send a RET_UNLINK answering the CMD_UNLINK numbered `seqnum`
pub async fn write_ret_unlink(stream: &mut TcpStream, seqnum: u32, status: i32) -> Result<()> {
    let header = UsbIpHeader {
        basic: HeaderBasic {
            seqnum,
            devid: 0,
            direction: Direction::Out,
            ep: 0,
        },
        body: HeaderBody::RetUnlink { status },
    };
    stream.write_all(&header.to_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mock_usb_device() {
        let device = create_mock_usb_device("1-1", 0x1234, 0x5678);

        assert_eq!(device.busid, "1-1");
        assert_eq!(device.vendor_id, 0x1234);
        assert_eq!(device.product_id, 0x5678);
        assert_eq!(device.devid(), 0x0001_0002);
    }

    #[test]
    fn test_create_mock_bulk_data() {
        let data = create_mock_bulk_data(1024);

        assert_eq!(data.len(), 1024);
        assert_eq!(data[0], 0);
        assert_eq!(data[255], 255);
        assert_eq!(data[256], 0); // Wraps around
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_server_import_reply() {
        let server = MockUsbIpServer::bind().await.unwrap();
        let addr = server.local_addr().unwrap();
        let device = create_mock_usb_device("1-1", 0x1234, 0x5678);

        let serve = tokio::spawn({
            let device = device.clone();
            async move {
                server
                    .accept_import(&MockImportReply::Device(device))
                    .await
                    .map(|(_, busid)| busid)
            }
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let req = protocol::ImportRequest {
            busid: protocol::BusId::new("1-1").unwrap(),
        };
        client.write_all(&req.encode()).await.unwrap();

        let op = protocol::read_op_common_async(&mut client).await.unwrap();
        assert_eq!(op.code, OP_REP_IMPORT);
        assert_eq!(op.status, OpStatus::Ok);
        let (decoded, _) = protocol::read_usb_device_async(&mut client).await.unwrap();
        assert_eq!(decoded, device);

        assert_eq!(serve.await.unwrap().unwrap(), "1-1");
    }

    #[tokio::test]
    async fn test_mock_server_rejects_unscripted_op() {
        let server = MockUsbIpServer::bind().await.unwrap();
        let addr = server.local_addr().unwrap();
        let serve = tokio::spawn(async move {
            server
                .accept_import(&MockImportReply::Reject(OpStatus::Error))
                .await
                .map(|(_, busid)| busid)
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut out = Vec::new();
        OpCommon::request(OP_REQ_DEVLIST)
            .write_to(&mut out)
            .unwrap();
        client.write_all(&out).await.unwrap();

        let err = serve.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedOp {
                expected: OP_REQ_IMPORT,
                code: OP_REQ_DEVLIST
            }
        ));
    }
}
