//! Device session lifecycle
//!
//! One session per imported device. It owns the TCP connection and the
//! request table for that device and walks a fixed set of states:
//!
//! ```text
//! Idle -> Connecting -> Importing -> Active -> Detaching -> Detached
//!              |            |
//!              +------------+--------------------------> Detached
//! ```
//!
//! Once Active, three tasks run per session: a receive loop feeding the
//! request table, a send loop draining queued frames into the socket, and a
//! supervisor that notices the end of either (or a detach request) and
//! tears the session down.

use bytes::Bytes;
use protocol::{
    ProtocolError, UsbDevice, UsbIpPacket, read_data_async, read_header_async,
    read_iso_descriptors_async, write_frame_async,
};
use std::fmt;
use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DeviceHost;
use super::port_table::PortTable;
use crate::error::{AttachError, DetachError, RequestError, TransportError};
use crate::network::correlation::is_reply;
use crate::network::{
    CancelOutcome, CompletionHandle, ConnectOptions, DeviceLocation, RequestTable, SubmitRequest,
    connect, import, resolve,
};

/// How long a detaching session waits for queued frames to go out
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    Importing,
    Active,
    Detaching,
    /// Terminal; a detached session is never reused
    Detached,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Importing)
                | (Connecting, Detached)
                | (Importing, Active)
                | (Importing, Detached)
                | (Active, Detaching)
                | (Detaching, Detached)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Detached
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Importing => "importing",
            SessionState::Active => "active",
            SessionState::Detaching => "detaching",
            SessionState::Detached => "detached",
        };
        f.write_str(name)
    }
}

/// Why an active session stopped
enum SessionEnd {
    Requested,
    Receive(Result<(), ProtocolError>),
    Send(Result<(), ProtocolError>),
    Panicked(&'static str),
}

/// One imported device bound to a virtual port
pub struct DeviceSession {
    port: u16,
    location: DeviceLocation,
    device: OnceLock<UsbDevice>,
    table: OnceLock<Arc<RequestTable>>,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl DeviceSession {
    fn new(port: u16, location: DeviceLocation, cancel: CancellationToken) -> Self {
        Self {
            port,
            location,
            device: OnceLock::new(),
            table: OnceLock::new(),
            state: watch::Sender::new(SessionState::Idle),
            cancel,
        }
    }

    /// Claim a port, connect, import and plug in
    ///
    /// No network I/O happens when no port is free. Any failure releases
    /// the port and closes the connection before returning. `cancel` aborts
    /// the attempt only; `lifetime` ends the session whenever it fires.
    pub(super) async fn establish(
        ports: &Arc<PortTable<DeviceSession>>,
        host: &Arc<dyn DeviceHost>,
        location: DeviceLocation,
        options: &ConnectOptions,
        lifetime: CancellationToken,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>, AttachError> {
        let guard = ports.claim().ok_or(AttachError::PortsExhausted)?;
        let port = guard.port();
        let session = Arc::new(Self::new(port, location, lifetime));
        ports.bind(port, &session);

        session.transition(SessionState::Connecting);
        info!("Importing {} on port {}", session.location, port);

        let established = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AttachError::Cancelled),
            result = session.connect_and_import(options) => result,
        };
        let (stream, device) = match established {
            Ok(established) => established,
            Err(e) => {
                session.transition(SessionState::Detached);
                warn!("Import of {} failed: {}", session.location, e);
                return Err(e);
            }
        };

        if let Err(e) = host.plug_in(port, &device) {
            session.transition(SessionState::Detached);
            warn!("Plug-in of {} on port {} rejected: {:#}", session.location, port, e);
            return Err(AttachError::PlugInRejected(format!("{:#}", e)));
        }
        if session.cancel.is_cancelled() || cancel.is_cancelled() {
            host.plug_out(port);
            session.transition(SessionState::Detached);
            return Err(AttachError::Cancelled);
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let table = Arc::new(RequestTable::new(device.devid(), outbound_tx));
        let _ = session.table.set(Arc::clone(&table));
        let _ = session.device.set(device);

        session.transition(SessionState::Active);
        info!("{} active on port {}", session.location, port);

        let (read_half, write_half) = stream.into_split();
        let reader = tokio::spawn(receive_loop(read_half, Arc::clone(&table)));
        let writer = tokio::spawn(send_loop(write_half, outbound_rx));
        tokio::spawn(Arc::clone(&session).supervise(
            table,
            reader,
            writer,
            Arc::clone(host),
            Arc::clone(ports),
            guard.keep(),
        ));

        Ok(session)
    }

    async fn connect_and_import(
        &self,
        options: &ConnectOptions,
    ) -> Result<(TcpStream, UsbDevice), AttachError> {
        let candidates = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransportError::Cancelled.into()),
            result = resolve(&self.location.host, &self.location.service) => result?,
        };
        let mut stream = connect(candidates, options, &self.cancel).await?;

        self.transition(SessionState::Importing);
        let device = import(&mut stream, &self.location.busid, &self.cancel).await?;
        Ok((stream, device))
    }

    async fn supervise(
        self: Arc<Self>,
        table: Arc<RequestTable>,
        mut reader: JoinHandle<Result<(), ProtocolError>>,
        mut writer: JoinHandle<Result<(), ProtocolError>>,
        host: Arc<dyn DeviceHost>,
        ports: Arc<PortTable<DeviceSession>>,
        port: u16,
    ) {
        let mut reader_done = false;
        let mut writer_done = false;

        let end = tokio::select! {
            _ = self.cancel.cancelled() => SessionEnd::Requested,
            result = &mut reader => {
                reader_done = true;
                result.map_or(SessionEnd::Panicked("receive"), SessionEnd::Receive)
            }
            result = &mut writer => {
                writer_done = true;
                result.map_or(SessionEnd::Panicked("send"), SessionEnd::Send)
            }
        };
        self.log_end(&end);

        self.transition(SessionState::Detaching);
        let failed = table.fail_all();
        if failed > 0 {
            info!("Failed {} outstanding request(s) on port {}", failed, port);
        }

        if !reader_done {
            reader.abort();
        }
        if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            debug!("Send loop on port {} did not drain in time", port);
            writer.abort();
        }

        host.plug_out(port);
        ports.release(port);
        self.cancel.cancel();
        self.transition(SessionState::Detached);
        info!("{} detached from port {}", self.location, port);
    }

    fn log_end(&self, end: &SessionEnd) {
        match end {
            SessionEnd::Requested => debug!("Detach requested for port {}", self.port),
            SessionEnd::Receive(Err(ProtocolError::Io(e)))
                if e.kind() == io::ErrorKind::UnexpectedEof =>
            {
                info!("{} closed the connection", self.location.host)
            }
            SessionEnd::Receive(Err(e)) => {
                error!("Receive on port {} failed: {}", self.port, e)
            }
            SessionEnd::Send(Err(e)) => error!("Send on port {} failed: {}", self.port, e),
            SessionEnd::Receive(Ok(())) | SessionEnd::Send(Ok(())) => {
                debug!("Forwarding on port {} stopped", self.port)
            }
            SessionEnd::Panicked(side) => {
                error!("{} task on port {} panicked", side, self.port)
            }
        }
    }

    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                debug!("Port {}: {} -> {}", self.port, state, next);
                *state = next;
                true
            } else {
                false
            }
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn location(&self) -> &DeviceLocation {
        &self.location
    }

    /// Descriptor returned by the import; set once the session is active
    pub fn device(&self) -> Option<&UsbDevice> {
        self.device.get()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn active_table(&self) -> Result<&Arc<RequestTable>, RequestError> {
        if self.state() != SessionState::Active {
            return Err(RequestError::NotActive);
        }
        self.table.get().ok_or(RequestError::NotActive)
    }

    /// Forward a transfer to the remote device
    pub fn submit(&self, request: &SubmitRequest) -> Result<CompletionHandle, RequestError> {
        self.active_table()?.submit(request)
    }

    /// Unlink an outstanding transfer
    pub fn cancel(&self, seqnum: u32) -> Result<CancelOutcome, RequestError> {
        self.active_table()?.cancel(seqnum)
    }

    /// Transfers awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.table.get().map_or(0, |t| t.len())
    }

    /// Start tearing the session down without waiting
    pub fn request_detach(&self) {
        self.cancel.cancel();
    }

    /// Wait until the session reaches `Detached`
    ///
    /// Cancelling `cancel` stops the wait only; teardown carries on.
    pub async fn wait_detached(&self, cancel: &CancellationToken) -> Result<(), DetachError> {
        let mut state = self.subscribe_state();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DetachError::Cancelled),
            _ = state.wait_for(|s| s.is_terminal()) => Ok(()),
        }
    }

    /// Request teardown and wait for it to finish
    pub async fn detach(&self, cancel: &CancellationToken) -> Result<(), DetachError> {
        self.request_detach();
        self.wait_detached(cancel).await
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("port", &self.port)
            .field("location", &self.location)
            .field("state", &self.state())
            .finish()
    }
}

/// Decode replies and hand them to the request table until the stream ends
async fn receive_loop(
    mut reader: OwnedReadHalf,
    table: Arc<RequestTable>,
) -> Result<(), ProtocolError> {
    loop {
        let header = read_header_async(&mut reader).await?;
        if !is_reply(header.command()) {
            return Err(ProtocolError::malformed(
                "command",
                header.command().to_wire(),
            ));
        }

        let data_len = table.reply_data_len(&header)?;
        let data = read_data_async(&mut reader, data_len).await?;
        let iso_descriptors =
            read_iso_descriptors_async(&mut reader, header.iso_packet_count()).await?;

        table.on_reply(UsbIpPacket {
            header,
            data,
            iso_descriptors,
        });
    }
}

/// Write queued frames in order until the table closes its sender
async fn send_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), ProtocolError> {
    while let Some(frame) = outbound.recv().await {
        write_frame_async(&mut writer, &frame).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use SessionState::*;

        let path = [Idle, Connecting, Importing, Active, Detaching, Detached];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }

        assert!(Connecting.can_transition_to(Detached));
        assert!(Importing.can_transition_to(Detached));

        assert!(!Active.can_transition_to(Detached));
        assert!(!Detached.can_transition_to(Idle));
        assert!(!Detached.can_transition_to(Connecting));
        assert!(!Idle.can_transition_to(Active));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_invalid_transition_is_ignored() {
        let session = DeviceSession::new(
            1,
            DeviceLocation::new("127.0.0.1", "3240", protocol::BusId::new("1-1").unwrap()),
            CancellationToken::new(),
        );
        assert!(!session.transition(SessionState::Active));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.transition(SessionState::Connecting));
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[test]
    fn test_submit_requires_active() {
        let session = DeviceSession::new(
            1,
            DeviceLocation::new("127.0.0.1", "3240", protocol::BusId::new("1-1").unwrap()),
            CancellationToken::new(),
        );
        assert_eq!(
            session
                .submit(&SubmitRequest::transfer_in(1, 8))
                .unwrap_err(),
            RequestError::NotActive
        );
        assert_eq!(session.cancel(1), Err(RequestError::NotActive));
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_wait_detached_cancelled() {
        let session = DeviceSession::new(
            1,
            DeviceLocation::new("127.0.0.1", "3240", protocol::BusId::new("1-1").unwrap()),
            CancellationToken::new(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(session.wait_detached(&cancel).await.unwrap_err().is_cancelled());
    }
}
