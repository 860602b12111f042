//! Request correlation
//!
//! Every submission on a session connection gets a sequence number, and the
//! remote host answers each one with a RET_SUBMIT carrying the same number.
//! Replies come back in any order. [`RequestTable`] matches them to the
//! waiting callers and runs the unlink (cancel) protocol.
//!
//! # Unlink races
//!
//! Cancelling sends a CMD_UNLINK under a fresh sequence number. The remote
//! host then answers with a RET_UNLINK numbered after the CMD_UNLINK, and may
//! also still send the RET_SUBMIT if the transfer finished in the meantime.
//! Whichever of the two arrives first resolves the caller; the other is
//! dropped quietly.
//!
//! ```text
//!   submit(7) ──► CMD_SUBMIT #7
//!   cancel(7) ──► CMD_UNLINK #8 (target 7)        pending[7] = UnlinkPending(8)
//!                 ◄── RET_SUBMIT #7               caller gets the completion
//!                 ◄── RET_UNLINK #8               discarded
//! ```

use bytes::Bytes;
use protocol::{
    CmdSubmit, Command, Direction, HeaderBasic, HeaderBody, IsoPacketDescriptor,
    MAX_ISO_PACKETS, NON_ISOCH, ProtocolError, RetSubmit, UsbIpHeader, UsbIpPacket,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::RequestError;

/// Number of settled unlink races remembered on each side
///
/// A late reply for one of these is dropped quietly, and the number is not
/// handed out again while remembered.
const UNLINKED_HISTORY: usize = 64;

/// A USB transfer to forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub direction: Direction,
    /// Endpoint number without the direction bit
    pub ep: u32,
    pub transfer_flags: u32,
    /// OUT: length of `data`. IN: size of the buffer to fill.
    pub transfer_buffer_length: u32,
    pub start_frame: i32,
    pub interval: i32,
    pub setup: [u8; 8],
    /// OUT payload; ignored for IN transfers
    pub data: Bytes,
    /// Isochronous packet layout; empty for other transfer types
    pub iso_descriptors: Vec<IsoPacketDescriptor>,
}

impl SubmitRequest {
    /// IN transfer of up to `length` bytes
    pub fn transfer_in(ep: u32, length: u32) -> Self {
        Self {
            direction: Direction::In,
            ep,
            transfer_flags: 0,
            transfer_buffer_length: length,
            start_frame: 0,
            interval: 0,
            setup: [0; 8],
            data: Bytes::new(),
            iso_descriptors: Vec::new(),
        }
    }

    /// OUT transfer of `data`
    pub fn transfer_out(ep: u32, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            direction: Direction::Out,
            ep,
            transfer_flags: 0,
            transfer_buffer_length: data.len() as u32,
            start_frame: 0,
            interval: 0,
            setup: [0; 8],
            data,
            iso_descriptors: Vec::new(),
        }
    }

    /// Control transfer on endpoint 0
    ///
    /// For OUT, `length` must equal `data.len()`.
    pub fn control(setup: [u8; 8], direction: Direction, length: u32, data: Bytes) -> Self {
        Self {
            direction,
            ep: 0,
            transfer_flags: 0,
            transfer_buffer_length: length,
            start_frame: 0,
            interval: 0,
            setup,
            data,
            iso_descriptors: Vec::new(),
        }
    }

    /// Refuse requests whose header would disagree with the bytes sent
    fn validate(&self) -> Result<(), RequestError> {
        if self.transfer_buffer_length > i32::MAX as u32 {
            return Err(RequestError::InvalidRequest(
                "transfer_buffer_length exceeds i32::MAX",
            ));
        }
        if self.direction == Direction::Out
            && self.data.len() != self.transfer_buffer_length as usize
        {
            return Err(RequestError::InvalidRequest(
                "OUT data length differs from transfer_buffer_length",
            ));
        }
        if self.iso_descriptors.len() > MAX_ISO_PACKETS as usize {
            return Err(RequestError::InvalidRequest(
                "too many isochronous packets",
            ));
        }
        Ok(())
    }

    fn to_packet(&self, seqnum: u32, devid: u32) -> UsbIpPacket {
        let number_of_packets = if self.iso_descriptors.is_empty() {
            NON_ISOCH
        } else {
            self.iso_descriptors.len() as i32
        };
        let data = match self.direction {
            Direction::Out => self.data.clone(),
            Direction::In => Bytes::new(),
        };

        UsbIpPacket {
            header: UsbIpHeader {
                basic: HeaderBasic {
                    seqnum,
                    devid,
                    direction: self.direction,
                    ep: self.ep,
                },
                body: HeaderBody::CmdSubmit(CmdSubmit {
                    transfer_flags: self.transfer_flags,
                    transfer_buffer_length: self.transfer_buffer_length as i32,
                    start_frame: self.start_frame,
                    number_of_packets,
                    interval: self.interval,
                    setup: self.setup,
                }),
            },
            data,
            iso_descriptors: self.iso_descriptors.clone(),
        }
    }
}

/// Completion of a forwarded transfer (the RET_SUBMIT contents)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrbCompletion {
    /// 0 on success, negative Linux errno otherwise
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: i32,
    pub error_count: i32,
    /// IN payload
    pub data: Bytes,
    pub iso_descriptors: Vec<IsoPacketDescriptor>,
}

impl UrbCompletion {
    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    fn from_reply(ret: &RetSubmit, data: Bytes, iso_descriptors: Vec<IsoPacketDescriptor>) -> Self {
        Self {
            status: ret.status,
            actual_length: ret.actual_length.max(0) as u32,
            start_frame: ret.start_frame,
            error_count: ret.error_count,
            data,
            iso_descriptors,
        }
    }
}

type CompletionResult = Result<UrbCompletion, RequestError>;

/// Resolves once the remote host answers a submission
///
/// Dropping it does not cancel the transfer; use [`RequestTable::cancel`].
#[derive(Debug)]
pub struct CompletionHandle {
    seqnum: u32,
    rx: oneshot::Receiver<CompletionResult>,
}

impl CompletionHandle {
    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }
}

impl Future for CompletionHandle {
    type Output = CompletionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(RequestError::ConnectionClosed)))
    }
}

/// State of a tracked submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Sent, waiting for RET_SUBMIT
    Submitted,
    /// CMD_UNLINK sent under `unlink_seqnum`, waiting for either reply
    UnlinkPending { unlink_seqnum: u32 },
}

/// Result of [`RequestTable::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// CMD_UNLINK queued under this sequence number
    UnlinkSent { unlink_seqnum: u32 },
    /// An unlink for this submission is already in flight
    AlreadyUnlinking,
    /// Nothing outstanding under that sequence number
    NotFound,
}

/// What [`RequestTable::on_reply`] did with a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// Caller resolved with the transfer result
    Completed,
    /// Caller resolved as cancelled
    Cancelled,
    /// Second reply of an unlink race, dropped
    Discarded,
    /// Nothing matched; logged and dropped
    Unmatched,
}

struct PendingRequest {
    direction: Direction,
    transfer_buffer_length: usize,
    state: PendingState,
    tx: Option<oneshot::Sender<CompletionResult>>,
}

impl PendingRequest {
    fn resolve(&mut self, result: CompletionResult) {
        if let Some(tx) = self.tx.take() {
            // Receiver may be gone if the caller stopped waiting
            let _ = tx.send(result);
        }
    }
}

/// A submission resolved by RET_UNLINK whose RET_SUBMIT may still come
#[derive(Debug, Clone, Copy)]
struct Unlinked {
    seqnum: u32,
    direction: Direction,
    transfer_buffer_length: usize,
}

struct TableInner {
    next_seqnum: u32,
    pending: HashMap<u32, PendingRequest>,
    /// In-flight unlink sequence number -> target submission
    unlinks: HashMap<u32, u32>,
    /// Submissions resolved by RET_UNLINK
    unlinked: VecDeque<Unlinked>,
    /// Unlinks whose target completed first; their RET_UNLINK is still due
    settled_unlinks: VecDeque<u32>,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
}

impl TableInner {
    fn in_use(&self, seqnum: u32) -> bool {
        self.pending.contains_key(&seqnum)
            || self.unlinks.contains_key(&seqnum)
            || self.unlinked.iter().any(|u| u.seqnum == seqnum)
            || self.settled_unlinks.contains(&seqnum)
    }

    fn find_unlinked(&self, seqnum: u32) -> Option<Unlinked> {
        self.unlinked.iter().find(|u| u.seqnum == seqnum).copied()
    }

    fn allocate_seqnum(&mut self) -> u32 {
        loop {
            let seqnum = self.next_seqnum;
            self.next_seqnum = self.next_seqnum.wrapping_add(1);
            if seqnum != 0 && !self.in_use(seqnum) {
                return seqnum;
            }
        }
    }

    fn remember_unlinked(&mut self, entry: Unlinked) {
        if self.unlinked.len() == UNLINKED_HISTORY {
            self.unlinked.pop_front();
        }
        self.unlinked.push_back(entry);
    }

    fn settle_unlink(&mut self, unlink_seqnum: u32) {
        self.unlinks.remove(&unlink_seqnum);
        if self.settled_unlinks.len() == UNLINKED_HISTORY {
            self.settled_unlinks.pop_front();
        }
        self.settled_unlinks.push_back(unlink_seqnum);
    }

    fn send(&self, frame: Bytes) -> Result<(), RequestError> {
        self.outbound
            .as_ref()
            .ok_or(RequestError::ConnectionClosed)?
            .send(frame)
            .map_err(|_| RequestError::ConnectionClosed)
    }
}

/// In-flight submissions of one session connection
///
/// Submitting callers and the connection's receive loop are the only users.
/// Sequence number allocation and queuing the encoded frame happen under one
/// lock, so frames leave in submission order.
pub struct RequestTable {
    devid: u32,
    inner: Mutex<TableInner>,
}

impl RequestTable {
    /// Table for device `devid`, queuing encoded frames on `outbound`
    pub fn new(devid: u32, outbound: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            devid,
            inner: Mutex::new(TableInner {
                next_seqnum: 1,
                pending: HashMap::new(),
                unlinks: HashMap::new(),
                unlinked: VecDeque::with_capacity(UNLINKED_HISTORY),
                settled_unlinks: VecDeque::with_capacity(UNLINKED_HISTORY),
                outbound: Some(outbound),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn devid(&self) -> u32 {
        self.devid
    }

    /// Record and queue a CMD_SUBMIT
    ///
    /// Returns immediately; the handle resolves when a reply arrives or the
    /// connection closes. A request that cannot be framed consistently is
    /// refused with `InvalidRequest` before a sequence number is used.
    pub fn submit(&self, request: &SubmitRequest) -> Result<CompletionHandle, RequestError> {
        request.validate()?;

        let mut inner = self.lock();
        if inner.outbound.is_none() {
            return Err(RequestError::ConnectionClosed);
        }

        let seqnum = inner.allocate_seqnum();
        let packet = request.to_packet(seqnum, self.devid);
        let transfer_buffer_length = request.transfer_buffer_length as usize;
        inner.send(packet.encode().freeze())?;

        let (tx, rx) = oneshot::channel();
        inner.pending.insert(
            seqnum,
            PendingRequest {
                direction: request.direction,
                transfer_buffer_length,
                state: PendingState::Submitted,
                tx: Some(tx),
            },
        );
        trace!(
            "CMD_SUBMIT #{} ep={} dir={:?} len={}",
            seqnum, request.ep, request.direction, transfer_buffer_length
        );

        Ok(CompletionHandle { seqnum, rx })
    }

    /// Ask the remote host to abort an outstanding submission
    pub fn cancel(&self, seqnum: u32) -> Result<CancelOutcome, RequestError> {
        let mut inner = self.lock();
        if inner.outbound.is_none() {
            return Err(RequestError::ConnectionClosed);
        }

        match inner.pending.get(&seqnum).map(|p| p.state) {
            None => {
                debug!("Cancel for unknown seqnum {} ignored", seqnum);
                return Ok(CancelOutcome::NotFound);
            }
            Some(PendingState::UnlinkPending { .. }) => return Ok(CancelOutcome::AlreadyUnlinking),
            Some(PendingState::Submitted) => {}
        }

        let unlink_seqnum = inner.allocate_seqnum();
        let header = UsbIpHeader {
            basic: HeaderBasic {
                seqnum: unlink_seqnum,
                devid: self.devid,
                direction: Direction::Out,
                ep: 0,
            },
            body: HeaderBody::CmdUnlink {
                unlink_seqnum: seqnum,
            },
        };
        inner.send(Bytes::copy_from_slice(&header.to_bytes()))?;

        inner.unlinks.insert(unlink_seqnum, seqnum);
        if let Some(pending) = inner.pending.get_mut(&seqnum) {
            pending.state = PendingState::UnlinkPending { unlink_seqnum };
        }
        debug!("CMD_UNLINK #{} for #{}", unlink_seqnum, seqnum);

        Ok(CancelOutcome::UnlinkSent { unlink_seqnum })
    }

    /// Length of the IN data following a reply header
    ///
    /// The receive loop calls this before reading the reply body. IN data
    /// only follows a RET_SUBMIT for an IN submission, and never more than
    /// that submission's buffer. The remote host does not echo the
    /// direction, so a RET_SUBMIT nobody is tracking must carry no data or
    /// the stream cannot be realigned.
    pub fn reply_data_len(&self, header: &UsbIpHeader) -> Result<usize, ProtocolError> {
        let HeaderBody::RetSubmit(ret) = header.body else {
            return Ok(0);
        };
        let seqnum = header.basic.seqnum;

        let inner = self.lock();
        let (direction, limit) = match inner.pending.get(&seqnum) {
            Some(pending) => (pending.direction, pending.transfer_buffer_length),
            None => match inner.find_unlinked(seqnum) {
                Some(unlinked) => (unlinked.direction, unlinked.transfer_buffer_length),
                None if ret.actual_length == 0 => return Ok(0),
                None => return Err(ProtocolError::malformed("actual_length", ret.actual_length)),
            },
        };

        let actual = usize::try_from(ret.actual_length)
            .ok()
            .filter(|actual| *actual <= limit)
            .ok_or_else(|| ProtocolError::malformed("actual_length", ret.actual_length))?;
        Ok(if direction == Direction::In { actual } else { 0 })
    }

    /// Match a RET_SUBMIT or RET_UNLINK to its caller
    pub fn on_reply(&self, reply: UsbIpPacket) -> ReplyDisposition {
        let seqnum = reply.header.basic.seqnum;
        let mut inner = self.lock();

        match reply.header.body {
            HeaderBody::RetSubmit(ret) => {
                if let Some(mut pending) = inner.pending.remove(&seqnum) {
                    // The RET_UNLINK of a lost race is still due; remember it
                    if let PendingState::UnlinkPending { unlink_seqnum } = pending.state {
                        inner.settle_unlink(unlink_seqnum);
                    }
                    trace!(
                        "RET_SUBMIT #{} status={} actual={}",
                        seqnum, ret.status, ret.actual_length
                    );
                    pending.resolve(Ok(UrbCompletion::from_reply(
                        &ret,
                        reply.data,
                        reply.iso_descriptors,
                    )));
                    return ReplyDisposition::Completed;
                }
                if inner.find_unlinked(seqnum).is_some() {
                    debug!("RET_SUBMIT #{} after its unlink completed, dropped", seqnum);
                    return ReplyDisposition::Discarded;
                }
                warn!("Unmatched RET_SUBMIT #{} dropped", seqnum);
                ReplyDisposition::Unmatched
            }
            HeaderBody::RetUnlink { status } => {
                let Some(target) = inner.unlinks.remove(&seqnum) else {
                    if let Some(i) = inner.settled_unlinks.iter().position(|s| *s == seqnum) {
                        inner.settled_unlinks.remove(i);
                        debug!("RET_UNLINK #{} after its target completed, dropped", seqnum);
                        return ReplyDisposition::Discarded;
                    }
                    warn!("Unmatched RET_UNLINK #{} dropped", seqnum);
                    return ReplyDisposition::Unmatched;
                };
                let Some(mut pending) = inner.pending.remove(&target) else {
                    debug!(
                        "RET_UNLINK #{} for already completed #{}, dropped",
                        seqnum, target
                    );
                    return ReplyDisposition::Discarded;
                };
                debug!("RET_UNLINK #{} resolved #{} (status {})", seqnum, target, status);
                inner.remember_unlinked(Unlinked {
                    seqnum: target,
                    direction: pending.direction,
                    transfer_buffer_length: pending.transfer_buffer_length,
                });
                pending.resolve(Err(RequestError::Cancelled { status }));
                ReplyDisposition::Cancelled
            }
            HeaderBody::CmdSubmit(_) | HeaderBody::CmdUnlink { .. } => {
                warn!(
                    "Unexpected {:?} #{} on client side, dropped",
                    reply.header.command(),
                    seqnum
                );
                ReplyDisposition::Unmatched
            }
        }
    }

    /// Resolve everything outstanding with `ConnectionClosed` and close
    ///
    /// Later submissions fail immediately. Dropping the outbound sender lets
    /// the writer drain what is already queued and stop. Returns how many
    /// callers were resolved.
    pub fn fail_all(&self) -> usize {
        let mut inner = self.lock();
        inner.outbound = None;
        inner.unlinks.clear();
        inner.unlinked.clear();
        inner.settled_unlinks.clear();

        let failed = inner.pending.len();
        for (_, mut pending) in inner.pending.drain() {
            pending.resolve(Err(RequestError::ConnectionClosed));
        }
        if failed > 0 {
            debug!("Failed {} outstanding request(s) on devid {:#x}", failed, self.devid);
        }
        failed
    }

    /// Number of submissions awaiting a reply
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().outbound.is_none()
    }

    pub fn state_of(&self, seqnum: u32) -> Option<PendingState> {
        self.lock().pending.get(&seqnum).map(|p| p.state)
    }
}

/// True when `command` is something the remote host may send
pub fn is_reply(command: Command) -> bool {
    matches!(command, Command::RetSubmit | Command::RetUnlink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::HEADER_SIZE;

    fn table() -> (RequestTable, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RequestTable::new(0x0001_0002, tx), rx)
    }

    fn ret_submit(seqnum: u32, status: i32, data: &[u8]) -> UsbIpPacket {
        UsbIpPacket {
            header: UsbIpHeader {
                basic: HeaderBasic {
                    seqnum,
                    devid: 0,
                    direction: Direction::Out,
                    ep: 0,
                },
                body: HeaderBody::RetSubmit(RetSubmit {
                    status,
                    actual_length: data.len() as i32,
                    start_frame: 0,
                    number_of_packets: NON_ISOCH,
                    error_count: 0,
                }),
            },
            data: Bytes::copy_from_slice(data),
            iso_descriptors: Vec::new(),
        }
    }

    fn ret_unlink(seqnum: u32, status: i32) -> UsbIpPacket {
        UsbIpPacket::bare(UsbIpHeader {
            basic: HeaderBasic {
                seqnum,
                devid: 0,
                direction: Direction::Out,
                ep: 0,
            },
            body: HeaderBody::RetUnlink { status },
        })
    }

    fn sent_header(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> UsbIpHeader {
        let frame = rx.try_recv().expect("frame queued");
        UsbIpHeader::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let (table, mut rx) = table();
        let handle = table.submit(&SubmitRequest::transfer_in(1, 64)).unwrap();
        let seqnum = handle.seqnum();

        let header = sent_header(&mut rx);
        assert_eq!(header.command(), Command::CmdSubmit);
        assert_eq!(header.basic.seqnum, seqnum);
        assert_eq!(header.basic.devid, 0x0001_0002);
        assert_eq!(table.len(), 1);

        let reply = ret_submit(seqnum, 0, &[0xaa; 64]);
        assert_eq!(table.reply_data_len(&reply.header).unwrap(), 64);
        assert_eq!(table.on_reply(reply), ReplyDisposition::Completed);

        let completion = handle.await.unwrap();
        assert!(completion.is_success());
        assert_eq!(completion.actual_length, 64);
        assert_eq!(completion.data.len(), 64);
        assert!(table.is_empty());
    }

    #[test]
    fn test_out_submit_carries_data() {
        let (table, mut rx) = table();
        let _handle = table
            .submit(&SubmitRequest::transfer_out(2, vec![1u8, 2, 3]))
            .unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.len(), HEADER_SIZE + 3);
        assert_eq!(&frame[HEADER_SIZE..], &[1, 2, 3]);
    }

    #[test]
    fn test_seqnums_start_at_one_and_increase() {
        let (table, _rx) = table();
        let a = table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap();
        let b = table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap();
        assert_eq!(a.seqnum(), 1);
        assert_eq!(b.seqnum(), 2);
    }

    #[test]
    fn test_seqnum_wraps_past_zero() {
        let (table, _rx) = table();
        table.lock().next_seqnum = u32::MAX;
        let a = table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap();
        let b = table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap();
        assert_eq!(a.seqnum(), u32::MAX);
        assert_eq!(b.seqnum(), 1);
    }

    #[test]
    fn test_seqnum_skips_outstanding() {
        let (table, _rx) = table();
        let first = table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap();
        table.lock().next_seqnum = first.seqnum();
        let second = table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap();
        assert_ne!(first.seqnum(), second.seqnum());
    }

    #[tokio::test]
    async fn test_cancel_reply_wins() {
        let (table, mut rx) = table();
        let handle = table.submit(&SubmitRequest::transfer_in(1, 64)).unwrap();
        let seqnum = handle.seqnum();
        sent_header(&mut rx);

        let CancelOutcome::UnlinkSent { unlink_seqnum } = table.cancel(seqnum).unwrap() else {
            panic!("expected unlink");
        };
        let unlink = sent_header(&mut rx);
        assert_eq!(unlink.basic.seqnum, unlink_seqnum);
        assert_eq!(
            unlink.body,
            HeaderBody::CmdUnlink {
                unlink_seqnum: seqnum
            }
        );
        assert_eq!(
            table.state_of(seqnum),
            Some(PendingState::UnlinkPending { unlink_seqnum })
        );

        assert_eq!(
            table.on_reply(ret_submit(seqnum, 0, &[1; 16])),
            ReplyDisposition::Completed
        );
        assert_eq!(
            table.on_reply(ret_unlink(unlink_seqnum, 0)),
            ReplyDisposition::Discarded
        );

        assert_eq!(handle.await.unwrap().actual_length, 16);
    }

    #[tokio::test]
    async fn test_cancel_unlink_wins() {
        let (table, _rx) = table();
        let handle = table.submit(&SubmitRequest::transfer_in(1, 64)).unwrap();
        let seqnum = handle.seqnum();

        let CancelOutcome::UnlinkSent { unlink_seqnum } = table.cancel(seqnum).unwrap() else {
            panic!("expected unlink");
        };
        assert_eq!(
            table.on_reply(ret_unlink(unlink_seqnum, -104)),
            ReplyDisposition::Cancelled
        );

        // A late RET_SUBMIT still keeps the stream aligned and is dropped
        let late = ret_submit(seqnum, -104, &[]);
        assert_eq!(table.reply_data_len(&late.header).unwrap(), 0);
        assert_eq!(table.on_reply(late), ReplyDisposition::Discarded);

        assert_eq!(handle.await, Err(RequestError::Cancelled { status: -104 }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_cancel_twice_and_unknown() {
        let (table, _rx) = table();
        let handle = table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap();

        assert!(matches!(
            table.cancel(handle.seqnum()).unwrap(),
            CancelOutcome::UnlinkSent { .. }
        ));
        assert_eq!(
            table.cancel(handle.seqnum()).unwrap(),
            CancelOutcome::AlreadyUnlinking
        );
        assert_eq!(table.cancel(999).unwrap(), CancelOutcome::NotFound);
    }

    #[test]
    fn test_unlink_seqnum_is_fresh() {
        let (table, _rx) = table();
        let a = table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap();
        let b = table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap();
        let CancelOutcome::UnlinkSent { unlink_seqnum } = table.cancel(a.seqnum()).unwrap() else {
            panic!("expected unlink");
        };
        assert_ne!(unlink_seqnum, a.seqnum());
        assert_ne!(unlink_seqnum, b.seqnum());

        let c = table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap();
        assert_ne!(c.seqnum(), unlink_seqnum);
    }

    #[test]
    fn test_unmatched_replies_are_dropped() {
        let (table, _rx) = table();
        assert_eq!(
            table.on_reply(ret_submit(42, 0, &[])),
            ReplyDisposition::Unmatched
        );
        assert_eq!(
            table.on_reply(ret_unlink(43, 0)),
            ReplyDisposition::Unmatched
        );
    }

    #[test]
    fn test_unmatched_reply_with_data_is_malformed() {
        let (table, _rx) = table();
        assert_eq!(table.reply_data_len(&ret_submit(42, 0, &[]).header).unwrap(), 0);

        // The remote host sends direction 0 on every reply, so the header
        // cannot say whether data follows
        for direction in [Direction::Out, Direction::In] {
            let mut reply = ret_submit(42, 0, &[0; 16]);
            reply.header.basic.direction = direction;
            assert!(matches!(
                table.reply_data_len(&reply.header),
                Err(ProtocolError::Malformed {
                    field: "actual_length",
                    ..
                })
            ));
        }

        let mut huge = ret_submit(42, 0, &[]);
        if let HeaderBody::RetSubmit(ref mut ret) = huge.header.body {
            ret.actual_length = i32::MAX;
        }
        huge.header.basic.direction = Direction::In;
        assert!(table.reply_data_len(&huge.header).is_err());
    }

    #[tokio::test]
    async fn test_late_reply_after_history_rolls_over() {
        let (table, _rx) = table();
        let first = table.submit(&SubmitRequest::transfer_in(1, 64)).unwrap();
        let first_seqnum = first.seqnum();

        for i in 0..=UNLINKED_HISTORY {
            let handle = if i == 0 {
                first_seqnum
            } else {
                table
                    .submit(&SubmitRequest::transfer_in(1, 64))
                    .unwrap()
                    .seqnum()
            };
            let CancelOutcome::UnlinkSent { unlink_seqnum } = table.cancel(handle).unwrap() else {
                panic!("expected unlink");
            };
            assert_eq!(
                table.on_reply(ret_unlink(unlink_seqnum, -104)),
                ReplyDisposition::Cancelled
            );
        }
        assert_eq!(first.await, Err(RequestError::Cancelled { status: -104 }));

        // Still remembered: its IN data is read and dropped
        let recent = ret_submit(first_seqnum + 2 * UNLINKED_HISTORY as u32, 0, &[0; 16]);
        assert_eq!(table.reply_data_len(&recent.header).unwrap(), 16);

        // Forgotten: the payload length is unknown, the stream is lost
        let late = ret_submit(first_seqnum, 0, &[0; 16]);
        assert!(table.reply_data_len(&late.header).is_err());
    }

    #[test]
    fn test_unlinked_reply_larger_than_buffer_is_malformed() {
        let (table, _rx) = table();
        let handle = table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap();
        let CancelOutcome::UnlinkSent { unlink_seqnum } = table.cancel(handle.seqnum()).unwrap()
        else {
            panic!("expected unlink");
        };
        table.on_reply(ret_unlink(unlink_seqnum, -104));

        let late = ret_submit(handle.seqnum(), 0, &[0; 9]);
        assert!(table.reply_data_len(&late.header).is_err());
    }

    #[test]
    fn test_out_length_mismatch_is_refused() {
        let (table, mut rx) = table();
        let request = SubmitRequest::control(
            [0x40, 0x01, 0, 0, 0, 0, 8, 0],
            Direction::Out,
            8,
            Bytes::from_static(&[1, 2]),
        );
        assert!(matches!(
            table.submit(&request),
            Err(RequestError::InvalidRequest(_))
        ));

        let mut request = SubmitRequest::transfer_out(2, vec![0u8; 4]);
        request.transfer_buffer_length = 2;
        assert!(matches!(
            table.submit(&request),
            Err(RequestError::InvalidRequest(_))
        ));

        assert!(rx.try_recv().is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_too_many_iso_packets_is_refused() {
        let (table, mut rx) = table();
        let mut request = SubmitRequest::transfer_in(3, 1025);
        request.iso_descriptors = vec![
            IsoPacketDescriptor {
                offset: 0,
                length: 1,
                actual_length: 0,
                status: 0,
            };
            MAX_ISO_PACKETS as usize + 1
        ];
        assert!(matches!(
            table.submit(&request),
            Err(RequestError::InvalidRequest(_))
        ));
        assert!(rx.try_recv().is_err());

        request.iso_descriptors.truncate(MAX_ISO_PACKETS as usize);
        table.submit(&request).unwrap();
        let frame = rx.try_recv().unwrap();
        let (packet, _) = UsbIpPacket::decode(&frame, 0).unwrap();
        assert_eq!(packet.header.iso_packet_count(), MAX_ISO_PACKETS as usize);
    }

    #[test]
    fn test_length_beyond_i32_is_refused() {
        let (table, mut rx) = table();
        let request = SubmitRequest::transfer_in(1, i32::MAX as u32 + 1);
        assert!(matches!(
            table.submit(&request),
            Err(RequestError::InvalidRequest(_))
        ));
        assert!(rx.try_recv().is_err());

        // Refusals do not use up sequence numbers
        let handle = table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap();
        assert_eq!(handle.seqnum(), 1);
    }

    #[test]
    fn test_out_header_declares_data_sent() {
        let (table, mut rx) = table();
        table
            .submit(&SubmitRequest::transfer_out(2, vec![7u8; 5]))
            .unwrap();
        let frame = rx.try_recv().unwrap();
        let header = UsbIpHeader::decode(&frame).unwrap();
        assert_eq!(header.outbound_data_len(), 5);
        assert_eq!(frame.len(), HEADER_SIZE + 5);
    }

    #[test]
    fn test_settled_unlinks_are_bounded() {
        let (table, _rx) = table();
        let mut unlink_seqnums = Vec::new();
        for _ in 0..UNLINKED_HISTORY * 2 {
            let handle = table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap();
            let CancelOutcome::UnlinkSent { unlink_seqnum } =
                table.cancel(handle.seqnum()).unwrap()
            else {
                panic!("expected unlink");
            };
            // RET_SUBMIT wins; the peer never sends RET_UNLINK
            assert_eq!(
                table.on_reply(ret_submit(handle.seqnum(), 0, &[])),
                ReplyDisposition::Completed
            );
            unlink_seqnums.push(unlink_seqnum);
        }

        {
            let inner = table.lock();
            assert!(inner.unlinks.is_empty());
            assert_eq!(inner.settled_unlinks.len(), UNLINKED_HISTORY);
        }

        let last = *unlink_seqnums.last().unwrap();
        assert_eq!(
            table.on_reply(ret_unlink(last, 0)),
            ReplyDisposition::Discarded
        );
        assert_eq!(
            table.on_reply(ret_unlink(unlink_seqnums[0], 0)),
            ReplyDisposition::Unmatched
        );
    }

    #[test]
    fn test_out_reply_has_no_data() {
        let (table, _rx) = table();
        let handle = table
            .submit(&SubmitRequest::transfer_out(2, vec![0u8; 512]))
            .unwrap();
        let mut reply = ret_submit(handle.seqnum(), 0, &[]);
        if let HeaderBody::RetSubmit(ref mut ret) = reply.header.body {
            ret.actual_length = 512;
        }
        assert_eq!(table.reply_data_len(&reply.header).unwrap(), 0);
    }

    #[test]
    fn test_oversized_reply_is_malformed() {
        let (table, _rx) = table();
        let handle = table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap();
        let reply = ret_submit(handle.seqnum(), 0, &[0; 9]);
        assert!(matches!(
            table.reply_data_len(&reply.header),
            Err(ProtocolError::Malformed {
                field: "actual_length",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let (table, _rx) = table();
        let handles: Vec<_> = (0..5)
            .map(|_| table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap())
            .collect();

        assert_eq!(table.fail_all(), 5);
        assert!(table.is_empty());
        assert!(table.is_closed());

        for handle in handles {
            assert_eq!(handle.await, Err(RequestError::ConnectionClosed));
        }

        assert_eq!(
            table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap_err(),
            RequestError::ConnectionClosed
        );
        assert_eq!(table.cancel(1), Err(RequestError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_writer_gone_fails_submit() {
        let (table, rx) = table();
        drop(rx);
        assert_eq!(
            table.submit(&SubmitRequest::transfer_in(1, 8)).unwrap_err(),
            RequestError::ConnectionClosed
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_iso_submit_sets_packet_count() {
        let (table, mut rx) = table();
        let mut request = SubmitRequest::transfer_out(3, vec![0u8; 64]);
        request.iso_descriptors = vec![
            IsoPacketDescriptor {
                offset: 0,
                length: 32,
                actual_length: 0,
                status: 0,
            },
            IsoPacketDescriptor {
                offset: 32,
                length: 32,
                actual_length: 0,
                status: 0,
            },
        ];
        table.submit(&request).unwrap();

        let frame = rx.try_recv().unwrap();
        let (packet, consumed) = UsbIpPacket::decode(&frame, 64).unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(packet.header.iso_packet_count(), 2);
        assert_eq!(packet.iso_descriptors, request.iso_descriptors);
    }

    #[test]
    fn test_is_reply() {
        assert!(is_reply(Command::RetSubmit));
        assert!(is_reply(Command::RetUnlink));
        assert!(!is_reply(Command::CmdSubmit));
    }
}
