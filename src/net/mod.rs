//! The network abstraction layer.
//!
//! An [`Endpoint`] multiplexes three kinds of traffic over one pluggable
//! [`Transport`]: unexpected sends and receives (no pre-posted match on the
//! other side), expected sends and receives (paired by tag against a
//! pre-posted receive), and one-sided RMA against registered memory. All of
//! it funnels through a single event source drained by [`Endpoint::progress`].
//!
//! The matching rules are the heart of this module:
//!
//! - Expected receives are matched per peer, strict FIFO within a tag, with
//!   early arrivals cached on the peer until the user posts.
//! - Unexpected traffic flows through two process-wide FIFOs (arrived
//!   messages awaiting a post, and posts awaiting an arrival), guarded
//!   together so at most one of the two is ever non-empty.
//! - Whenever a post finds its counterpart already queued, it completes
//!   synchronously from the posting context; no progress call is needed.
//!
//! Completion callbacks are never invoked with a queue lock held, and every
//! event dequeued from the transport is returned to it on every path.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::error::Error;

pub mod addr;
pub mod frame;
pub mod loopback;
pub mod mem;
pub mod transport;

pub use addr::Addr;
pub use mem::MemHandle;
pub use transport::{ConnId, EventKind, EventToken, MemAccess, RawEvent, Transport};

use addr::PostedRx;
use frame::FRAME_SIZE;

/// Identifies one posted operation, for cancellation and logging.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OpId(u64);

/// What kind of operation a completion belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpKind {
    Lookup,
    SendUnexpected,
    RecvUnexpected,
    SendExpected,
    RecvExpected,
    Put,
    Get,
}

/// Delivered to an operation's callback exactly once, when the operation
/// reaches its terminal state.
#[derive(Debug)]
pub struct Completion {
    pub kind: OpKind,
    pub result: Result<(), Error>,
    /// The buffer the operation was posted with, handed back to its owner.
    pub buffer: Option<Vec<u8>>,
    /// Bytes actually received (after truncation) or sent.
    pub actual_size: usize,
    /// The peer the message came from, for receive completions.
    pub source: Option<Addr>,
    pub tag: u32,
    /// Set when the operation was cancelled before delivery.
    pub canceled: bool,
}

/// Completion callback attached to a posted operation.
pub type Callback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// An arrived unexpected message waiting for a posted receive.
struct UnexpectedMsg {
    source: Addr,
    tag: u32,
    data: Vec<u8>,
}

/// A posted unexpected receive waiting for an arrival.
struct PostedUnexpected {
    op: OpId,
    buf: Vec<u8>,
    cb: Callback,
}

/// The two process-wide unexpected FIFOs, under one lock so every arrival
/// or post matches atomically against the opposite queue. Invariant: at
/// most one of the two is non-empty at any consistent observation point.
#[derive(Default)]
struct UnexpectedQueues {
    msgs: VecDeque<UnexpectedMsg>,
    ops: VecDeque<PostedUnexpected>,
}

/// A send-side operation (message send or RMA) between post and its
/// completion event, keyed by the context handed to the transport.
struct Inflight {
    kind: OpKind,
    tag: u32,
    buf: Option<Vec<u8>>,
    cb: Callback,
}

/// A network endpoint: the address book, the matching queues, and the
/// progress engine over one transport.
pub struct Endpoint {
    transport: Arc<dyn Transport>,
    self_addr: Addr,
    addrs: Mutex<HashMap<ConnId, Addr>>,
    unexpected: Mutex<UnexpectedQueues>,
    inflight: Mutex<HashMap<u64, Inflight>>,
    next_op: AtomicU64,
}

impl Endpoint {
    pub fn new(transport: Arc<dyn Transport>) -> Endpoint {
        let self_addr = Addr::new_self(transport.uri().to_string());
        let mut addrs = HashMap::new();
        // Self traffic comes back in through the normal event path; route it
        // to the one canonical self address.
        addrs.insert(transport.self_conn(), self_addr.clone());
        Endpoint {
            transport,
            self_addr,
            addrs: Mutex::new(addrs),
            unexpected: Mutex::new(UnexpectedQueues::default()),
            inflight: Mutex::new(HashMap::new()),
            next_op: AtomicU64::new(1),
        }
    }

    /// The URI peers can use to reach this endpoint.
    pub fn uri(&self) -> &str {
        self.transport.uri()
    }

    /// Largest payload accepted for an unexpected send.
    pub fn max_unexpected_size(&self) -> usize {
        self.transport.max_unexpected_size()
    }

    /// Largest payload accepted for an expected send.
    pub fn max_expected_size(&self) -> usize {
        self.transport.max_expected_size()
    }

    /// Largest tag usable for message pairing. The transport limit is
    /// shifted right by two: the top two bits of tag space stay reserved
    /// for internal signalling.
    pub fn max_tag(&self) -> u32 {
        self.transport.max_tag() >> 2
    }

    fn next_op(&self) -> OpId {
        OpId(self.next_op.fetch_add(1, Ordering::Relaxed))
    }

    // ---- address book -----------------------------------------------------

    /// The address of this endpoint itself.
    pub fn addr_self(&self) -> Addr {
        self.self_addr.clone()
    }

    /// Resolves a peer URI. The result is delivered through the callback,
    /// which may run synchronously from this call.
    pub fn addr_lookup(
        &self,
        uri: &str,
        cb: impl FnOnce(Result<Addr, Error>) + Send + 'static,
    ) -> Result<OpId, Error> {
        if uri.is_empty() {
            return Err(Error::InvalidParam);
        }
        let op = self.next_op();
        match self.transport.resolve(uri) {
            Ok(conn) => {
                let addr = self.addr_for_conn(conn, Some(uri), false);
                cb(Ok(addr));
            }
            Err(e) => {
                warn!(uri, error = %e, "address lookup failed");
                cb(Err(Error::Protocol));
            }
        }
        Ok(op)
    }

    /// Releases an address. Rejected while the peer still has posted
    /// receives or cached early arrivals; those must drain or be
    /// cancelled first.
    pub fn addr_free(&self, addr: &Addr) -> Result<(), Error> {
        if addr.has_pending() {
            return Err(Error::Protocol);
        }
        if let Some(conn) = addr.conn() {
            self.addrs.lock().expect("address book poisoned").remove(&conn);
        }
        Ok(())
    }

    /// The one canonical address for a connection identity, creating it
    /// implicitly for previously-unknown peers.
    fn addr_for_conn(&self, conn: ConnId, uri_hint: Option<&str>, unexpected_origin: bool) -> Addr {
        let mut addrs = self.addrs.lock().expect("address book poisoned");
        if let Some(addr) = addrs.get(&conn) {
            return addr.clone();
        }
        let uri = uri_hint
            .map(str::to_string)
            .or_else(|| self.transport.conn_uri(conn))
            .unwrap_or_default();
        let addr = Addr::new(conn, uri, unexpected_origin);
        addrs.insert(conn, addr.clone());
        addr
    }

    fn conn_of(&self, addr: &Addr) -> Result<ConnId, Error> {
        if addr.is_self() {
            return Ok(self.transport.self_conn());
        }
        addr.conn().ok_or(Error::InvalidParam)
    }

    // ---- two-sided messaging ----------------------------------------------

    /// Posts an unexpected send towards `dest`. The callback runs when the
    /// transport signals completion and hands the payload buffer back.
    pub fn msg_send_unexpected(
        &self,
        dest: &Addr,
        tag: u32,
        buf: Vec<u8>,
        cb: Callback,
    ) -> Result<OpId, Error> {
        self.post_send(
            dest,
            false,
            tag,
            buf,
            cb,
            OpKind::SendUnexpected,
            self.max_unexpected_size(),
        )
    }

    /// Posts an expected send towards `dest`. The destination pairs it with
    /// a receive posted under the same tag.
    pub fn msg_send_expected(
        &self,
        dest: &Addr,
        tag: u32,
        buf: Vec<u8>,
        cb: Callback,
    ) -> Result<OpId, Error> {
        self.post_send(
            dest,
            true,
            tag,
            buf,
            cb,
            OpKind::SendExpected,
            self.max_expected_size(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn post_send(
        &self,
        dest: &Addr,
        expect: bool,
        tag: u32,
        buf: Vec<u8>,
        cb: Callback,
        kind: OpKind,
        max_size: usize,
    ) -> Result<OpId, Error> {
        if tag > self.max_tag() {
            return Err(Error::InvalidParam);
        }
        if buf.len() > max_size {
            return Err(Error::Size);
        }
        let conn = self.conn_of(dest)?;
        let op = self.next_op();

        let mut msg = Vec::with_capacity(FRAME_SIZE + buf.len());
        msg.extend_from_slice(&frame::encode(expect, tag));
        msg.extend_from_slice(&buf);

        // Register the operation before handing the bytes over: the
        // completion event can race in from the progress thread.
        self.inflight
            .lock()
            .expect("inflight table poisoned")
            .insert(op.0, Inflight { kind, tag, buf: Some(buf), cb });
        if let Err(e) = self.transport.send(conn, &msg, op.0) {
            self.inflight.lock().expect("inflight table poisoned").remove(&op.0);
            warn!(uri = dest.uri(), error = %e, "transport send failed");
            return Err(Error::Protocol);
        }
        trace!(uri = dest.uri(), tag, expect, len = msg.len(), "posted send");
        Ok(op)
    }

    /// Posts a receive for the next unexpected message from any peer. If
    /// one is already queued, the oldest is consumed and the callback runs
    /// synchronously from this call.
    pub fn msg_recv_unexpected(&self, buf: Vec<u8>, cb: Callback) -> Result<OpId, Error> {
        let op = self.next_op();
        let mut queues = self.unexpected.lock().expect("unexpected queues poisoned");
        if let Some(msg) = queues.msgs.pop_front() {
            drop(queues);
            deliver_unexpected(buf, cb, msg);
        } else {
            queues.ops.push_back(PostedUnexpected { op, buf, cb });
        }
        Ok(op)
    }

    /// Posts an expected receive for tag `tag` from `source`. If a matching
    /// early arrival is cached, it is consumed and the callback runs
    /// synchronously from this call.
    pub fn msg_recv_expected(
        &self,
        source: &Addr,
        tag: u32,
        buf: Vec<u8>,
        cb: Callback,
    ) -> Result<OpId, Error> {
        if tag > self.max_tag() {
            return Err(Error::InvalidParam);
        }
        let op = self.next_op();
        let rx = PostedRx { op, tag, buf, cb };
        if let Some((rx, early)) = source.match_or_post_rx(rx) {
            deliver_expected(source, rx, &early.data);
        }
        Ok(op)
    }

    // ---- one-sided RMA ----------------------------------------------------

    /// Binds a handle's region to this endpoint so peers can address it.
    pub fn mem_register(&self, handle: &mut MemHandle) -> Result<(), Error> {
        if handle.is_registered() {
            return Err(Error::InvalidParam);
        }
        let region = handle.region().cloned().ok_or(Error::InvalidParam)?;
        let key = self
            .transport
            .rma_register(region, handle.access())
            .map_err(|e| {
                warn!(error = %e, "memory registration failed");
                Error::Protocol
            })?;
        handle.set_key(key);
        Ok(())
    }

    /// Unbinds a previously registered handle. Only valid once no
    /// outstanding RMA can still reference the region.
    pub fn mem_deregister(&self, handle: &mut MemHandle) -> Result<(), Error> {
        if !handle.is_registered() || handle.is_remote() {
            return Err(Error::InvalidParam);
        }
        self.transport.rma_deregister(handle.key()).map_err(|e| {
            warn!(error = %e, "memory deregistration failed");
            Error::Protocol
        })?;
        handle.set_key(mem::KEY_NONE);
        Ok(())
    }

    /// One-sided write into a peer's registered region. The remote handle
    /// must grant write access; checked before anything is posted.
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        local: &MemHandle,
        local_offset: usize,
        remote: &MemHandle,
        remote_offset: usize,
        len: usize,
        dest: &Addr,
        cb: Callback,
    ) -> Result<OpId, Error> {
        if !remote.access().writable() {
            return Err(Error::Permission);
        }
        self.post_rma(OpKind::Put, local, local_offset, remote, remote_offset, len, dest, cb)
    }

    /// One-sided read from a peer's registered region. Registered regions
    /// always grant at least read access.
    #[allow(clippy::too_many_arguments)]
    pub fn get(
        &self,
        local: &MemHandle,
        local_offset: usize,
        remote: &MemHandle,
        remote_offset: usize,
        len: usize,
        dest: &Addr,
        cb: Callback,
    ) -> Result<OpId, Error> {
        self.post_rma(OpKind::Get, local, local_offset, remote, remote_offset, len, dest, cb)
    }

    #[allow(clippy::too_many_arguments)]
    fn post_rma(
        &self,
        kind: OpKind,
        local: &MemHandle,
        local_offset: usize,
        remote: &MemHandle,
        remote_offset: usize,
        len: usize,
        dest: &Addr,
        cb: Callback,
    ) -> Result<OpId, Error> {
        if !local.is_registered() || !remote.is_registered() {
            return Err(Error::InvalidParam);
        }
        let local_end = local_offset.checked_add(len).ok_or(Error::Size)?;
        let remote_end = remote_offset.checked_add(len).ok_or(Error::Size)?;
        if local_end > local.len() || remote_end > remote.len() {
            return Err(Error::Size);
        }
        let conn = self.conn_of(dest)?;
        let op = self.next_op();
        self.inflight
            .lock()
            .expect("inflight table poisoned")
            .insert(op.0, Inflight { kind, tag: 0, buf: None, cb });
        let posted = match kind {
            OpKind::Put => self.transport.rma_put(
                conn,
                local.key(),
                local_offset,
                remote.key(),
                remote_offset,
                len,
                op.0,
            ),
            OpKind::Get => self.transport.rma_get(
                conn,
                local.key(),
                local_offset,
                remote.key(),
                remote_offset,
                len,
                op.0,
            ),
            _ => unreachable!("post_rma only handles RMA kinds"),
        };
        if let Err(e) = posted {
            self.inflight.lock().expect("inflight table poisoned").remove(&op.0);
            warn!(error = %e, ?kind, "RMA post failed");
            return Err(Error::Protocol);
        }
        Ok(op)
    }

    // ---- cancellation -----------------------------------------------------

    /// Cancels a posted receive that has not been delivered yet. Its
    /// callback runs with `canceled` set. Operations already delivered (or
    /// in flight on the transport) report `NoMatch`.
    pub fn cancel(&self, op: OpId) -> Result<(), Error> {
        let posted = {
            let mut queues = self.unexpected.lock().expect("unexpected queues poisoned");
            queues
                .ops
                .iter()
                .position(|p| p.op == op)
                .and_then(|idx| queues.ops.remove(idx))
        };
        if let Some(post) = posted {
            (post.cb)(Completion {
                kind: OpKind::RecvUnexpected,
                result: Err(Error::Fail),
                buffer: Some(post.buf),
                actual_size: 0,
                source: None,
                tag: 0,
                canceled: true,
            });
            return Ok(());
        }

        let addrs: Vec<Addr> = {
            let addrs = self.addrs.lock().expect("address book poisoned");
            addrs.values().cloned().collect()
        };
        for addr in addrs {
            if let Some(rx) = addr.take_rx_by_op(op) {
                (rx.cb)(Completion {
                    kind: OpKind::RecvExpected,
                    result: Err(Error::Fail),
                    buffer: Some(rx.buf),
                    actual_size: 0,
                    source: Some(addr.clone()),
                    tag: rx.tag,
                    canceled: true,
                });
                return Ok(());
            }
        }
        Err(Error::NoMatch)
    }

    // ---- progress ---------------------------------------------------------

    /// Drives the endpoint: blocks up to `timeout` for one event, handles
    /// it, and returns. `Err(Timeout)` means the deadline passed with
    /// nothing to do; nothing is lost.
    pub fn progress(&self, timeout: Duration) -> Result<(), Error> {
        let event = self.transport.next_event(timeout).map_err(|e| {
            error!(error = %e, "transport event wait failed");
            Error::Protocol
        })?;
        let Some(event) = event else {
            return Err(Error::Timeout);
        };
        let token = event.token;
        let result = self.dispatch(event.kind);
        // The event goes back to the transport on every path; holding on to
        // it would leak transport credits.
        self.transport.return_event(token);
        result
    }

    fn dispatch(&self, kind: EventKind) -> Result<(), Error> {
        match kind {
            EventKind::Send { ctx, result } => {
                self.handle_send_event(ctx, result);
                Ok(())
            }
            EventKind::Recv { conn, data } => self.handle_recv_event(conn, data),
            EventKind::ConnectRequest { conn }
            | EventKind::Connect { conn }
            | EventKind::Accept { conn } => {
                trace!(?conn, "connection event ignored at this layer");
                Ok(())
            }
        }
    }

    fn handle_send_event(&self, ctx: u64, result: Result<(), Error>) {
        let inflight = self.inflight.lock().expect("inflight table poisoned").remove(&ctx);
        let Some(op) = inflight else {
            warn!(ctx, "send completion with no matching operation");
            return;
        };
        let actual_size = op.buf.as_ref().map_or(0, Vec::len);
        (op.cb)(Completion {
            kind: op.kind,
            result,
            buffer: op.buf,
            actual_size,
            source: None,
            tag: op.tag,
            canceled: false,
        });
    }

    fn handle_recv_event(&self, conn: ConnId, data: Vec<u8>) -> Result<(), Error> {
        let (expect, tag) = frame::decode(&data)?;
        let payload = &data[FRAME_SIZE..];
        let addr = self.addr_for_conn(conn, None, true);
        trace!(uri = addr.uri(), tag, expect, len = payload.len(), "message arrived");
        if expect {
            if let Some((rx, data)) = addr.match_or_store_early(tag, payload.to_vec()) {
                deliver_expected(&addr, rx, &data);
            }
        } else {
            let mut queues = self.unexpected.lock().expect("unexpected queues poisoned");
            if let Some(post) = queues.ops.pop_front() {
                drop(queues);
                deliver_unexpected(
                    post.buf,
                    post.cb,
                    UnexpectedMsg { source: addr, tag, data: payload.to_vec() },
                );
            } else {
                debug!(uri = addr.uri(), tag, "queueing unexpected message");
                queues.msgs.push_back(UnexpectedMsg {
                    source: addr,
                    tag,
                    data: payload.to_vec(),
                });
            }
        }
        Ok(())
    }

    // ---- lifecycle --------------------------------------------------------

    /// Verifies the endpoint can shut down: no posted unexpected receive may
    /// still be pending. Unclaimed arrived messages are only warned about;
    /// their storage goes away with the endpoint.
    pub fn check_drained(&self) -> Result<(), Error> {
        let queues = self.unexpected.lock().expect("unexpected queues poisoned");
        if !queues.ops.is_empty() {
            warn!(pending = queues.ops.len(), "unexpected receives still posted");
            return Err(Error::Protocol);
        }
        if !queues.msgs.is_empty() {
            warn!(queued = queues.msgs.len(), "unclaimed unexpected messages at shutdown");
        }
        Ok(())
    }
}

/// Copies a payload into a posted receive's buffer (truncating to its
/// capacity) and fires the callback. Runs with no queue lock held.
fn deliver_expected(source: &Addr, rx: PostedRx, data: &[u8]) {
    let mut buf = rx.buf;
    let actual_size = buf.len().min(data.len());
    buf[..actual_size].copy_from_slice(&data[..actual_size]);
    (rx.cb)(Completion {
        kind: OpKind::RecvExpected,
        result: Ok(()),
        buffer: Some(buf),
        actual_size,
        source: Some(source.clone()),
        tag: rx.tag,
        canceled: false,
    });
}

/// Same as [`deliver_expected`] for the unexpected path.
fn deliver_unexpected(mut buf: Vec<u8>, cb: Callback, msg: UnexpectedMsg) {
    let actual_size = buf.len().min(msg.data.len());
    buf[..actual_size].copy_from_slice(&msg.data[..actual_size]);
    cb(Completion {
        kind: OpKind::RecvUnexpected,
        result: Ok(()),
        buffer: Some(buf),
        actual_size,
        source: Some(msg.source),
        tag: msg.tag,
        canceled: false,
    });
}
