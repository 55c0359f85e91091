//! Peer addresses and per-peer expected-receive matching state.
//!
//! Each address owns the two ordered sequences that make tag matching work:
//! receives the user has posted (`rxs`) and expected messages that arrived
//! before their matching post (`early`). Matching is strict FIFO within a
//! tag; there is no wildcard matching, so both sides choose their tags.
//!
//! Addresses are cheap to clone: all state sits behind one `Arc`, and the
//! endpoint caches one canonical address per connection identity so every
//! clone observes the same matching state.

use std::fmt;
use std::sync::{Arc, Mutex};

use smallvec::SmallVec;
use tracing::trace;

use super::transport::ConnId;
use super::{Callback, OpId};

/// A posted expected receive waiting for a matching arrival.
pub(crate) struct PostedRx {
    pub(crate) op: OpId,
    pub(crate) tag: u32,
    pub(crate) buf: Vec<u8>,
    pub(crate) cb: Callback,
}

/// An expected message that arrived before its matching post.
pub(crate) struct EarlyMsg {
    pub(crate) tag: u32,
    pub(crate) data: Vec<u8>,
}

/// Per-peer matching state, guarded by one mutex so a post can scan the
/// early queue and enqueue itself in a single step (and likewise for
/// arrivals against posts).
#[derive(Default)]
struct PeerQueues {
    rxs: SmallVec<[PostedRx; 4]>,
    early: SmallVec<[EarlyMsg; 4]>,
}

struct AddrInner {
    conn: Option<ConnId>,
    uri: String,
    unexpected_origin: bool,
    is_self: bool,
    queues: Mutex<PeerQueues>,
}

/// An opaque peer address.
///
/// Obtained from an address lookup, from `addr_self`, or implicitly as the
/// source of an arrived unexpected message.
#[derive(Clone)]
pub struct Addr {
    inner: Arc<AddrInner>,
}

impl Addr {
    pub(crate) fn new(conn: ConnId, uri: String, unexpected_origin: bool) -> Self {
        Addr {
            inner: Arc::new(AddrInner {
                conn: Some(conn),
                uri,
                unexpected_origin,
                is_self: false,
                queues: Mutex::new(PeerQueues::default()),
            }),
        }
    }

    pub(crate) fn new_self(uri: String) -> Self {
        Addr {
            inner: Arc::new(AddrInner {
                conn: None,
                uri,
                unexpected_origin: false,
                is_self: true,
                queues: Mutex::new(PeerQueues::default()),
            }),
        }
    }

    /// The URI this address was resolved from (or the local URI for a self
    /// address).
    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    /// Whether this address names the local endpoint itself. Self
    /// addresses carry no connection identity.
    pub fn is_self(&self) -> bool {
        self.inner.is_self
    }

    /// Whether this address was created implicitly by an incoming message
    /// rather than by a lookup.
    pub fn unexpected_origin(&self) -> bool {
        self.inner.unexpected_origin
    }

    pub(crate) fn conn(&self) -> Option<ConnId> {
        self.inner.conn
    }

    /// Whether any posted receive or early arrival is still queued on this
    /// peer. An address must be drained before it can be freed.
    pub(crate) fn has_pending(&self) -> bool {
        let queues = self.inner.queues.lock().expect("peer queue mutex poisoned");
        !queues.rxs.is_empty() || !queues.early.is_empty()
    }

    /// Consumes a matching early arrival, or enqueues the posted receive if
    /// none is cached. Performed under one lock acquisition so a concurrent
    /// arrival cannot slip between the scan and the enqueue.
    pub(crate) fn match_or_post_rx(&self, rx: PostedRx) -> Option<(PostedRx, EarlyMsg)> {
        let mut queues = self.inner.queues.lock().expect("peer queue mutex poisoned");
        match queues.early.iter().position(|e| e.tag == rx.tag) {
            Some(idx) => {
                let early = queues.early.remove(idx);
                trace!(uri = %self.inner.uri, tag = rx.tag, "expected post matched early arrival");
                Some((rx, early))
            }
            None => {
                queues.rxs.push(rx);
                None
            }
        }
    }

    /// Consumes a matching posted receive, handing the payload back with it,
    /// or caches the arrival as early if none is posted. The early entry
    /// owns its own copy of the payload.
    pub(crate) fn match_or_store_early(
        &self,
        tag: u32,
        data: Vec<u8>,
    ) -> Option<(PostedRx, Vec<u8>)> {
        let mut queues = self.inner.queues.lock().expect("peer queue mutex poisoned");
        match queues.rxs.iter().position(|rx| rx.tag == tag) {
            Some(idx) => Some((queues.rxs.remove(idx), data)),
            None => {
                trace!(uri = %self.inner.uri, tag, len = data.len(), "caching early expected arrival");
                queues.early.push(EarlyMsg { tag, data });
                None
            }
        }
    }

    /// Removes a not-yet-matched posted receive by operation id, for
    /// cancellation.
    pub(crate) fn take_rx_by_op(&self, op: OpId) -> Option<PostedRx> {
        let mut queues = self.inner.queues.lock().expect("peer queue mutex poisoned");
        let idx = queues.rxs.iter().position(|rx| rx.op == op)?;
        Some(queues.rxs.remove(idx))
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Addr")
            .field("uri", &self.inner.uri)
            .field("conn", &self.inner.conn)
            .field("is_self", &self.inner.is_self)
            .field("unexpected_origin", &self.inner.unexpected_origin)
            .finish()
    }
}
