//! The pluggable transport seam.
//!
//! An endpoint multiplexes all of its traffic over one [`Transport`]: an
//! event-driven handle into the underlying interconnect. The trait is
//! deliberately raw (framed byte messages, registered-memory keys, and a
//! single blocking event source) so the matching, queueing, and lifecycle
//! rules can live above it and be shared by every transport.
//!
//! Transports report internal failures as [`anyhow::Error`]; the layer above
//! maps them onto the stable status codes.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use num_derive::{FromPrimitive, ToPrimitive};

use crate::error::Error;

/// Transport-level connection identity for a reachable peer.
///
/// Opaque above the transport: the same peer is always represented by the
/// same `ConnId` on a given endpoint, which is what keeps per-peer matching
/// state coherent.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

/// Identifies one dequeued event so it can be returned to the transport
/// once handled. Every dequeued event must be returned exactly once;
/// failing to do so leaks transport credits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EventToken(pub u64);

/// Access rights of a registered memory region.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum MemAccess {
    /// Remote peers may only read the region.
    ReadOnly = 1,
    /// Remote peers may read and write the region.
    ReadWrite = 2,
}

impl MemAccess {
    /// Whether the region accepts remote writes.
    pub fn writable(self) -> bool {
        matches!(self, MemAccess::ReadWrite)
    }
}

/// One event dequeued from a transport endpoint.
#[derive(Debug)]
pub struct RawEvent {
    pub token: EventToken,
    pub kind: EventKind,
}

/// The event kinds a transport can surface.
///
/// RMA completions arrive as `Send` events carrying the context of the
/// posted put/get; the layer above keys its operation table by context, not
/// by kind, so one completion shape covers all one-shot operations.
#[derive(Debug)]
pub enum EventKind {
    /// A posted send (or RMA operation) completed.
    Send {
        ctx: u64,
        result: Result<(), Error>,
    },
    /// A framed message arrived from `conn`.
    Recv { conn: ConnId, data: Vec<u8> },
    /// Connection-oriented transports only; unused by the core.
    ConnectRequest { conn: ConnId },
    /// Connection-oriented transports only; unused by the core.
    Connect { conn: ConnId },
    /// Connection-oriented transports only; unused by the core.
    Accept { conn: ConnId },
}

/// An event-driven endpoint into the underlying interconnect.
///
/// Implementations must be safe to drive from one progress thread while
/// other threads post sends and RMA operations.
pub trait Transport: Send + Sync {
    /// The URI under which this endpoint is reachable.
    fn uri(&self) -> &str;

    /// Largest payload accepted for an unexpected send.
    fn max_unexpected_size(&self) -> usize;

    /// Largest payload accepted for an expected send.
    fn max_expected_size(&self) -> usize;

    /// Largest tag value the transport can carry in its matching header.
    fn max_tag(&self) -> u32;

    /// Resolves a peer URI to a connection identity. Resolving the same URI
    /// twice yields the same identity.
    fn resolve(&self, uri: &str) -> Result<ConnId, anyhow::Error>;

    /// The connection identity that delivers back to this endpoint itself.
    fn self_conn(&self) -> ConnId;

    /// The URI behind a connection identity, if the transport knows it.
    fn conn_uri(&self, conn: ConnId) -> Option<String>;

    /// Posts a framed message towards `conn`. Completion is reported later
    /// as a [`EventKind::Send`] event carrying `ctx`.
    fn send(&self, conn: ConnId, data: &[u8], ctx: u64) -> Result<(), anyhow::Error>;

    /// Registers a memory region for RMA and returns its descriptor key.
    /// The region is always locally readable; `access` governs what remote
    /// peers may do with it.
    fn rma_register(
        &self,
        region: Arc<RwLock<Vec<u8>>>,
        access: MemAccess,
    ) -> Result<u64, anyhow::Error>;

    /// Releases a registered region. After this returns the key is dead and
    /// must not appear in further RMA operations.
    fn rma_deregister(&self, key: u64) -> Result<(), anyhow::Error>;

    /// Writes `len` bytes from the local region into the remote one.
    /// Completion is reported as a [`EventKind::Send`] event carrying `ctx`.
    #[allow(clippy::too_many_arguments)]
    fn rma_put(
        &self,
        conn: ConnId,
        local_key: u64,
        local_offset: usize,
        remote_key: u64,
        remote_offset: usize,
        len: usize,
        ctx: u64,
    ) -> Result<(), anyhow::Error>;

    /// Reads `len` bytes from the remote region into the local one.
    /// Completion is reported as a [`EventKind::Send`] event carrying `ctx`.
    #[allow(clippy::too_many_arguments)]
    fn rma_get(
        &self,
        conn: ConnId,
        local_key: u64,
        local_offset: usize,
        remote_key: u64,
        remote_offset: usize,
        len: usize,
        ctx: u64,
    ) -> Result<(), anyhow::Error>;

    /// Blocks up to `timeout` for the next event. `Ok(None)` means the
    /// deadline passed with nothing to hand out.
    fn next_event(&self, timeout: Duration) -> Result<Option<RawEvent>, anyhow::Error>;

    /// Returns a dequeued event's resources to the transport. Mandatory for
    /// every event handed out by [`Transport::next_event`].
    fn return_event(&self, token: EventToken);
}
