//! An in-process transport.
//!
//! The loopback fabric wires any number of endpoints together through plain
//! in-memory queues, implementing the full [`Transport`] contract: framed
//! message delivery, a registered-region RMA space, blocking event waits,
//! and event credit accounting. It exists so the whole runtime can be
//! exercised end-to-end inside one process (the integration tests and the
//! demo run on it). It doubles as the reference for what a real
//! interconnect plugin has to provide.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tracing::trace;

use super::frame::FRAME_MAX_TAG;
use super::transport::{ConnId, EventKind, EventToken, MemAccess, RawEvent, Transport};

/// Largest payload accepted for an unexpected send.
const MAX_UNEXPECTED_SIZE: usize = 4096;

/// Largest payload accepted for an expected send.
const MAX_EXPECTED_SIZE: usize = 8192;

/// A registered RMA region and the access it grants to peers.
struct Region {
    bytes: Arc<RwLock<Vec<u8>>>,
    access: MemAccess,
}

/// State shared by every endpoint opened on one fabric.
struct FabricState {
    endpoints: Mutex<HashMap<String, Arc<EndpointShared>>>,
    regions: Mutex<HashMap<u64, Region>>,
    next_key: AtomicU64,
}

/// The in-process fabric. Cloning shares the same fabric; endpoints opened
/// on clones can reach each other.
#[derive(Clone)]
pub struct LoopbackFabric {
    state: Arc<FabricState>,
}

impl LoopbackFabric {
    pub fn new() -> LoopbackFabric {
        LoopbackFabric {
            state: Arc::new(FabricState {
                endpoints: Mutex::new(HashMap::new()),
                regions: Mutex::new(HashMap::new()),
                next_key: AtomicU64::new(1),
            }),
        }
    }

    /// Opens an endpoint reachable at `loop://<name>`.
    pub fn open(&self, name: &str) -> Result<Arc<LoopbackTransport>, anyhow::Error> {
        self.open_with_max_tag(name, FRAME_MAX_TAG)
    }

    /// Opens an endpoint that reports `max_tag` as its transport tag limit.
    /// Mostly useful for exercising tag wraparound with a tiny tag space.
    pub fn open_with_max_tag(
        &self,
        name: &str,
        max_tag: u32,
    ) -> Result<Arc<LoopbackTransport>, anyhow::Error> {
        let uri = format!("loop://{name}");
        let shared = Arc::new(EndpointShared {
            uri: uri.clone(),
            queue: Mutex::new(VecDeque::new()),
            avail: Condvar::new(),
            outstanding: AtomicUsize::new(0),
            next_token: AtomicU64::new(1),
            next_conn: AtomicU64::new(1),
            conns: Mutex::new(ConnTable::default()),
        });
        let mut endpoints = self.state.endpoints.lock().expect("fabric endpoint table poisoned");
        if endpoints.contains_key(&uri) {
            return Err(anyhow!("endpoint {uri} already open"));
        }
        endpoints.insert(uri, Arc::clone(&shared));
        Ok(Arc::new(LoopbackTransport {
            fabric: Arc::clone(&self.state),
            shared,
            max_tag,
        }))
    }

    /// Number of RMA regions currently registered anywhere on the fabric.
    pub fn region_count(&self) -> usize {
        self.state.regions.lock().expect("fabric region table poisoned").len()
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        LoopbackFabric::new()
    }
}

#[derive(Default)]
struct ConnTable {
    by_uri: HashMap<String, ConnId>,
    by_id: HashMap<ConnId, String>,
}

struct EndpointShared {
    uri: String,
    queue: Mutex<VecDeque<RawEvent>>,
    avail: Condvar,
    /// Events handed out by `next_event` and not yet returned.
    outstanding: AtomicUsize,
    next_token: AtomicU64,
    next_conn: AtomicU64,
    conns: Mutex<ConnTable>,
}

impl EndpointShared {
    /// The stable connection identity this endpoint uses for `uri`.
    fn conn_for_uri(&self, uri: &str) -> ConnId {
        let mut conns = self.conns.lock().expect("connection table poisoned");
        if let Some(conn) = conns.by_uri.get(uri) {
            return *conn;
        }
        let conn = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        conns.by_uri.insert(uri.to_string(), conn);
        conns.by_id.insert(conn, uri.to_string());
        conn
    }

    fn post(&self, kind: EventKind) {
        let token = EventToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut queue = self.queue.lock().expect("event queue poisoned");
        queue.push_back(RawEvent { token, kind });
        self.avail.notify_one();
    }
}

/// One endpoint on a [`LoopbackFabric`].
pub struct LoopbackTransport {
    fabric: Arc<FabricState>,
    shared: Arc<EndpointShared>,
    max_tag: u32,
}

impl LoopbackTransport {
    /// Events dequeued from this endpoint and not yet returned. Zero once
    /// a progress loop has been credit-correct.
    pub fn outstanding_events(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    fn peer(&self, conn: ConnId) -> Result<Arc<EndpointShared>, anyhow::Error> {
        let uri = {
            let conns = self.shared.conns.lock().expect("connection table poisoned");
            conns
                .by_id
                .get(&conn)
                .cloned()
                .ok_or_else(|| anyhow!("unknown connection {conn:?}"))?
        };
        let endpoints = self.fabric.endpoints.lock().expect("fabric endpoint table poisoned");
        endpoints
            .get(&uri)
            .cloned()
            .ok_or_else(|| anyhow!("peer endpoint {uri} is gone"))
    }

    /// Copies `len` bytes out of a registered region.
    fn region_read(&self, key: u64, offset: usize, len: usize) -> Result<Vec<u8>, anyhow::Error> {
        let regions = self.fabric.regions.lock().expect("fabric region table poisoned");
        let region = regions.get(&key).ok_or_else(|| anyhow!("unregistered RMA key {key}"))?;
        let bytes = region.bytes.read().expect("memory region lock poisoned");
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| anyhow!("RMA read beyond region end"))?;
        Ok(bytes[offset..end].to_vec())
    }

    /// Copies bytes into a registered region, honoring its access mode when
    /// `remote` is set.
    fn region_write(
        &self,
        key: u64,
        offset: usize,
        data: &[u8],
        remote: bool,
    ) -> Result<(), anyhow::Error> {
        let regions = self.fabric.regions.lock().expect("fabric region table poisoned");
        let region = regions.get(&key).ok_or_else(|| anyhow!("unregistered RMA key {key}"))?;
        if remote && !region.access.writable() {
            return Err(anyhow!("RMA write to read-only region {key}"));
        }
        let mut bytes = region.bytes.write().expect("memory region lock poisoned");
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| anyhow!("RMA write beyond region end"))?;
        bytes[offset..end].copy_from_slice(data);
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn uri(&self) -> &str {
        &self.shared.uri
    }

    fn max_unexpected_size(&self) -> usize {
        MAX_UNEXPECTED_SIZE
    }

    fn max_expected_size(&self) -> usize {
        MAX_EXPECTED_SIZE
    }

    fn max_tag(&self) -> u32 {
        self.max_tag
    }

    fn resolve(&self, uri: &str) -> Result<ConnId, anyhow::Error> {
        let endpoints = self.fabric.endpoints.lock().expect("fabric endpoint table poisoned");
        if !endpoints.contains_key(uri) {
            return Err(anyhow!("no endpoint at {uri}"));
        }
        drop(endpoints);
        Ok(self.shared.conn_for_uri(uri))
    }

    fn self_conn(&self) -> ConnId {
        let uri = self.shared.uri.clone();
        self.shared.conn_for_uri(&uri)
    }

    fn conn_uri(&self, conn: ConnId) -> Option<String> {
        let conns = self.shared.conns.lock().expect("connection table poisoned");
        conns.by_id.get(&conn).cloned()
    }

    fn send(&self, conn: ConnId, data: &[u8], ctx: u64) -> Result<(), anyhow::Error> {
        let peer = self.peer(conn)?;
        trace!(from = %self.shared.uri, to = %peer.uri, len = data.len(), "loopback delivery");
        let reply_conn = peer.conn_for_uri(&self.shared.uri);
        peer.post(EventKind::Recv {
            conn: reply_conn,
            data: data.to_vec(),
        });
        self.shared.post(EventKind::Send { ctx, result: Ok(()) });
        Ok(())
    }

    fn rma_register(
        &self,
        region: Arc<RwLock<Vec<u8>>>,
        access: MemAccess,
    ) -> Result<u64, anyhow::Error> {
        let key = self.fabric.next_key.fetch_add(1, Ordering::Relaxed);
        let mut regions = self.fabric.regions.lock().expect("fabric region table poisoned");
        regions.insert(key, Region { bytes: region, access });
        Ok(key)
    }

    fn rma_deregister(&self, key: u64) -> Result<(), anyhow::Error> {
        let mut regions = self.fabric.regions.lock().expect("fabric region table poisoned");
        regions
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| anyhow!("unregistered RMA key {key}"))
    }

    fn rma_put(
        &self,
        _conn: ConnId,
        local_key: u64,
        local_offset: usize,
        remote_key: u64,
        remote_offset: usize,
        len: usize,
        ctx: u64,
    ) -> Result<(), anyhow::Error> {
        // Stage through a copy so overlapping or identical regions cannot
        // deadlock the region locks.
        let staged = self.region_read(local_key, local_offset, len)?;
        self.region_write(remote_key, remote_offset, &staged, true)?;
        self.shared.post(EventKind::Send { ctx, result: Ok(()) });
        Ok(())
    }

    fn rma_get(
        &self,
        _conn: ConnId,
        local_key: u64,
        local_offset: usize,
        remote_key: u64,
        remote_offset: usize,
        len: usize,
        ctx: u64,
    ) -> Result<(), anyhow::Error> {
        let staged = self.region_read(remote_key, remote_offset, len)?;
        self.region_write(local_key, local_offset, &staged, false)?;
        self.shared.post(EventKind::Send { ctx, result: Ok(()) });
        Ok(())
    }

    fn next_event(&self, timeout: Duration) -> Result<Option<RawEvent>, anyhow::Error> {
        let deadline = Instant::now().checked_add(timeout);
        let mut queue = self.shared.queue.lock().expect("event queue poisoned");
        loop {
            if let Some(event) = queue.pop_front() {
                self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
                return Ok(Some(event));
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                // Effectively unbounded; re-check the queue once a second.
                None => Duration::from_secs(1),
            };
            if remaining.is_zero() {
                return Ok(None);
            }
            let (guard, _timed_out) = self
                .shared
                .avail
                .wait_timeout(queue, remaining)
                .expect("event queue poisoned");
            queue = guard;
        }
    }

    fn return_event(&self, _token: EventToken) {
        self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}
