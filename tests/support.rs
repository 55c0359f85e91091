#![allow(dead_code)]
//! Shared harness for the integration tests: codec functions for the test
//! procedures and an in-process responder thread driving the other end of
//! the loopback fabric.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};

use fabric_rpc::net::loopback::{LoopbackFabric, LoopbackTransport};
use fabric_rpc::net::{Addr, Completion, Endpoint, MemAccess, MemHandle, Transport};
use fabric_rpc::rpc::header::{
    RequestHeader, ResponseHeader, REQUEST_HEADER_SIZE, RESPONSE_HEADER_SIZE,
};
use fabric_rpc::rpc::proc::{read_bytes, write_bytes, DecodeOp, Encoder};
use fabric_rpc::rpc::{name_id, ProcId};
use fabric_rpc::Error;

/// FNV-1a, 32 bit; the checksum procedure and its tests share this copy.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

// ---- codec functions for the test procedures -------------------------------

pub fn encode_string(enc: &mut Encoder, value: &dyn Any) -> Result<(), Error> {
    let s = value.downcast_ref::<String>().ok_or(Error::InvalidParam)?;
    write_bytes(enc, s.as_bytes())
}

pub fn decode_string(op: &mut DecodeOp<'_, '_>, value: &mut dyn Any) -> Result<(), Error> {
    let s = value.downcast_mut::<String>().ok_or(Error::InvalidParam)?;
    match op {
        DecodeOp::Decode(dec) => {
            let bytes = read_bytes(dec)?;
            *s = String::from_utf8(bytes).map_err(|_| Error::Protocol)?;
            Ok(())
        }
        DecodeOp::Release => {
            *s = String::new();
            Ok(())
        }
    }
}

pub fn encode_byte_blob(enc: &mut Encoder, value: &dyn Any) -> Result<(), Error> {
    let bytes = value.downcast_ref::<Vec<u8>>().ok_or(Error::InvalidParam)?;
    write_bytes(enc, bytes)
}

/// Output of the `checksum` procedure: length and FNV-1a of the input blob.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy)]
pub struct ChecksumOut {
    pub len: u32,
    pub sum: u32,
}

pub fn decode_checksum(op: &mut DecodeOp<'_, '_>, value: &mut dyn Any) -> Result<(), Error> {
    let out = value.downcast_mut::<ChecksumOut>().ok_or(Error::InvalidParam)?;
    match op {
        DecodeOp::Decode(dec) => {
            out.len = dec.read_u32::<LittleEndian>()?;
            out.sum = dec.read_u32::<LittleEndian>()?;
            Ok(())
        }
        DecodeOp::Release => Ok(()),
    }
}

// ---- test responder --------------------------------------------------------

/// The responder side of the fabric: a thread that serves `echo`,
/// `reverse`, and `checksum` requests at the network abstraction level,
/// including fetching spilled inputs over RMA.
pub struct TestResponder {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    pub uri: String,
}

impl TestResponder {
    pub fn spawn(fabric: &LoopbackFabric, name: &str) -> TestResponder {
        let transport = fabric.open(name).expect("open responder endpoint");
        let uri = transport.uri().to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || serve(transport, thread_stop));
        TestResponder { stop, handle: Some(handle), uri }
    }
}

impl Drop for TestResponder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.join().expect("responder thread panicked");
        }
    }
}

fn serve(transport: Arc<LoopbackTransport>, stop: Arc<AtomicBool>) {
    let ep = Arc::new(Endpoint::new(transport as Arc<dyn Transport>));
    let (tx, rx) = channel::<Completion>();
    post_request_recv(&ep, tx.clone());

    while !stop.load(Ordering::Acquire) {
        match ep.progress(Duration::from_millis(20)) {
            Ok(()) | Err(Error::Timeout) => {}
            Err(e) => panic!("responder progress failed: {e}"),
        }
        while let Ok(completion) = rx.try_recv() {
            handle_request(&ep, completion);
            post_request_recv(&ep, tx.clone());
        }
    }
}

fn post_request_recv(ep: &Arc<Endpoint>, tx: Sender<Completion>) {
    let buf = vec![0_u8; ep.max_unexpected_size()];
    ep.msg_recv_unexpected(buf, Box::new(move |c| {
        tx.send(c).ok();
    }))
    .expect("post unexpected receive");
}

fn handle_request(ep: &Arc<Endpoint>, completion: Completion) {
    assert!(completion.result.is_ok(), "request receive failed: {completion:?}");
    let source = completion.source.clone().expect("request carries its source");
    let tag = completion.tag;
    let buffer = completion.buffer.as_ref().expect("request carries a payload");
    let data = &buffer[..completion.actual_size];

    let header = RequestHeader::decode(data).expect("request header");
    let input = match &header.extra {
        Some(remote) => fetch_extra(ep, remote, &source),
        None => data[REQUEST_HEADER_SIZE..].to_vec(),
    };

    let (status, payload) = dispatch(header.id, &input);
    respond(ep, &source, tag, header.id, status, &payload);
}

/// Pulls a spilled input out of the caller's extra buffer with a one-sided
/// read through a registered bounce buffer.
fn fetch_extra(ep: &Arc<Endpoint>, remote: &MemHandle, source: &Addr) -> Vec<u8> {
    let len = remote.len();
    let mut local = MemHandle::create(vec![0_u8; len], MemAccess::ReadWrite);
    ep.mem_register(&mut local).expect("register bounce buffer");

    let (tx, rx) = channel();
    ep.get(&local, 0, remote, 0, len, source, Box::new(move |c: Completion| {
        tx.send(c.result).ok();
    }))
    .expect("post RMA get");
    let result = loop {
        if let Ok(result) = rx.try_recv() {
            break result;
        }
        match ep.progress(Duration::from_millis(200)) {
            Ok(()) | Err(Error::Timeout) => {}
            Err(e) => panic!("responder progress failed during get: {e}"),
        }
    };
    result.expect("RMA get completes");

    let bytes = local.to_vec().expect("read bounce buffer");
    ep.mem_deregister(&mut local).expect("deregister bounce buffer");
    bytes
}

/// The three procedures the responder implements, dispatched by call id.
fn dispatch(id: ProcId, input: &[u8]) -> (Result<(), Error>, Vec<u8>) {
    if id == name_id("echo") {
        // The output encoding of echo is its input encoding, verbatim.
        (Ok(()), input.to_vec())
    } else if id == name_id("reverse") {
        let mut dec = fabric_rpc::rpc::proc::Decoder::new(input);
        let mut bytes = match read_bytes(&mut dec) {
            Ok(bytes) => bytes,
            Err(e) => return (Err(e), Vec::new()),
        };
        bytes.reverse();
        let mut enc = Encoder::with_capacity(input.len() + 8);
        write_bytes(&mut enc, &bytes).expect("re-encode reversed bytes");
        let (payload, extra) = enc.into_parts();
        assert!(extra.is_none(), "response payloads never spill");
        (Ok(()), payload)
    } else if id == name_id("checksum") {
        let mut dec = fabric_rpc::rpc::proc::Decoder::new(input);
        let bytes = match read_bytes(&mut dec) {
            Ok(bytes) => bytes,
            Err(e) => return (Err(e), Vec::new()),
        };
        let len = (bytes.len() as u32).to_le_bytes();
        let sum = fnv1a(&bytes).to_le_bytes();
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&len);
        payload.extend_from_slice(&sum);
        (Ok(()), payload)
    } else {
        (Err(Error::NoMatch), Vec::new())
    }
}

fn respond(
    ep: &Arc<Endpoint>,
    source: &Addr,
    tag: u32,
    id: ProcId,
    status: Result<(), Error>,
    payload: &[u8],
) {
    let mut resp = vec![0_u8; RESPONSE_HEADER_SIZE];
    ResponseHeader::new(id, status).encode(&mut resp).expect("response header");
    resp.extend_from_slice(payload);
    ep.msg_send_expected(source, tag, resp, Box::new(|_| {}))
        .expect("post response send");
}

// ---- misc helpers ----------------------------------------------------------

/// A completion callback that forwards into a channel, plus the receiver
/// to assert on.
pub fn capture() -> (
    fabric_rpc::net::Callback,
    std::sync::mpsc::Receiver<Completion>,
) {
    let (tx, rx) = channel();
    let cb: fabric_rpc::net::Callback = Box::new(move |c| {
        tx.send(c).ok();
    });
    (cb, rx)
}

/// Drives one event, panicking if nothing arrives within a test-friendly
/// deadline.
pub fn drive(ep: &Endpoint) {
    ep.progress(Duration::from_millis(500)).expect("expected an event to handle");
}

/// Asserts the endpoint has nothing to do right now.
pub fn assert_idle(ep: &Endpoint) {
    assert_eq!(ep.progress(Duration::from_millis(50)), Err(Error::Timeout));
}

/// Synchronous wrapper around the callback-carried address lookup.
pub fn lookup(ep: &Endpoint, uri: &str) -> Addr {
    let (tx, rx) = channel();
    ep.addr_lookup(uri, move |result| {
        tx.send(result).ok();
    })
    .expect("post lookup");
    rx.recv_timeout(Duration::from_secs(1))
        .expect("lookup completes")
        .expect("lookup succeeds")
}
