//! The RPC runtime and its forwarding engine.
//!
//! A [`Runtime`] owns one network endpoint, the function registry, and the
//! tag generator. Forwarding a call runs the whole request state machine:
//!
//! 1. Encode the typed input behind the request header, spilling oversize
//!    encodings into an RMA-readable extra buffer.
//! 2. Pre-post the expected receive for the response under a fresh tag.
//! 3. Post the unexpected send carrying the header and inline payload.
//! 4. On send completion, drop the request message buffer.
//! 5. On response arrival, release the extra buffer, verify the response
//!    header, and decode the output into the request record.
//!
//! A request is complete once both sub-operations have fired, in either
//! order; `wait` drives endpoint progress until they have.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::net::{Addr, Callback, Completion, Endpoint, MemAccess, MemHandle, Transport};

pub mod header;
pub mod proc;
pub mod registry;

mod request;
mod tag;

pub use registry::{name_id, ProcId};
pub use request::Request;

use header::{RequestHeader, ResponseHeader, REQUEST_HEADER_SIZE, RESPONSE_HEADER_SIZE};
use proc::{DecodeFn, DecodeOp, Decoder, Encoder};
use registry::Registry;
use request::{record_error, CompletionFlag, ErrorSlot};
use tag::TagGenerator;

/// The RPC runtime: everything process-wide lives here, created by
/// [`Runtime::init`] and torn down by [`Runtime::finalize`].
pub struct Runtime {
    endpoint: Arc<Endpoint>,
    registry: Registry,
    tags: TagGenerator,
    active: AtomicBool,
}

impl Runtime {
    /// Brings up a runtime over a transport endpoint.
    pub fn init(transport: Arc<dyn Transport>) -> Result<Runtime, Error> {
        let endpoint = Arc::new(Endpoint::new(transport));
        if endpoint.max_tag() == 0 {
            // With no usable tag space every request would pair with every
            // other; refuse to run.
            return Err(Error::InvalidParam);
        }
        let tags = TagGenerator::new(endpoint.max_tag());
        info!(uri = endpoint.uri(), "runtime initialized");
        Ok(Runtime {
            endpoint,
            registry: Registry::new(),
            tags,
            active: AtomicBool::new(true),
        })
    }

    /// Whether the runtime is between `init` and a successful `finalize`.
    pub fn initialized(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Shuts the runtime down. Fails with `Protocol` while unexpected
    /// receives are still posted; the call can be retried once they have
    /// been delivered or cancelled. Finalizing twice is a no-op.
    pub fn finalize(&self) -> Result<(), Error> {
        if !self.initialized() {
            return Ok(());
        }
        self.endpoint.check_drained()?;
        self.active.store(false, Ordering::Release);
        info!("runtime finalized");
        Ok(())
    }

    /// The crate version as (major, minor, patch).
    pub fn version() -> (u32, u32, u32) {
        let component = |s: &str| s.parse().expect("cargo package version component");
        (
            component(env!("CARGO_PKG_VERSION_MAJOR")),
            component(env!("CARGO_PKG_VERSION_MINOR")),
            component(env!("CARGO_PKG_VERSION_PATCH")),
        )
    }

    /// The network endpoint this runtime drives. Responder-side code posts
    /// its unexpected receives and RMA transfers straight on the endpoint.
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Resolves a peer URI; see [`Endpoint::addr_lookup`].
    pub fn addr_lookup(
        &self,
        uri: &str,
        cb: impl FnOnce(Result<Addr, Error>) + Send + 'static,
    ) -> Result<crate::net::OpId, Error> {
        self.endpoint.addr_lookup(uri, cb)
    }

    /// The address of this process itself.
    pub fn addr_self(&self) -> Addr {
        self.endpoint.addr_self()
    }

    /// Registers a procedure name with its input encoder and output
    /// decoder, returning the stable call id both sides derive from the
    /// name.
    pub fn register(
        &self,
        name: &str,
        encode: proc::EncodeFn,
        decode: proc::DecodeFn,
    ) -> Result<ProcId, Error> {
        if !self.initialized() {
            return Err(Error::InvalidParam);
        }
        self.registry.register(name, encode, decode)
    }

    /// Whether `name` is registered, along with the id it hashes to.
    pub fn registered(&self, name: &str) -> (bool, ProcId) {
        self.registry.registered(name)
    }

    /// Drives the endpoint for up to `timeout`; see [`Endpoint::progress`].
    pub fn progress(&self, timeout: Duration) -> Result<(), Error> {
        self.endpoint.progress(timeout)
    }

    /// Forwards a call to `dest`.
    ///
    /// `input` is encoded immediately; `output` is the value the response
    /// decoder will fill, owned by the returned [`Request`] until read with
    /// [`Request::with_output`]. The call is outstanding until `wait`
    /// reports it complete.
    pub fn forward(
        &self,
        dest: &Addr,
        id: ProcId,
        input: &dyn Any,
        output: Box<dyn Any + Send>,
    ) -> Result<Request, Error> {
        if !self.initialized() {
            return Err(Error::InvalidParam);
        }
        let (encode, decode) = self.registry.lookup(id).ok_or(Error::NoMatch)?;

        // The in-message region is what fits in an unexpected message after
        // the request header.
        let head_capacity = self
            .endpoint
            .max_unexpected_size()
            .checked_sub(REQUEST_HEADER_SIZE)
            .ok_or(Error::Size)?;
        let mut encoder = Encoder::with_capacity(head_capacity);
        encode(&mut encoder, input)?;
        debug!(
            id = id.0,
            size = encoder.encoded_size(),
            spilled = encoder.spilled(),
            "input encoded"
        );
        let (inline, extra) = encoder.into_parts();

        // An oversize input travels through a read-only RMA region; the
        // callee fetches it with the descriptor carried in the header.
        let extra_handle = match extra {
            Some(extra_buf) => {
                let mut handle = MemHandle::create(extra_buf, MemAccess::ReadOnly);
                self.endpoint.mem_register(&mut handle)?;
                Some(handle)
            }
            None => None,
        };
        let used_extra = extra_handle.is_some();

        let header = RequestHeader { id, extra: extra_handle.clone() };
        let mut send_buf = vec![0_u8; REQUEST_HEADER_SIZE];
        if let Err(e) = header.encode(&mut send_buf) {
            if let Some(mut handle) = extra_handle {
                let _ = self.endpoint.mem_deregister(&mut handle);
            }
            return Err(e);
        }
        send_buf.extend_from_slice(&inline);

        // One tag pairs the pre-posted response receive with the request
        // send.
        let tag = self.tags.next();
        let recv_buf = vec![0_u8; self.endpoint.max_expected_size()];
        let output_slot: Arc<Mutex<Box<dyn Any + Send>>> = Arc::new(Mutex::new(output));
        let error_slot: ErrorSlot = Arc::new(Mutex::new(None));
        let send_flag = CompletionFlag::new();
        let recv_flag = CompletionFlag::new();

        let ep = Arc::clone(&self.endpoint);
        let recv_error = Arc::clone(&error_slot);
        let recv_done_flag = Arc::clone(&recv_flag);
        let recv_output = Arc::clone(&output_slot);
        let mut recv_extra = extra_handle;
        let recv_cb: Callback = Box::new(move |completion: Completion| {
            // The responder no longer references the extra buffer once the
            // response is in; release it before touching the payload.
            if let Some(handle) = recv_extra.as_mut() {
                if let Err(e) = ep.mem_deregister(handle) {
                    warn!(error = %e, "could not release extra buffer handle");
                }
            }
            if let Err(e) = decode_response(decode, id, &completion, &recv_output) {
                warn!(id = id.0, error = %e, "response handling failed");
                record_error(&recv_error, e);
            }
            recv_done_flag.complete();
        });
        let rx_op = self.endpoint.msg_recv_expected(dest, tag, recv_buf, recv_cb)?;

        let send_error = Arc::clone(&error_slot);
        let send_done_flag = Arc::clone(&send_flag);
        let send_cb: Callback = Box::new(move |completion: Completion| {
            if let Err(e) = completion.result {
                record_error(&send_error, e);
            }
            // The request message buffer is dropped with the completion.
            send_done_flag.complete();
        });
        if let Err(e) = self.endpoint.msg_send_unexpected(dest, tag, send_buf, send_cb) {
            // Unwind the pre-posted receive; its cancellation also releases
            // the extra buffer.
            if let Err(cancel_err) = self.endpoint.cancel(rx_op) {
                warn!(error = %cancel_err, "could not unwind pre-posted receive");
            }
            return Err(e);
        }

        trace!(id = id.0, tag, "request forwarded");
        Ok(Request {
            id,
            tag,
            decode,
            output: output_slot,
            send_flag,
            recv_flag,
            error: error_slot,
            used_extra,
        })
    }

    /// Waits until `request` is complete, driving progress, with elapsed
    /// time charged against `timeout`. Returns the first error the request
    /// observed, or `Timeout` if the deadline passes first (the request
    /// stays outstanding).
    pub fn wait(&self, request: &Request, timeout: Duration) -> Result<(), Error> {
        self.wait_until(request, deadline_after(timeout))
    }

    /// Waits on every request in turn, applying one shared deadline.
    pub fn wait_all(&self, requests: &[Request], timeout: Duration) -> Vec<Result<(), Error>> {
        let deadline = deadline_after(timeout);
        requests.iter().map(|request| self.wait_until(request, deadline)).collect()
    }

    fn wait_until(&self, request: &Request, deadline: Instant) -> Result<(), Error> {
        // Send sub-operation first, then receive; completion order on the
        // wire is not guaranteed, but waiting is.
        for flag in [&request.send_flag, &request.recv_flag] {
            while !flag.is_complete() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::Timeout);
                }
                self.endpoint.progress(remaining)?;
            }
        }
        match request.first_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Releases a completed request: the output codec runs once more in
    /// release mode so it can drop heap it allocated, then the record goes
    /// away. Rejected while either sub-operation is still outstanding.
    pub fn request_free(&self, request: Request) -> Result<(), Error> {
        if !request.is_complete() {
            warn!(id = request.id().0, "request freed while still outstanding");
            return Err(Error::InvalidParam);
        }
        let mut output = request.output.lock().expect("request output slot poisoned");
        let value: &mut dyn Any = output.as_mut();
        (request.decode)(&mut DecodeOp::Release, value)?;
        Ok(())
    }
}

/// Computes the deadline for a wait, saturating far in the future if the
/// timeout is enormous.
fn deadline_after(timeout: Duration) -> Instant {
    Instant::now()
        .checked_add(timeout)
        .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
}

/// The receive half of a forwarded call: header verification and output
/// decoding, applied to the response completion.
fn decode_response(
    decode: DecodeFn,
    id: ProcId,
    completion: &Completion,
    output: &Arc<Mutex<Box<dyn Any + Send>>>,
) -> Result<(), Error> {
    completion.result?;
    let buffer = completion.buffer.as_ref().ok_or(Error::Protocol)?;
    let data = buffer.get(..completion.actual_size).ok_or(Error::Protocol)?;
    let header = ResponseHeader::decode(data)?;
    header.verify(id)?;
    let mut decoder = Decoder::new(&data[RESPONSE_HEADER_SIZE..]);
    let mut output = output.lock().expect("request output slot poisoned");
    let value: &mut dyn Any = output.as_mut();
    decode(&mut DecodeOp::Decode(&mut decoder), value)
}
