//! Request records and the completion flags they wait on.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;

use super::proc::DecodeFn;
use super::registry::ProcId;

/// A once-only completion flag. One is created per sub-operation of a
/// request (send, receive); the operation's callback completes it, and the
/// wait path polls it while driving progress.
pub(crate) struct CompletionFlag {
    done: AtomicBool,
}

impl CompletionFlag {
    pub(crate) fn new() -> Arc<CompletionFlag> {
        Arc::new(CompletionFlag { done: AtomicBool::new(false) })
    }

    pub(crate) fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Shared slot recording the first error a request's sub-operations
/// observe; later errors are dropped.
pub(crate) type ErrorSlot = Arc<Mutex<Option<Error>>>;

pub(crate) fn record_error(slot: &ErrorSlot, error: Error) {
    let mut slot = slot.lock().expect("request error slot poisoned");
    if slot.is_none() {
        *slot = Some(error);
    }
}

/// One forwarded call.
///
/// A request is complete once both its sub-operations, the request send
/// and the response receive, have fired in either order. The decoded
/// output stays inside the record until read through
/// [`Request::with_output`].
pub struct Request {
    pub(crate) id: ProcId,
    pub(crate) tag: u32,
    pub(crate) decode: DecodeFn,
    pub(crate) output: Arc<Mutex<Box<dyn Any + Send>>>,
    pub(crate) send_flag: Arc<CompletionFlag>,
    pub(crate) recv_flag: Arc<CompletionFlag>,
    pub(crate) error: ErrorSlot,
    pub(crate) used_extra: bool,
}

impl Request {
    /// The call id this request was forwarded under.
    pub fn id(&self) -> ProcId {
        self.id
    }

    /// The tag pairing this request with its response.
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Whether the input was large enough to travel through an RMA-exposed
    /// extra buffer instead of the request message.
    pub fn used_extra_buffer(&self) -> bool {
        self.used_extra
    }

    /// Whether both sub-operations have fired. A complete request may still
    /// have failed; `wait` reports the first error observed.
    pub fn is_complete(&self) -> bool {
        self.send_flag.is_complete() && self.recv_flag.is_complete()
    }

    pub(crate) fn first_error(&self) -> Option<Error> {
        *self.error.lock().expect("request error slot poisoned")
    }

    /// Reads the decoded output. Only valid once the request is complete;
    /// the closure runs with the output borrowed in place.
    pub fn with_output<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, Error> {
        if !self.is_complete() {
            return Err(Error::InvalidParam);
        }
        let output = self.output.lock().expect("request output slot poisoned");
        let value = output.downcast_ref::<T>().ok_or(Error::InvalidParam)?;
        Ok(f(value))
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("complete", &self.is_complete())
            .field("used_extra", &self.used_extra)
            .finish()
    }
}
