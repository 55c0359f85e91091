//! The stable status codes surfaced by every operation in this crate.
//!
//! Each variant has a fixed numeric value that also travels on the wire in
//! response headers, so the enumeration must stay stable across releases and
//! across the two ends of a connection. Code 0 is reserved for success and is
//! never represented as an [`Error`] variant.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive as _;
use thiserror::Error;

/// Wire status code carried in a response header for a successful call.
pub const STATUS_SUCCESS: u32 = 0;

/// The possible failures that can arise from posting, progressing, or
/// completing an operation.
///
/// The numeric values are part of the wire protocol (response header status
/// field) and of the public API (`error_string`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum Error {
    /// Generic failure with no more precise classification.
    #[error("operation failed")]
    Fail = 1,

    /// A deadline elapsed before any event could be processed. Recoverable:
    /// the affected operation is still outstanding.
    #[error("operation timed out")]
    Timeout = 2,

    /// A caller-supplied argument was null, out of range, or used in the
    /// wrong lifecycle state.
    #[error("invalid parameter")]
    InvalidParam = 3,

    /// A buffer was too small for the data it had to carry.
    #[error("buffer too small")]
    Size = 4,

    /// An allocation request could not be satisfied.
    #[error("out of memory")]
    NoMem = 5,

    /// A transport-level failure, a malformed or mismatched header, or a
    /// lifecycle rule violation (for example finalizing with posted
    /// receives still pending).
    #[error("protocol error")]
    Protocol = 6,

    /// A name or identifier lookup found nothing.
    #[error("no match found")]
    NoMatch = 7,

    /// Response header verification failed.
    #[error("checksum mismatch")]
    Checksum = 8,

    /// A registered-memory handle lacks the access required by the
    /// requested RMA operation.
    #[error("insufficient permission")]
    Permission = 9,
}

impl Error {
    /// The wire status code for this error.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decodes a wire status code. Returns `Ok(())` for [`STATUS_SUCCESS`],
    /// the matching error for a known code, and [`Error::Protocol`] for a
    /// code this build does not know.
    pub fn from_code(code: u32) -> Result<(), Error> {
        if code == STATUS_SUCCESS {
            return Ok(());
        }
        Err(Error::from_u32(code).unwrap_or(Error::Protocol))
    }
}

/// Returns a human-readable description for a wire status code, including
/// the success code.
pub fn error_string(code: u32) -> &'static str {
    if code == STATUS_SUCCESS {
        return "success";
    }
    match Error::from_u32(code) {
        Some(Error::Fail) => "operation failed",
        Some(Error::Timeout) => "operation timed out",
        Some(Error::InvalidParam) => "invalid parameter",
        Some(Error::Size) => "buffer too small",
        Some(Error::NoMem) => "out of memory",
        Some(Error::Protocol) => "protocol error",
        Some(Error::NoMatch) => "no match found",
        Some(Error::Checksum) => "checksum mismatch",
        Some(Error::Permission) => "insufficient permission",
        None => "unrecognized status code",
    }
}

/// I/O failures inside codecs map onto the stable code set: a short read is
/// a size problem, anything else is a protocol problem.
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::Size,
            _ => Error::Protocol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Fail.code(), 1);
        assert_eq!(Error::Timeout.code(), 2);
        assert_eq!(Error::InvalidParam.code(), 3);
        assert_eq!(Error::Size.code(), 4);
        assert_eq!(Error::NoMem.code(), 5);
        assert_eq!(Error::Protocol.code(), 6);
        assert_eq!(Error::NoMatch.code(), 7);
        assert_eq!(Error::Checksum.code(), 8);
        assert_eq!(Error::Permission.code(), 9);
    }

    #[test]
    fn round_trips_through_wire_codes() {
        for code in 1..=9 {
            let err = Error::from_code(code).expect_err("non-zero code is an error");
            assert_eq!(err.code(), code);
        }
        assert_eq!(Error::from_code(STATUS_SUCCESS), Ok(()));
        assert_eq!(Error::from_code(9999), Err(Error::Protocol));
    }

    #[test]
    fn describes_every_code() {
        assert_eq!(error_string(STATUS_SUCCESS), "success");
        assert_eq!(error_string(2), "operation timed out");
        assert_eq!(error_string(9999), "unrecognized status code");
    }

    #[test]
    fn maps_io_errors() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(Error::from(eof), Error::Size);
        let other = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(Error::from(other), Error::Protocol);
    }
}
