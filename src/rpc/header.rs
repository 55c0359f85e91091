//! Request and response headers.
//!
//! Both headers sit right after the framing word, before any user-encoded
//! payload, and have fixed layouts:
//!
//! Request: `magic u32 | version u32 | call id u32 | flags u32 | handle
//! image (20 bytes)`. The handle image carries the extra-buffer descriptor
//! when the encoded input spilled; otherwise the slot holds the sentinel
//! key and the flags bit is clear.
//!
//! Response: `magic u32 | version u32 | call id u32 | status u32 |
//! checksum u32`, the checksum being FNV-1a over the preceding sixteen
//! bytes. All words are little-endian.

use byteorder::ByteOrder;

use crate::error::{Error, STATUS_SUCCESS};
use crate::net::frame::WireEndian;
use crate::net::mem::{MemHandle, HANDLE_SERIALIZED_SIZE, KEY_NONE};

use super::registry::{fnv1a, ProcId};

/// Protocol magic, first word of both headers.
pub const MAGIC: u32 = 0x4652_5043;

/// Header layout version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request flag: the handle slot carries a live extra-buffer descriptor.
const FLAG_EXTRA_BUFFER: u32 = 1;

/// Serialized size of a request header.
pub const REQUEST_HEADER_SIZE: usize = 16 + HANDLE_SERIALIZED_SIZE;

/// Serialized size of a response header.
pub const RESPONSE_HEADER_SIZE: usize = 20;

/// Header written at the front of every forwarded request.
pub struct RequestHeader {
    pub id: ProcId,
    /// Descriptor of the RMA-readable extra buffer, when the encoded input
    /// was too large for the unexpected message.
    pub extra: Option<MemHandle>,
}

impl RequestHeader {
    /// Writes the header into the front of `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() < REQUEST_HEADER_SIZE {
            return Err(Error::Size);
        }
        WireEndian::write_u32(&mut buf[0..4], MAGIC);
        WireEndian::write_u32(&mut buf[4..8], PROTOCOL_VERSION);
        WireEndian::write_u32(&mut buf[8..12], self.id.0);
        match &self.extra {
            Some(handle) => {
                WireEndian::write_u32(&mut buf[12..16], FLAG_EXTRA_BUFFER);
                handle.serialize(&mut buf[16..REQUEST_HEADER_SIZE])?;
            }
            None => {
                WireEndian::write_u32(&mut buf[12..16], 0);
                buf[16..REQUEST_HEADER_SIZE].fill(0);
            }
        }
        Ok(())
    }

    /// Parses and validates the header at the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<RequestHeader, Error> {
        if buf.len() < REQUEST_HEADER_SIZE {
            return Err(Error::Protocol);
        }
        if WireEndian::read_u32(&buf[0..4]) != MAGIC
            || WireEndian::read_u32(&buf[4..8]) != PROTOCOL_VERSION
        {
            return Err(Error::Protocol);
        }
        let id = ProcId(WireEndian::read_u32(&buf[8..12]));
        let flags = WireEndian::read_u32(&buf[12..16]);
        let extra = if flags & FLAG_EXTRA_BUFFER != 0 {
            let handle = MemHandle::deserialize(&buf[16..REQUEST_HEADER_SIZE])?;
            Some(handle)
        } else {
            // The slot must hold the sentinel when the flag is clear.
            if WireEndian::read_u64(&buf[16..24]) != KEY_NONE {
                return Err(Error::Protocol);
            }
            None
        };
        Ok(RequestHeader { id, extra })
    }
}

/// Header written at the front of every response.
pub struct ResponseHeader {
    pub id: ProcId,
    pub status: u32,
}

impl ResponseHeader {
    /// A response header reporting `result` for call `id`.
    pub fn new(id: ProcId, result: Result<(), Error>) -> ResponseHeader {
        let status = match result {
            Ok(()) => STATUS_SUCCESS,
            Err(e) => e.code(),
        };
        ResponseHeader { id, status }
    }

    /// Writes the header, including its checksum, into the front of `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() < RESPONSE_HEADER_SIZE {
            return Err(Error::Size);
        }
        WireEndian::write_u32(&mut buf[0..4], MAGIC);
        WireEndian::write_u32(&mut buf[4..8], PROTOCOL_VERSION);
        WireEndian::write_u32(&mut buf[8..12], self.id.0);
        WireEndian::write_u32(&mut buf[12..16], self.status);
        let checksum = fnv1a(&buf[..16]);
        WireEndian::write_u32(&mut buf[16..20], checksum);
        Ok(())
    }

    /// Parses the header at the front of `buf`, validating magic, version,
    /// and checksum.
    pub fn decode(buf: &[u8]) -> Result<ResponseHeader, Error> {
        if buf.len() < RESPONSE_HEADER_SIZE {
            return Err(Error::Protocol);
        }
        if WireEndian::read_u32(&buf[0..4]) != MAGIC
            || WireEndian::read_u32(&buf[4..8]) != PROTOCOL_VERSION
        {
            return Err(Error::Protocol);
        }
        if WireEndian::read_u32(&buf[16..20]) != fnv1a(&buf[..16]) {
            return Err(Error::Checksum);
        }
        Ok(ResponseHeader {
            id: ProcId(WireEndian::read_u32(&buf[8..12])),
            status: WireEndian::read_u32(&buf[12..16]),
        })
    }

    /// Checks that the response answers call `expected` and reports
    /// success; a non-zero status surfaces as the matching error.
    pub fn verify(&self, expected: ProcId) -> Result<(), Error> {
        if self.id != expected {
            return Err(Error::Protocol);
        }
        Error::from_code(self.status)
    }
}
