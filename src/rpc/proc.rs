//! Value encoding for call inputs and outputs.
//!
//! A registered procedure supplies two codec functions over type-erased
//! values: an encoder for the input and a decoder for the output. The
//! decoder is additionally invoked in *release* mode when a request record
//! is freed, so codecs that hand out heap-owning outputs get a chance to
//! drop them deliberately.
//!
//! [`Encoder`] writes into a capacity-bounded head buffer; the moment an
//! encoding outgrows it, the whole encoding relocates into an overflow
//! buffer (the "extra buffer") that the forwarding engine exposes to the
//! callee through RMA instead of the message payload. Both [`Encoder`] and
//! [`Decoder`] implement the standard I/O traits, so the `byteorder`
//! extension methods work on them directly.

use std::any::Any;
use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::error::Error;
use crate::net::frame::WireEndian;

/// Encodes a call input into the encoder. The value is downcast by the
/// codec itself; a wrong type reports `InvalidParam`.
pub type EncodeFn = fn(&mut Encoder, &dyn Any) -> Result<(), Error>;

/// Decodes (or releases) a call output. See [`DecodeOp`].
pub type DecodeFn = fn(&mut DecodeOp<'_, '_>, &mut dyn Any) -> Result<(), Error>;

/// One pass of an output codec over its value.
pub enum DecodeOp<'a, 'b> {
    /// Fill the value from the encoded response payload.
    Decode(&'a mut Decoder<'b>),
    /// Drop any heap the codec allocated into the value. Runs when the
    /// request record is freed; there is no payload to read.
    Release,
}

/// A capacity-bounded encoder with overflow spill.
pub struct Encoder {
    head: Vec<u8>,
    head_capacity: usize,
    extra: Vec<u8>,
    spilled: bool,
}

impl Encoder {
    /// An encoder whose in-message region holds at most `head_capacity`
    /// bytes before the encoding spills.
    pub fn with_capacity(head_capacity: usize) -> Encoder {
        Encoder {
            head: Vec::with_capacity(head_capacity),
            head_capacity,
            extra: Vec::new(),
            spilled: false,
        }
    }

    /// Total size of the encoding so far.
    pub fn encoded_size(&self) -> usize {
        if self.spilled {
            self.extra.len()
        } else {
            self.head.len()
        }
    }

    /// Whether the encoding outgrew the in-message region.
    pub fn spilled(&self) -> bool {
        self.spilled
    }

    /// Finishes the encoding: either the in-message bytes, or the overflow
    /// buffer carrying the whole encoding.
    pub fn into_parts(self) -> (Vec<u8>, Option<Vec<u8>>) {
        if self.spilled {
            (Vec::new(), Some(self.extra))
        } else {
            (self.head, None)
        }
    }
}

impl Write for Encoder {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.spilled {
            self.extra.extend_from_slice(buf);
        } else if self.head.len() + buf.len() <= self.head_capacity {
            self.head.extend_from_slice(buf);
        } else {
            // Relocate everything written so far: a spilled encoding lives
            // entirely in the extra buffer so the callee reads one region.
            self.spilled = true;
            self.extra = std::mem::take(&mut self.head);
            self.extra.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Reads an encoded payload front to back.
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Decoder<'a> {
        Decoder { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

impl Read for Decoder<'_> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf = &self.buf[n..];
        Ok(n)
    }
}

/// Writes a length-prefixed byte string.
pub fn write_bytes(enc: &mut Encoder, bytes: &[u8]) -> Result<(), Error> {
    let len = u32::try_from(bytes.len()).map_err(|_| Error::Size)?;
    enc.write_u32::<WireEndian>(len)?;
    enc.write_all(bytes)?;
    Ok(())
}

/// Reads a length-prefixed byte string.
pub fn read_bytes(dec: &mut Decoder) -> Result<Vec<u8>, Error> {
    let len = dec.read_u32::<WireEndian>()? as usize;
    if len > dec.remaining() {
        return Err(Error::Size);
    }
    let mut out = vec![0_u8; len];
    dec.read_exact(&mut out)?;
    Ok(out)
}
