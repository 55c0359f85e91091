//! Framing for request/response messages.
//!
//! Every message travelling through an endpoint is prefixed with a single
//! 32-bit word that the receive path inspects to route the payload:
//!
//! - bit 0: the expect flag (0 = unexpected traffic, 1 = expected traffic
//!   that a pre-posted receive will match by tag)
//! - bits 1..31: the tag pairing a send with its matching receive
//!
//! The payload follows immediately after the framing word.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Error;

/// Endianness used for every fixed-layout word this crate puts on the wire.
pub type WireEndian = LittleEndian;

/// Size of the framing word in bytes.
pub const FRAME_SIZE: usize = 4;

/// Largest tag value the framing word can carry (31 bits).
pub const FRAME_MAX_TAG: u32 = (1 << 31) - 1;

/// Encodes the framing word for a message.
pub fn encode(expect: bool, tag: u32) -> [u8; FRAME_SIZE] {
    debug_assert!(tag <= FRAME_MAX_TAG);
    let word = (tag << 1) | u32::from(expect);
    let mut buf = [0_u8; FRAME_SIZE];
    WireEndian::write_u32(&mut buf, word);
    buf
}

/// Decodes the framing word at the front of `buf`, returning the expect
/// flag and the tag.
pub fn decode(buf: &[u8]) -> Result<(bool, u32), Error> {
    if buf.len() < FRAME_SIZE {
        return Err(Error::Protocol);
    }
    let word = WireEndian::read_u32(&buf[..FRAME_SIZE]);
    Ok((word & 1 == 1, word >> 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_flag_and_tag() {
        for (expect, tag) in [(false, 0), (true, 0), (false, 7), (true, FRAME_MAX_TAG)] {
            let buf = encode(expect, tag);
            assert_eq!(decode(&buf), Ok((expect, tag)));
        }
    }

    #[test]
    fn expect_flag_is_the_low_bit() {
        let buf = encode(true, 0);
        assert_eq!(buf, [1, 0, 0, 0]);
        let buf = encode(false, 1);
        assert_eq!(buf, [2, 0, 0, 0]);
    }

    #[test]
    fn rejects_short_input() {
        assert_eq!(decode(&[0, 0, 0]), Err(Error::Protocol));
    }
}
