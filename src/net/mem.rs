//! Registered-memory handles for one-sided RMA.
//!
//! A handle describes a memory region a peer may read (and, with the right
//! access mode, write) without involving the target CPU. Local handles own
//! their region; handles deserialized from a peer carry only the descriptor.
//! A handle must be registered with an endpoint before it can take part in
//! a put or a get, and its serialized image is a fixed-size byte string that
//! can be copied into a message verbatim.

use byteorder::ByteOrder;
use num_traits::FromPrimitive as _;
use std::sync::{Arc, RwLock};

use crate::error::Error;

use super::frame::WireEndian;
use super::transport::MemAccess;

/// Size in bytes of a serialized handle image:
/// descriptor key (8) + region size (8) + access mode (4).
pub const HANDLE_SERIALIZED_SIZE: usize = 20;

/// Descriptor key meaning "no handle"; used as the sentinel in headers that
/// carry an optional handle slot. Transports never hand out key 0.
pub const KEY_NONE: u64 = 0;

/// A handle over a memory region usable in RMA operations.
#[derive(Clone)]
pub struct MemHandle {
    region: Option<Arc<RwLock<Vec<u8>>>>,
    len: usize,
    access: MemAccess,
    key: u64,
}

impl MemHandle {
    /// Creates an unregistered handle shell over a local buffer. The handle
    /// takes ownership of the buffer; the bytes become shared once the
    /// handle is registered and its image travels to a peer.
    pub fn create(buf: Vec<u8>, access: MemAccess) -> MemHandle {
        let len = buf.len();
        MemHandle {
            region: Some(Arc::new(RwLock::new(buf))),
            len,
            access,
            key: KEY_NONE,
        }
    }

    /// Length in bytes of the described region.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Access mode granted to remote peers.
    pub fn access(&self) -> MemAccess {
        self.access
    }

    /// Whether the handle is currently bound to an endpoint.
    pub fn is_registered(&self) -> bool {
        self.key != KEY_NONE
    }

    /// Whether this handle was deserialized from a peer and carries no
    /// local storage.
    pub fn is_remote(&self) -> bool {
        self.region.is_none()
    }

    /// The transport descriptor key, [`KEY_NONE`] while unregistered.
    pub fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn set_key(&mut self, key: u64) {
        self.key = key;
    }

    pub(crate) fn region(&self) -> Option<&Arc<RwLock<Vec<u8>>>> {
        self.region.as_ref()
    }

    /// Copies bytes out of a local region into `dst`. Local read access is
    /// always permitted, whatever the remote access mode says.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), Error> {
        let region = self.region.as_ref().ok_or(Error::InvalidParam)?;
        let bytes = region.read().expect("memory region lock poisoned");
        let end = offset.checked_add(dst.len()).ok_or(Error::Size)?;
        if end > bytes.len() {
            return Err(Error::Size);
        }
        dst.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }

    /// Copies the whole local region out into a fresh vector.
    pub fn to_vec(&self) -> Result<Vec<u8>, Error> {
        let mut out = vec![0_u8; self.len];
        self.read(0, &mut out)?;
        Ok(out)
    }

    /// Writes the fixed-size handle image into the front of `buf`. The
    /// handle must be registered first; an unregistered descriptor would
    /// be meaningless on the remote side.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<(), Error> {
        if !self.is_registered() {
            return Err(Error::InvalidParam);
        }
        if buf.len() < HANDLE_SERIALIZED_SIZE {
            return Err(Error::Size);
        }
        WireEndian::write_u64(&mut buf[0..8], self.key);
        WireEndian::write_u64(&mut buf[8..16], self.len as u64);
        WireEndian::write_u32(&mut buf[16..20], self.access as u32);
        Ok(())
    }

    /// Reconstructs a remote handle from a serialized image.
    pub fn deserialize(buf: &[u8]) -> Result<MemHandle, Error> {
        if buf.len() < HANDLE_SERIALIZED_SIZE {
            return Err(Error::Size);
        }
        let key = WireEndian::read_u64(&buf[0..8]);
        if key == KEY_NONE {
            return Err(Error::InvalidParam);
        }
        let len = WireEndian::read_u64(&buf[8..16]);
        let access =
            MemAccess::from_u32(WireEndian::read_u32(&buf[16..20])).ok_or(Error::Protocol)?;
        Ok(MemHandle {
            region: None,
            len: usize::try_from(len).map_err(|_| Error::Size)?,
            access,
            key,
        })
    }
}

impl std::fmt::Debug for MemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MemHandle")
            .field("len", &self.len)
            .field("access", &self.access)
            .field("key", &self.key)
            .field("remote", &self.is_remote())
            .finish()
    }
}
