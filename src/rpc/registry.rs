//! The function registry: procedure names hashed to stable 32-bit call ids,
//! each mapped to its input/output codec pair.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, error};

use crate::error::Error;

use super::proc::{DecodeFn, EncodeFn};

/// Stable identifier of a registered procedure, derived from its name. Both
/// ends of a connection derive the same id from the same name.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcId(pub u32);

/// FNV-1a, 32 bit. Stable across processes and platforms, which the
/// standard hasher deliberately is not.
pub(crate) fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// The call id a procedure name hashes to, whether or not it is registered.
/// Responders use this to dispatch on ids derived by their callers.
pub fn name_id(name: &str) -> ProcId {
    ProcId(fnv1a(name.as_bytes()))
}

struct ProcEntry {
    name: String,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Maps call ids to codec pairs.
pub(crate) struct Registry {
    procs: RwLock<HashMap<u32, ProcEntry>>,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry { procs: RwLock::new(HashMap::new()) }
    }

    /// Registers `name` with its codec pair and returns the call id.
    /// Re-registering the same name replaces the codecs; two distinct names
    /// hashing to the same id is a fatal registration error.
    pub(crate) fn register(
        &self,
        name: &str,
        encode: EncodeFn,
        decode: DecodeFn,
    ) -> Result<ProcId, Error> {
        let id = name_id(name);
        let mut procs = self.procs.write().expect("registry lock poisoned");
        if let Some(existing) = procs.get(&id.0) {
            if existing.name != name {
                error!(name, collides_with = %existing.name, id = id.0, "call id collision");
                return Err(Error::Fail);
            }
        }
        debug!(name, id = id.0, "registered procedure");
        procs.insert(id.0, ProcEntry { name: name.to_string(), encode, decode });
        Ok(id)
    }

    /// Whether `name` is registered, along with the id it hashes to.
    pub(crate) fn registered(&self, name: &str) -> (bool, ProcId) {
        let id = name_id(name);
        let procs = self.procs.read().expect("registry lock poisoned");
        let present = procs.get(&id.0).is_some_and(|entry| entry.name == name);
        (present, id)
    }

    /// The codec pair registered under `id`.
    pub(crate) fn lookup(&self, id: ProcId) -> Option<(EncodeFn, DecodeFn)> {
        let procs = self.procs.read().expect("registry lock poisoned");
        procs.get(&id.0).map(|entry| (entry.encode, entry.decode))
    }
}
