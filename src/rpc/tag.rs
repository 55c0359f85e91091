//! Tag allocation for pairing a request with its response.

use std::sync::atomic::{AtomicU32, Ordering};

/// A shared wrapping counter over `[0, max_tag]`.
///
/// Tags are only guaranteed unique between a send and its matching receive
/// issued close together in time; over long horizons values repeat.
pub struct TagGenerator {
    next: AtomicU32,
    max_tag: u32,
}

impl TagGenerator {
    pub fn new(max_tag: u32) -> TagGenerator {
        TagGenerator { next: AtomicU32::new(1), max_tag }
    }

    /// Returns the counter's current value and advances it, wrapping back
    /// to zero past `max_tag`. The advance is a compare-and-swap loop so
    /// concurrent callers never observe a value outside the tag space.
    pub fn next(&self) -> u32 {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let successor = if current >= self.max_tag { 0 } else { current + 1 };
            match self.next.compare_exchange_weak(
                current,
                successor,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(seen) => current = seen,
            }
        }
    }
}
