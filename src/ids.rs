//! Wire level identifiers are plain u32 values. They are unique among the *live* identifiers of
//!  their category (client channels, server channels, operations) within one context, and they
//!  may be reused once the entity they identified is unregistered.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::PvaError;

/// client side channel id
pub type Cid = u32;
/// server side channel id
pub type Sid = u32;
/// id of a single in-flight operation (get, put, monitor, ...)
pub type Ioid = u32;

/// Upper bound for probing past live identifiers before giving up. Collisions only happen
///  after the counter wrapped around, so running into this bound means the registry is
///  pathologically full.
const MAX_ALLOCATION_ATTEMPTS: u32 = 1 << 20;

/// Hands out identifiers from a wrapping counter, skipping values that are still live. The
///  occupancy check is supplied by the caller, who typically holds the lock of the registry
///  the id is going to be inserted into.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl IdAllocator {
    pub fn starting_at(first: u32) -> IdAllocator {
        IdAllocator {
            next: AtomicU32::new(first),
        }
    }

    pub fn allocate(&self, is_live: impl Fn(u32) -> bool) -> Result<u32, PvaError> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            // fetch_add wraps around on overflow
            let candidate = self.next.fetch_add(1, Ordering::Relaxed);
            if !is_live(candidate) {
                return Ok(candidate);
            }
        }
        Err(PvaError::IdsExhausted)
    }
}
