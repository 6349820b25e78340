//! The range registry: an ordered, non-overlapping set of address ranges.
//!
//! Ranges live in a slot arena. Every registration stamps its slot with a
//! fresh generation from a monotonically increasing counter, so a
//! [`RangeRef`] taken before a removal can never resolve to whatever
//! reuses the slot afterwards. The counter is global, which also keeps a
//! handle issued by one registry from resolving in another.

use alloc::{collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use axerrno::AxError;
use thiserror::Error;

use crate::addr::IoAddress;
use crate::range::IoRange;

/// Registration failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// The new range intersects a registered one.
    #[error("range overlaps the one registered at {existing:#x}")]
    Overlap {
        /// Base of the registered range that was hit.
        existing: u64,
    },
    /// No range starts at the given base.
    #[error("no range registered at this base")]
    NotFound,
    /// The range is empty or runs past the end of the address space.
    #[error("empty or out-of-space range")]
    InvalidRange,
}

impl From<RangeError> for AxError {
    fn from(err: RangeError) -> Self {
        match err {
            RangeError::Overlap { .. } => AxError::AlreadyExists,
            RangeError::NotFound => AxError::NotFound,
            RangeError::InvalidRange => AxError::InvalidInput,
        }
    }
}

/// 0 is never handed out, so a retired slot never matches a handle.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Weak handle to a registered range.
///
/// Only valid while the range it was issued for is still registered;
/// [`RangeRegistry::get`] returns `None` afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRef {
    slot: usize,
    generation: u64,
}

struct Slot<A: IoAddress> {
    generation: u64,
    range: Option<IoRange<A>>,
}

/// Ordered collection of non-overlapping ranges.
pub struct RangeRegistry<A: IoAddress> {
    /// Range base -> slot index.
    index: BTreeMap<u64, usize>,
    slots: Vec<Slot<A>>,
    free: Vec<usize>,
}

impl<A: IoAddress> Default for RangeRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: IoAddress> RangeRegistry<A> {
    /// Create an empty registry.
    pub const fn new() -> Self {
        Self {
            index: BTreeMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Number of registered ranges.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Inserts `range`, failing with [`RangeError::Overlap`] if it intersects
    /// a registered range. The registry is left unchanged on failure.
    pub fn register(&mut self, range: IoRange<A>) -> Result<RangeRef, RangeError> {
        let start = range.start_raw();
        let end = match start.checked_add(range.len()) {
            Some(end) if range.len() > 0 && end <= A::LIMIT => end,
            _ => return Err(RangeError::InvalidRange),
        };

        // Only the closest neighbours on either side can intersect.
        if let Some((&base, &slot)) = self.index.range(..=start).next_back() {
            if self.slot_range(slot).end_raw() > start {
                return Err(RangeError::Overlap { existing: base });
            }
        }
        if let Some((&base, _)) = self.index.range(start..end).next() {
            return Err(RangeError::Overlap { existing: base });
        }

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Slot {
                    generation,
                    range: Some(range),
                };
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation,
                    range: Some(range),
                });
                self.slots.len() - 1
            }
        };
        self.index.insert(start, slot);
        Ok(RangeRef { slot, generation })
    }

    /// Removes the range starting exactly at `base` and returns it.
    ///
    /// Every [`RangeRef`] issued for it is dead once this returns.
    pub fn deregister(&mut self, base: A) -> Result<IoRange<A>, RangeError> {
        let slot = self
            .index
            .remove(&base.to_raw())
            .ok_or(RangeError::NotFound)?;
        let entry = &mut self.slots[slot];
        entry.generation = 0;
        let range = entry.range.take().ok_or(RangeError::NotFound)?;
        self.free.push(slot);
        Ok(range)
    }

    /// Returns the range whose `[base, base + len)` contains `addr`.
    pub fn find(&self, addr: A) -> Option<(RangeRef, &IoRange<A>)> {
        let raw = addr.to_raw();
        let (_, &slot) = self.index.range(..=raw).next_back()?;
        let entry = &self.slots[slot];
        let range = entry.range.as_ref()?;
        range.contains_raw(raw).then_some((
            RangeRef {
                slot,
                generation: entry.generation,
            },
            range,
        ))
    }

    /// Resolves a handle, or `None` if its range has been removed.
    #[inline]
    pub fn get(&self, handle: RangeRef) -> Option<&IoRange<A>> {
        let entry = self.slots.get(handle.slot)?;
        if entry.generation != handle.generation {
            return None;
        }
        entry.range.as_ref()
    }

    /// All ranges in ascending base order.
    pub fn iter(&self) -> impl Iterator<Item = &IoRange<A>> + '_ {
        self.index.values().map(|&slot| self.slot_range(slot))
    }

    fn slot_range(&self, slot: usize) -> &IoRange<A> {
        // Indexed slots always hold a range; `deregister` unindexes first.
        match self.slots[slot].range.as_ref() {
            Some(range) => range,
            None => unreachable!("indexed slot {slot} is empty"),
        }
    }
}
